use std::collections::{HashMap, HashSet};
use std::path::Path;

use config::{Config, Environment, File, FileFormat};
use grelay_core::CoreConfig;
use grelay_dispatch::RelayConfig;
use grelay_relay_core::{Channel, ModelPrice};
use rust_decimal::Decimal;
use serde::Deserialize;
use thiserror::Error;

use crate::cli::Cli;

const DEFAULT_CONFIG_FILE: &str = "grelay.toml";

#[derive(Debug, Error)]
pub(crate) enum ConfigError {
    #[error(transparent)]
    Load(#[from] config::ConfigError),
    #[error("token `{token}` refers to unknown group `{group}`")]
    UnknownGroup { token: String, group: String },
    #[error("channel id {0} is used more than once")]
    DuplicateChannel(i64),
    #[error("api key of token `{0}` is used more than once")]
    DuplicateKey(String),
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct GroupConfig {
    pub(crate) id: String,
    #[serde(default)]
    pub(crate) balance: Decimal,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct TokenConfig {
    pub(crate) key: String,
    pub(crate) id: i64,
    pub(crate) name: String,
    pub(crate) group: String,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct PriceConfig {
    pub(crate) model: String,
    #[serde(flatten)]
    pub(crate) price: ModelPrice,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub(crate) struct GatewayConfig {
    pub(crate) host: String,
    pub(crate) port: u16,
    pub(crate) dsn: Option<String>,
    /// Seconds to wait for pending billing after the listener stops.
    pub(crate) shutdown_grace_secs: u64,
    pub(crate) core: CoreConfig,
    pub(crate) relay: RelayConfig,
    pub(crate) channels: Vec<Channel>,
    pub(crate) groups: Vec<GroupConfig>,
    pub(crate) tokens: Vec<TokenConfig>,
    pub(crate) prices: Vec<PriceConfig>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3000,
            dsn: None,
            shutdown_grace_secs: 30,
            core: CoreConfig::default(),
            relay: RelayConfig::default(),
            channels: Vec::new(),
            groups: Vec::new(),
            tokens: Vec::new(),
            prices: Vec::new(),
        }
    }
}

impl GatewayConfig {
    /// File first, then `GRELAY__SECTION__KEY` environment variables.
    pub(crate) fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let file = match path {
            Some(path) => File::from(path).format(FileFormat::Toml).required(true),
            None => File::new(DEFAULT_CONFIG_FILE, FileFormat::Toml).required(false),
        };
        let config = Config::builder()
            .add_source(file)
            .add_source(environment())
            .build()?;
        Ok(config.try_deserialize()?)
    }

    pub(crate) fn apply_cli(&mut self, cli: &Cli) {
        if let Some(host) = &cli.host {
            self.host = host.clone();
        }
        if let Some(port) = cli.port {
            self.port = port;
        }
        if let Some(dsn) = &cli.dsn {
            self.dsn = Some(dsn.clone());
        }
    }

    pub(crate) fn dsn(&self) -> Option<&str> {
        self.dsn.as_deref().map(str::trim).filter(|dsn| !dsn.is_empty())
    }

    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        let mut ids = HashSet::new();
        for channel in &self.channels {
            if !ids.insert(channel.id) {
                return Err(ConfigError::DuplicateChannel(channel.id));
            }
        }
        let groups: HashSet<&str> = self.groups.iter().map(|group| group.id.as_str()).collect();
        let mut keys = HashSet::new();
        for token in &self.tokens {
            if !groups.contains(token.group.as_str()) {
                return Err(ConfigError::UnknownGroup {
                    token: token.name.clone(),
                    group: token.group.clone(),
                });
            }
            if !keys.insert(token.key.as_str()) {
                return Err(ConfigError::DuplicateKey(token.name.clone()));
            }
        }
        Ok(())
    }

    pub(crate) fn price_table(&self) -> HashMap<String, ModelPrice> {
        self.prices
            .iter()
            .map(|entry| (entry.model.clone(), entry.price.clone()))
            .collect()
    }
}

fn environment() -> Environment {
    Environment::with_prefix("GRELAY")
        .prefix_separator("__")
        .separator("__")
        .try_parsing(true)
}
