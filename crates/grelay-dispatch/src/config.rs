use std::collections::HashMap;
use std::time::Duration;

use grelay_relay_core::RelayMode;
use grelay_relay_core::detail::{DEFAULT_REQUEST_BODY_MAX_SIZE, DEFAULT_RESPONSE_BODY_MAX_SIZE};
use grelay_relay_core::writer::DEFAULT_CAPTURE_LIMIT;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub window_secs: u64,
    pub min_requests: u64,
    pub auto_ban_rate: f64,
    pub auto_ban_enabled: bool,
    pub ban_secs: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            window_secs: 60,
            min_requests: 10,
            auto_ban_rate: 0.5,
            auto_ban_enabled: false,
            ban_secs: 300,
        }
    }
}

impl MonitorConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs.max(1))
    }

    pub fn ban_duration(&self) -> Duration {
        Duration::from_secs(self.ban_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// When off, balances are never read and every call is admitted.
    pub billing_enabled: bool,
    pub retry_times: u32,
    /// Seconds per relay mode; missing or 0 means no deadline.
    pub timeouts: HashMap<RelayMode, u64>,
    pub capture_limit: usize,
    pub request_body_max_size: usize,
    pub response_body_max_size: usize,
    pub save_all_log_detail: bool,
    /// Chunks buffered between the relay task and the caller connection.
    pub caller_buffer: usize,
    pub pool_max_buffers: usize,
    pub credential_refresh_secs: u64,
    pub monitor: MonitorConfig,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            billing_enabled: true,
            retry_times: 0,
            timeouts: HashMap::new(),
            capture_limit: DEFAULT_CAPTURE_LIMIT,
            request_body_max_size: DEFAULT_REQUEST_BODY_MAX_SIZE,
            response_body_max_size: DEFAULT_RESPONSE_BODY_MAX_SIZE,
            save_all_log_detail: false,
            caller_buffer: 64,
            pool_max_buffers: 64,
            credential_refresh_secs: 300,
            monitor: MonitorConfig::default(),
        }
    }
}

impl RelayConfig {
    pub fn timeout(&self, mode: RelayMode) -> Option<Duration> {
        match self.timeouts.get(&mode).copied() {
            Some(secs) if secs > 0 => Some(Duration::from_secs(secs)),
            _ => None,
        }
    }

    pub fn credential_refresh_window(&self) -> Duration {
        Duration::from_secs(self.credential_refresh_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_timeout_means_unlimited() {
        let mut config = RelayConfig::default();
        config.timeouts.insert(RelayMode::ChatCompletions, 0);
        config.timeouts.insert(RelayMode::Embeddings, 30);
        assert_eq!(config.timeout(RelayMode::ChatCompletions), None);
        assert_eq!(config.timeout(RelayMode::AudioSpeech), None);
        assert_eq!(
            config.timeout(RelayMode::Embeddings),
            Some(Duration::from_secs(30))
        );
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config: RelayConfig = serde_json::from_str(
            r#"{"retry_times":2,"timeouts":{"chat_completions":120},"monitor":{"auto_ban_enabled":true}}"#,
        )
        .unwrap();
        assert_eq!(config.retry_times, 2);
        assert!(config.billing_enabled);
        assert!(config.monitor.auto_ban_enabled);
        assert_eq!(config.monitor.window_secs, 60);
        assert_eq!(
            config.timeout(RelayMode::ChatCompletions),
            Some(Duration::from_secs(120))
        );
    }
}
