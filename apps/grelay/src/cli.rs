use std::path::PathBuf;

use clap::Parser;

#[derive(Debug, Clone, Parser)]
#[command(name = "grelay", version, about = "AI model relay gateway")]
pub(crate) struct Cli {
    /// TOML configuration file. `grelay.toml` is read when present.
    #[arg(long, env = "GRELAY_CONFIG")]
    pub(crate) config: Option<PathBuf>,
    #[arg(long, env = "GRELAY_HOST")]
    pub(crate) host: Option<String>,
    #[arg(long, env = "GRELAY_PORT")]
    pub(crate) port: Option<u16>,
    /// Database for consumption logs. Logs stay in memory when unset.
    #[arg(long, env = "GRELAY_DSN")]
    pub(crate) dsn: Option<String>,
}
