use std::path::PathBuf;

use stampede_shared::config::{self, NatsConfig, Result};

/// Default sentinel exit code a script uses to report operator cancellation.
const DEFAULT_CANCEL_EXIT_CODE: i32 = 5;

#[derive(Debug, Clone)]
pub struct DeployerConfig {
    pub nats: NatsConfig,
    /// Durable consumer name shared by every runner replica.
    pub durable_name: String,
    /// Directory holding one executable per deployment kind.
    pub script_dir: PathBuf,
    /// Exit code that marks a run as cancelled rather than failed.
    pub cancel_exit_code: i32,
}

impl DeployerConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            nats: NatsConfig::from_env("stampede-deployer")?,
            durable_name: config::optional("STAMPEDE_DEPLOYER_DURABLE")
                .unwrap_or_else(|| "durable-deployer".to_string()),
            script_dir: PathBuf::from(config::require("STAMPEDE_SCRIPT_DIR")?),
            cancel_exit_code: config::parse_or(
                "STAMPEDE_CANCEL_EXIT_CODE",
                DEFAULT_CANCEL_EXIT_CODE,
            )?,
        })
    }
}
