use std::path::PathBuf;

use stampede_shared::config::{self, NatsConfig, Result};

/// Sweeps more frequent than this are treated as misconfiguration.
pub const MIN_SWEEP_INTERVAL_SECS: u64 = 5 * 60;

#[derive(Debug, Clone)]
pub struct ReaperConfig {
    pub nats: NatsConfig,
    /// Durable consumer name on the phase-event stream.
    pub durable_name: String,
    /// Directory holding one state subdirectory per provisioned grid.
    pub state_dir: PathBuf,
    /// Teardown executable invoked per expired grid.
    pub teardown_script: PathBuf,
    pub sweep_interval_secs: u64,
    pub retry_attempts: u32,
    pub repoll_delay_secs: u64,
}

impl ReaperConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            nats: NatsConfig::from_env("stampede-reaper")?,
            durable_name: config::optional("STAMPEDE_REAPER_DURABLE")
                .unwrap_or_else(|| "durable-reaper".to_string()),
            state_dir: PathBuf::from(config::require("STAMPEDE_STATE_DIR")?),
            teardown_script: PathBuf::from(config::require("STAMPEDE_TEARDOWN_SCRIPT")?),
            sweep_interval_secs: config::parse_or("STAMPEDE_SWEEP_INTERVAL_SECS", 60 * 60)?,
            retry_attempts: config::parse_or("STAMPEDE_REAP_RETRY_ATTEMPTS", 2)?,
            repoll_delay_secs: config::parse_or("STAMPEDE_REAP_REPOLL_DELAY_SECS", 30)?,
        })
    }
}
