use stampede_shared::config::{self, NatsConfig, Result};

#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub nats: NatsConfig,
    /// Durable consumer name on the phase-event stream.
    pub durable_name: String,
}

impl RouterConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            nats: NatsConfig::from_env("stampede-router")?,
            durable_name: config::optional("STAMPEDE_ROUTER_DURABLE")
                .unwrap_or_else(|| "durable-router".to_string()),
        })
    }
}
