//! Environment-driven configuration.
//!
//! All settings are read once at startup; a missing required variable is
//! fatal before any subscription is opened. An optional `.env` file takes
//! precedence over the process environment for local development.

use std::env;
use std::path::Path;

use thiserror::Error;

/// Errors raised while loading or validating configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("missing required configuration: {var}")]
    MissingRequired { var: String },

    #[error("invalid value for {var}: {value}")]
    InvalidValue { var: String, value: String },
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Loads a `.env` file if one exists at `path`. Absence is not an error.
pub fn load_env_file(path: impl AsRef<Path>) {
    let _ = dotenv::from_path(path.as_ref());
}

/// Reads a required environment variable.
pub fn require(var: &str) -> Result<String> {
    match env::var(var) {
        Ok(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(ConfigError::MissingRequired {
            var: var.to_string(),
        }),
    }
}

/// Reads an optional environment variable; empty values count as unset.
pub fn optional(var: &str) -> Option<String> {
    env::var(var).ok().filter(|v| !v.trim().is_empty())
}

/// Reads and parses an optional environment variable, defaulting when unset.
pub fn parse_or<T: std::str::FromStr>(var: &str, default: T) -> Result<T> {
    match optional(var) {
        Some(raw) => raw.parse().map_err(|_| ConfigError::InvalidValue {
            var: var.to_string(),
            value: raw,
        }),
        None => Ok(default),
    }
}

/// NATS connection settings shared by all three services.
#[derive(Debug, Clone)]
pub struct NatsConfig {
    /// Server URL, e.g. `nats://localhost:4222`.
    pub url: String,
    /// Optional username/password pair.
    pub username: Option<String>,
    pub password: Option<String>,
    /// Connection timeout in seconds.
    pub connection_timeout_secs: u64,
    /// Client connection name reported to the server.
    pub client_name: String,
}

impl NatsConfig {
    /// Loads connection settings from the environment.
    ///
    /// `STAMPEDE_NATS_URL` is required; credentials are optional and only
    /// applied when both halves are present.
    pub fn from_env(service: &str) -> Result<Self> {
        let hostname = hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "unknown".to_string());

        Ok(Self {
            url: require("STAMPEDE_NATS_URL")?,
            username: optional("STAMPEDE_NATS_USERNAME"),
            password: optional("STAMPEDE_NATS_PASSWORD"),
            connection_timeout_secs: parse_or("STAMPEDE_NATS_CONNECT_TIMEOUT_SECS", 5)?,
            client_name: format!("{}-{}", service, hostname),
        })
    }

    /// Credentials, when both username and password are configured.
    pub fn credentials(&self) -> Option<(&str, &str)> {
        match (self.username.as_deref(), self.password.as_deref()) {
            (Some(user), Some(pass)) => Some((user, pass)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_or_falls_back_to_default() {
        assert_eq!(parse_or::<u64>("STAMPEDE_TEST_UNSET_VAR", 42).unwrap(), 42);
    }

    #[test]
    fn credentials_require_both_halves() {
        let config = NatsConfig {
            url: "nats://localhost:4222".to_string(),
            username: Some("user".to_string()),
            password: None,
            connection_timeout_secs: 5,
            client_name: "test".to_string(),
        };
        assert!(config.credentials().is_none());
    }
}
