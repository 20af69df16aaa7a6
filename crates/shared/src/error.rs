use thiserror::Error;

/// Errors surfaced by the bus plumbing.
///
/// Transport failures are logged and tolerated by the services; only
/// connection failures at startup are fatal.
#[derive(Error, Debug)]
pub enum BusError {
    #[error("connection failed: {0}")]
    Connection(String),

    #[error("publish failed: {0}")]
    Publish(String),

    #[error("subscribe failed: {0}")]
    Subscribe(String),

    #[error("serialization failed: {0}")]
    Serialization(String),
}
