//! Shared kernel for the stampede grid orchestrator.
//!
//! Everything the three services (deployer, status router, TTL reaper) have
//! in common lives here: the wire message shapes, the closed deployment-type
//! tagged union, the lifecycle state machine that derives entity status
//! updates from job phase events, the NATS subject map, and the JetStream
//! bus plumbing.

pub mod config;
pub mod deployment;
pub mod error;
pub mod lifecycle;
pub mod nats;
pub mod subjects;

pub use config::{ConfigError, NatsConfig};
pub use deployment::{DeploymentRequest, DeploymentStatusEvent, DeploymentType, JobOutput, StreamType};
pub use error::BusError;
pub use lifecycle::{EntityKind, EntityStatus, EntityStatusUpdate, JobPhase};
pub use nats::DeployerBus;
