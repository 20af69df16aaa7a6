//! Status-store and snapshot interfaces, backed by control-plane
//! request-reply subjects.
//!
//! The control plane owns the database; the router only speaks the bus.

use async_nats::Client;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use stampede_shared::lifecycle::EntityStatusUpdate;
use stampede_shared::subjects;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("request failed: {0}")]
    Request(String),

    #[error("malformed reply: {0}")]
    Decode(String),

    #[error("update rejected: {0}")]
    Rejected(String),
}

/// Entity status persistence, one update at a time.
#[async_trait]
pub trait StatusStore: Send + Sync {
    async fn apply(&self, update: &EntityStatusUpdate) -> Result<(), StoreError>;

    /// The test currently associated with a grid, if any.
    async fn lookup_associated_test(&self, grid_id: &str) -> Result<Option<String>, StoreError>;
}

/// Out-of-band dashboard snapshot requests.
#[async_trait]
pub trait SnapshotGenerator: Send + Sync {
    async fn generate(&self, test_id: &str) -> Result<(), StoreError>;
}

#[derive(Serialize)]
struct StatusUpdateRequest<'a> {
    #[serde(rename = "Kind")]
    kind: &'a str,
    #[serde(rename = "ID")]
    id: &'a str,
    #[serde(rename = "Status")]
    status: String,
}

#[derive(Deserialize)]
struct ControlReply {
    #[serde(rename = "OK")]
    ok: bool,
    #[serde(rename = "Error", default)]
    error: String,
}

#[derive(Serialize)]
struct LookupRequest<'a> {
    #[serde(rename = "GridID")]
    grid_id: &'a str,
}

#[derive(Deserialize)]
struct LookupReply {
    #[serde(rename = "TestID", default)]
    test_id: Option<String>,
}

#[derive(Serialize)]
struct SnapshotRequest<'a> {
    #[serde(rename = "TestID")]
    test_id: &'a str,
}

/// Request-reply client for the control plane's status subjects.
pub struct ControlPlaneClient {
    client: Client,
}

impl ControlPlaneClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn request<T: Serialize>(
        &self,
        subject: &'static str,
        body: &T,
    ) -> Result<Vec<u8>, StoreError> {
        let payload = serde_json::to_vec(body).map_err(|e| StoreError::Request(e.to_string()))?;
        let reply = self
            .client
            .request(subject, payload.into())
            .await
            .map_err(|e| StoreError::Request(e.to_string()))?;
        Ok(reply.payload.to_vec())
    }
}

#[async_trait]
impl StatusStore for ControlPlaneClient {
    async fn apply(&self, update: &EntityStatusUpdate) -> Result<(), StoreError> {
        let body = StatusUpdateRequest {
            kind: update.kind.as_str(),
            id: &update.id,
            status: update.status.to_string(),
        };
        let raw = self.request(subjects::CONTROL_STATUS_UPDATE, &body).await?;
        let reply: ControlReply =
            serde_json::from_slice(&raw).map_err(|e| StoreError::Decode(e.to_string()))?;
        if !reply.ok {
            return Err(StoreError::Rejected(reply.error));
        }
        debug!(kind = %update.kind, id = %update.id, status = %update.status, "status stored");
        Ok(())
    }

    async fn lookup_associated_test(&self, grid_id: &str) -> Result<Option<String>, StoreError> {
        let raw = self
            .request(subjects::CONTROL_STATUS_LOOKUP, &LookupRequest { grid_id })
            .await?;
        let reply: LookupReply =
            serde_json::from_slice(&raw).map_err(|e| StoreError::Decode(e.to_string()))?;
        Ok(reply.test_id.filter(|id| !id.is_empty()))
    }
}

#[async_trait]
impl SnapshotGenerator for ControlPlaneClient {
    async fn generate(&self, test_id: &str) -> Result<(), StoreError> {
        // Fire-and-forget; the control plane resolves the test's
        // launch-to-stop window itself.
        let payload = serde_json::to_vec(&SnapshotRequest { test_id })
            .map_err(|e| StoreError::Request(e.to_string()))?;
        self.client
            .publish(subjects::CONTROL_SNAPSHOT_GENERATE, payload.into())
            .await
            .map_err(|e| StoreError::Request(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_request_wire_shape() {
        use stampede_shared::lifecycle::{EntityKind, EntityStatus};

        let update = EntityStatusUpdate {
            kind: EntityKind::Grid,
            id: "g1".to_string(),
            status: EntityStatus::Available,
        };
        let body = StatusUpdateRequest {
            kind: update.kind.as_str(),
            id: &update.id,
            status: update.status.to_string(),
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["Kind"], "Grid");
        assert_eq!(json["ID"], "g1");
        assert_eq!(json["Status"], "Available");
    }

    #[test]
    fn lookup_reply_treats_empty_test_id_as_absent() {
        let reply: LookupReply = serde_json::from_str(r#"{"TestID":""}"#).unwrap();
        assert!(reply.test_id.filter(|id| !id.is_empty()).is_none());

        let reply: LookupReply = serde_json::from_str(r#"{}"#).unwrap();
        assert!(reply.test_id.is_none());

        let reply: LookupReply = serde_json::from_str(r#"{"TestID":"t1"}"#).unwrap();
        assert_eq!(reply.test_id.as_deref(), Some("t1"));
    }
}
