//! Expansion of raw phase events into stored entity transitions.

use std::sync::Arc;
use std::time::Duration;

use async_nats::jetstream::consumer::PullConsumer;
use futures::StreamExt;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use stampede_shared::deployment::DeploymentStatusEvent;
use stampede_shared::lifecycle::{
    cascaded_test_status, derived_updates, EntityKind, EntityStatusUpdate,
};

use crate::store::{SnapshotGenerator, StatusStore};

#[derive(Error, Debug)]
pub enum RouterError {
    /// Some derived updates could not be stored; the rest were still
    /// attempted.
    #[error("{failed} of {total} status updates failed")]
    PartialFailure { failed: usize, total: usize },
}

/// Applies the per-type transition table to each phase event and drives the
/// status store with the result.
#[derive(Clone)]
pub struct StatusRouter {
    store: Arc<dyn StatusStore>,
    snapshots: Arc<dyn SnapshotGenerator>,
}

impl StatusRouter {
    pub fn new(store: Arc<dyn StatusStore>, snapshots: Arc<dyn SnapshotGenerator>) -> Self {
        Self { store, snapshots }
    }

    /// Handles one phase event: derived updates first, then terminal-grid
    /// cascades, with snapshot side effects detached from both.
    pub async fn handle_event(&self, event: &DeploymentStatusEvent) -> Result<(), RouterError> {
        let updates = derived_updates(event);
        if updates.is_empty() {
            debug!(id = %event.id, status = %event.status, "event derives no updates");
            return Ok(());
        }

        let total = updates.len();
        let mut failed = 0;
        for (ordinal, update) in updates.iter().enumerate() {
            match self.store.apply(update).await {
                Ok(()) => self.after_applied(update).await,
                Err(e) => {
                    failed += 1;
                    error!(
                        ordinal,
                        kind = %update.kind,
                        id = %update.id,
                        status = %update.status,
                        error = %e,
                        "status update failed"
                    );
                }
            }
        }

        if failed > 0 {
            return Err(RouterError::PartialFailure { failed, total });
        }
        Ok(())
    }

    async fn after_applied(&self, update: &EntityStatusUpdate) {
        match update.kind {
            EntityKind::Grid => {
                if update.status.is_terminal() {
                    self.cascade_to_associated_test(update).await;
                }
            }
            EntityKind::Test => {
                if update.status.triggers_snapshot() {
                    self.request_snapshot(&update.id);
                }
            }
        }
    }

    /// A grid reaching Deleted/Expired drags its associated test along.
    /// Having no associated test is the common case, not an error.
    async fn cascade_to_associated_test(&self, grid_update: &EntityStatusUpdate) {
        let test_id = match self.store.lookup_associated_test(&grid_update.id).await {
            Ok(Some(test_id)) => test_id,
            Ok(None) => return,
            Err(e) => {
                warn!(grid = %grid_update.id, error = %e, "associated-test lookup failed");
                return;
            }
        };

        let Some(status) = cascaded_test_status(grid_update.status) else {
            return;
        };

        let update = EntityStatusUpdate {
            kind: EntityKind::Test,
            id: test_id,
            status,
        };
        match self.store.apply(&update).await {
            Ok(()) => {
                info!(grid = %grid_update.id, test = %update.id, status = %status, "cascaded test status");
                if status.triggers_snapshot() {
                    self.request_snapshot(&update.id);
                }
            }
            Err(e) => {
                warn!(grid = %grid_update.id, test = %update.id, error = %e, "cascade update failed");
            }
        }
    }

    /// Detached so a slow dashboard never delays routing.
    fn request_snapshot(&self, test_id: &str) {
        let snapshots = Arc::clone(&self.snapshots);
        let test_id = test_id.to_string();
        tokio::spawn(async move {
            if let Err(e) = snapshots.generate(&test_id).await {
                warn!(test = %test_id, error = %e, "snapshot request failed");
            }
        });
    }
}

/// Consumes the durable phase-event stream and routes each event.
///
/// Events are acked even when some updates fail; the control plane's
/// periodic refresh pass reconciles misses, and replaying a partially
/// applied event would redo the successful updates anyway.
pub async fn status_loop(router: StatusRouter, consumer: PullConsumer, shutdown: CancellationToken) {
    info!("routing status events");
    loop {
        if shutdown.is_cancelled() {
            break;
        }

        let batch = tokio::select! {
            _ = shutdown.cancelled() => break,
            batch = consumer
                .fetch()
                .max_messages(32)
                .expires(Duration::from_secs(30))
                .messages() => batch,
        };

        let mut messages = match batch {
            Ok(messages) => messages,
            Err(e) => {
                warn!(error = %e, "fetching status events failed");
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }
        };

        while let Some(message) = messages.next().await {
            let message = match message {
                Ok(message) => message,
                Err(e) => {
                    warn!(error = %e, "status event delivery failed");
                    continue;
                }
            };

            match serde_json::from_slice::<DeploymentStatusEvent>(&message.payload) {
                Ok(event) => {
                    if let Err(e) = router.handle_event(&event).await {
                        error!(id = %event.id, error = %e, "event partially routed");
                    }
                }
                Err(e) => warn!(error = %e, "discarding malformed status event"),
            }

            if let Err(e) = message.ack().await {
                warn!(error = %e, "failed to ack status event");
            }
        }
    }
    info!("status loop stopped");
}
