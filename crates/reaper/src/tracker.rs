//! Busy-guard built purely from the phase-event stream.
//!
//! The tracker holds the last derived status per grid. It never talks to
//! the status store; observing the same events the router consumes is
//! enough to know whether a grid has an operation in flight.

use std::collections::HashMap;
use std::time::Duration;

use async_nats::jetstream::consumer::PullConsumer;
use futures::StreamExt;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use stampede_shared::deployment::DeploymentStatusEvent;
use stampede_shared::lifecycle::{derived_updates, EntityKind, EntityStatus};

#[derive(Default)]
pub struct GridStatusTracker {
    grids: Mutex<HashMap<String, EntityStatus>>,
}

impl GridStatusTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds one phase event into the tracked grid statuses. Terminal
    /// statuses evict the entry; the grid no longer exists.
    pub async fn observe(&self, event: &DeploymentStatusEvent) {
        for update in derived_updates(event) {
            if update.kind != EntityKind::Grid {
                continue;
            }
            let mut grids = self.grids.lock().await;
            if update.status.is_terminal() {
                debug!(grid = %update.id, status = %update.status, "grid evicted from tracker");
                grids.remove(&update.id);
            } else {
                debug!(grid = %update.id, status = %update.status, "grid status tracked");
                grids.insert(update.id, update.status);
            }
        }
    }

    /// True when some operation is in flight on the grid. Untracked grids
    /// and grids resting at Available are idle.
    pub async fn is_busy(&self, grid_id: &str) -> bool {
        match self.grids.lock().await.get(grid_id) {
            None | Some(EntityStatus::Available) => false,
            Some(_) => true,
        }
    }

    pub async fn status(&self, grid_id: &str) -> Option<EntityStatus> {
        self.grids.lock().await.get(grid_id).copied()
    }
}

/// Feeds the tracker from the durable phase-event stream.
pub async fn observe_loop(
    tracker: std::sync::Arc<GridStatusTracker>,
    consumer: PullConsumer,
    shutdown: CancellationToken,
) {
    info!("tracking grid statuses");
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
                Ok(event) => tracker.observe(&event).await,
                Err(e) => warn!(error = %e, "discarding malformed status event"),
            }

            if let Err(e) = message.ack().await {
                warn!(error = %e, "failed to ack status event");
            }
        }
    }
    info!("tracker loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use stampede_shared::deployment::{DeploymentType, PARAM_GRID_ID};
    use stampede_shared::lifecycle::JobPhase;

    fn event(
        id: &str,
        kind: DeploymentType,
        phase: JobPhase,
        params: &[(&str, &str)],
    ) -> DeploymentStatusEvent {
        let params: BTreeMap<String, String> = params
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        DeploymentStatusEvent::new(id, kind, phase, params)
    }

    #[tokio::test]
    async fn deploying_grid_is_busy_until_completed() {
        let tracker = GridStatusTracker::new();

        tracker
            .observe(&event("g1", DeploymentType::Grid, JobPhase::Started, &[]))
            .await;
        assert!(tracker.is_busy("g1").await);
        assert_eq!(tracker.status("g1").await, Some(EntityStatus::Deploying));

        tracker
            .observe(&event("g1", DeploymentType::Grid, JobPhase::Completed, &[]))
            .await;
        assert!(!tracker.is_busy("g1").await);
        assert_eq!(tracker.status("g1").await, Some(EntityStatus::Available));
    }

    #[tokio::test]
    async fn untracked_grid_is_not_busy() {
        let tracker = GridStatusTracker::new();
        assert!(!tracker.is_busy("g9").await);
    }

    #[tokio::test]
    async fn terminal_statuses_evict_the_grid() {
        let tracker = GridStatusTracker::new();

        tracker
            .observe(&event("g1", DeploymentType::DeleteGrid, JobPhase::Started, &[]))
            .await;
        assert!(tracker.is_busy("g1").await);

        tracker
            .observe(&event(
                "g1",
                DeploymentType::DeleteGrid,
                JobPhase::Completed,
                &[],
            ))
            .await;
        assert_eq!(tracker.status("g1").await, None);
        assert!(!tracker.is_busy("g1").await);
    }

    #[tokio::test]
    async fn test_events_track_the_referenced_grid() {
        let tracker = GridStatusTracker::new();

        tracker
            .observe(&event(
                "g1",
                DeploymentType::StopTest,
                JobPhase::Started,
                &[(PARAM_GRID_ID, "g1")],
            ))
            .await;
        assert_eq!(tracker.status("g1").await, Some(EntityStatus::Cleaning));
        assert!(tracker.is_busy("g1").await);
    }

    #[tokio::test]
    async fn test_scoped_updates_do_not_create_grid_entries() {
        let tracker = GridStatusTracker::new();

        tracker
            .observe(&event(
                "t1",
                DeploymentType::Test,
                JobPhase::Started,
                &[(PARAM_GRID_ID, "g1")],
            ))
            .await;
        assert_eq!(tracker.status("t1").await, None);
        assert_eq!(tracker.status("g1").await, None);
    }
}
