//! Periodic expiry sweep.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use stampede_shared::deployment::{
    DeploymentStatusEvent, DeploymentType, PARAM_GRID_REGION,
};
use stampede_shared::error::BusError;
use stampede_shared::lifecycle::JobPhase;
use stampede_shared::nats::DeployerBus;

use crate::config::MIN_SWEEP_INTERVAL_SECS;
use crate::inventory::{GridRecord, Inventory};
use crate::tracker::GridStatusTracker;

/// Seam for publishing phase events, mockable in tests.
#[async_trait]
pub trait StatusPublisher: Send + Sync {
    async fn publish(&self, event: &DeploymentStatusEvent) -> Result<(), BusError>;
}

pub struct BusStatusPublisher {
    bus: DeployerBus,
}

impl BusStatusPublisher {
    pub fn new(bus: DeployerBus) -> Self {
        Self { bus }
    }
}

#[async_trait]
impl StatusPublisher for BusStatusPublisher {
    async fn publish(&self, event: &DeploymentStatusEvent) -> Result<(), BusError> {
        self.bus.publish_status(event).await
    }
}

#[derive(Debug, Clone)]
pub struct SweepPolicy {
    pub interval: Duration,
    /// Destroy retries after the first successful issue, when live
    /// resources are still observed.
    pub retry_attempts: u32,
    /// Delay before re-polling for remaining resources.
    pub repoll_delay: Duration,
}

/// Clamps a configured sweep interval to the enforced floor.
pub fn effective_interval(configured_secs: u64) -> Duration {
    if configured_secs < MIN_SWEEP_INTERVAL_SECS {
        warn!(
            configured_secs,
            floor_secs = MIN_SWEEP_INTERVAL_SECS,
            "sweep interval below floor, clamping"
        );
        Duration::from_secs(MIN_SWEEP_INTERVAL_SECS)
    } else {
        Duration::from_secs(configured_secs)
    }
}

pub struct Sweeper {
    inventory: Arc<dyn Inventory>,
    tracker: Arc<GridStatusTracker>,
    publisher: Arc<dyn StatusPublisher>,
    policy: SweepPolicy,
}

impl Sweeper {
    pub fn new(
        inventory: Arc<dyn Inventory>,
        tracker: Arc<GridStatusTracker>,
        publisher: Arc<dyn StatusPublisher>,
        policy: SweepPolicy,
    ) -> Self {
        Self {
            inventory,
            tracker,
            publisher,
            policy,
        }
    }

    /// Sweeps until shutdown, one pass per interval.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(interval = ?self.policy.interval, "sweeping expired grids");
        loop {
            if shutdown.is_cancelled() {
                break;
            }
            self.sweep_once(Utc::now()).await;
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.policy.interval) => {}
            }
        }
        info!("sweeper stopped");
    }

    /// One full pass over the inventory. Per-item failures are logged and
    /// never abort the pass.
    pub async fn sweep_once(&self, now: DateTime<Utc>) {
        let records = match self.inventory.list().await {
            Ok(records) => records,
            Err(e) => {
                error!(error = %e, "inventory listing failed, skipping sweep");
                return;
            }
        };

        for record in records {
            if record.expires_at > now {
                continue;
            }
            if self.tracker.is_busy(&record.grid_id).await {
                info!(
                    grid = %record.grid_id,
                    status = ?self.tracker.status(&record.grid_id).await,
                    "grid busy, deferring teardown"
                );
                continue;
            }
            self.reap(&record).await;
        }
    }

    async fn reap(&self, record: &GridRecord) {
        info!(grid = %record.grid_id, expired_at = %record.expires_at, "tearing down expired grid");

        self.publish_phase(record, JobPhase::Started).await;

        if let Err(e) = self.inventory.destroy(record).await {
            error!(grid = %record.grid_id, error = %e, "teardown failed");
            self.publish_phase(record, JobPhase::Error).await;
            return;
        }

        // Re-poll for stragglers, retrying the idempotent destroy a bounded
        // number of times. Whatever remains after that is accepted and the
        // terminal status published optimistically.
        for attempt in 1..=self.policy.retry_attempts {
            tokio::time::sleep(self.policy.repoll_delay).await;
            match self.inventory.remaining(record).await {
                Ok(false) => break,
                Ok(true) => {
                    warn!(grid = %record.grid_id, attempt, "live resources remain, re-issuing destroy");
                    if let Err(e) = self.inventory.destroy(record).await {
                        warn!(grid = %record.grid_id, attempt, error = %e, "destroy retry failed");
                    }
                }
                Err(e) => {
                    warn!(grid = %record.grid_id, error = %e, "resource probe failed");
                    break;
                }
            }
        }

        self.publish_phase(record, JobPhase::Expired).await;
    }

    async fn publish_phase(&self, record: &GridRecord, phase: JobPhase) {
        let event = DeploymentStatusEvent::new(
            &record.grid_id,
            DeploymentType::DeleteGrid,
            phase,
            [(PARAM_GRID_REGION.to_string(), record.region.clone())]
                .into_iter()
                .collect(),
        );
        if let Err(e) = self.publisher.publish(&event).await {
            warn!(grid = %record.grid_id, phase = %phase, error = %e, "status publish failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicU32, Ordering};

    use chrono::TimeZone;
    use stampede_shared::deployment::DeploymentType;
    use tokio::sync::Mutex;

    use crate::inventory::InventoryError;

    struct FakeInventory {
        records: Vec<GridRecord>,
        destroy_calls: AtomicU32,
        fail_destroy: bool,
        /// Number of probes that report remaining resources before the
        /// grid reads as gone.
        remaining_polls: AtomicU32,
    }

    impl FakeInventory {
        fn with_records(records: Vec<GridRecord>) -> Self {
            Self {
                records,
                destroy_calls: AtomicU32::new(0),
                fail_destroy: false,
                remaining_polls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl Inventory for FakeInventory {
        async fn list(&self) -> Result<Vec<GridRecord>, InventoryError> {
            Ok(self.records.clone())
        }

        async fn destroy(&self, grid: &GridRecord) -> Result<(), InventoryError> {
            self.destroy_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_destroy {
                return Err(InventoryError::Destroy {
                    grid_id: grid.grid_id.clone(),
                    reason: "boom".to_string(),
                });
            }
            Ok(())
        }

        async fn remaining(&self, _grid: &GridRecord) -> Result<bool, InventoryError> {
            let left = self.remaining_polls.load(Ordering::SeqCst);
            if left > 0 {
                self.remaining_polls.store(left - 1, Ordering::SeqCst);
                Ok(true)
            } else {
                Ok(false)
            }
        }
    }

    #[derive(Default)]
    struct RecordingPublisher {
        events: Mutex<Vec<DeploymentStatusEvent>>,
    }

    #[async_trait]
    impl StatusPublisher for RecordingPublisher {
        async fn publish(&self, event: &DeploymentStatusEvent) -> Result<(), BusError> {
            self.events.lock().await.push(event.clone());
            Ok(())
        }
    }

    fn record(grid_id: &str, expires_at: DateTime<Utc>) -> GridRecord {
        GridRecord {
            grid_id: grid_id.to_string(),
            region: "us-east-1".to_string(),
            expires_at,
            state_path: std::path::PathBuf::from("/var/lib/stampede").join(grid_id),
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 8, 23, 12, 0, 0).unwrap()
    }

    fn past() -> DateTime<Utc> {
        now() - chrono::Duration::hours(1)
    }

    fn future() -> DateTime<Utc> {
        now() + chrono::Duration::hours(1)
    }

    fn policy() -> SweepPolicy {
        SweepPolicy {
            interval: Duration::from_secs(MIN_SWEEP_INTERVAL_SECS),
            retry_attempts: 2,
            repoll_delay: Duration::from_millis(1),
        }
    }

    fn sweeper(
        inventory: FakeInventory,
        tracker: GridStatusTracker,
    ) -> (Sweeper, Arc<FakeInventory>, Arc<RecordingPublisher>) {
        let inventory = Arc::new(inventory);
        let tracker = Arc::new(tracker);
        let publisher = Arc::new(RecordingPublisher::default());
        let sweeper = Sweeper::new(
            inventory.clone() as Arc<dyn Inventory>,
            tracker,
            publisher.clone() as Arc<dyn StatusPublisher>,
            policy(),
        );
        (sweeper, inventory, publisher)
    }

    fn phase_event(id: &str, kind: DeploymentType, phase: JobPhase) -> DeploymentStatusEvent {
        DeploymentStatusEvent::new(id, kind, phase, BTreeMap::new())
    }

    #[test]
    fn interval_floor_is_enforced() {
        assert_eq!(
            effective_interval(1),
            Duration::from_secs(MIN_SWEEP_INTERVAL_SECS)
        );
        assert_eq!(effective_interval(7200), Duration::from_secs(7200));
    }

    #[tokio::test]
    async fn expired_idle_grid_is_torn_down() {
        let (sweeper, inventory, publisher) = sweeper(
            FakeInventory::with_records(vec![record("g1", past())]),
            GridStatusTracker::new(),
        );

        sweeper.sweep_once(now()).await;

        assert_eq!(inventory.destroy_calls.load(Ordering::SeqCst), 1);
        let events = publisher.events.lock().await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].status, JobPhase::Started);
        assert_eq!(events[0].deployment_type, DeploymentType::DeleteGrid);
        assert_eq!(events[1].status, JobPhase::Expired);
    }

    #[tokio::test]
    async fn unexpired_grid_is_left_alone() {
        let (sweeper, inventory, publisher) = sweeper(
            FakeInventory::with_records(vec![record("g1", future())]),
            GridStatusTracker::new(),
        );

        sweeper.sweep_once(now()).await;

        assert_eq!(inventory.destroy_calls.load(Ordering::SeqCst), 0);
        assert!(publisher.events.lock().await.is_empty());
    }

    #[tokio::test]
    async fn busy_grid_is_deferred_to_the_next_cycle() {
        let tracker = GridStatusTracker::new();
        tracker
            .observe(&phase_event("g1", DeploymentType::Grid, JobPhase::Started))
            .await;

        let (sweeper, inventory, publisher) = sweeper(
            FakeInventory::with_records(vec![record("g1", past())]),
            tracker,
        );

        sweeper.sweep_once(now()).await;

        assert_eq!(inventory.destroy_calls.load(Ordering::SeqCst), 0);
        assert!(publisher.events.lock().await.is_empty());
    }

    #[tokio::test]
    async fn grid_resting_at_available_is_eligible() {
        let tracker = GridStatusTracker::new();
        tracker
            .observe(&phase_event("g1", DeploymentType::Grid, JobPhase::Started))
            .await;
        tracker
            .observe(&phase_event("g1", DeploymentType::Grid, JobPhase::Completed))
            .await;

        let (sweeper, inventory, _publisher) = sweeper(
            FakeInventory::with_records(vec![record("g1", past())]),
            tracker,
        );

        sweeper.sweep_once(now()).await;
        assert_eq!(inventory.destroy_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn destroy_failure_publishes_error_and_continues_the_sweep() {
        let mut inventory =
            FakeInventory::with_records(vec![record("g1", past()), record("g2", past())]);
        inventory.fail_destroy = true;

        let (sweeper, inventory, publisher) = sweeper(inventory, GridStatusTracker::new());

        sweeper.sweep_once(now()).await;

        // Both grids were attempted despite the first failure.
        assert_eq!(inventory.destroy_calls.load(Ordering::SeqCst), 2);
        let events = publisher.events.lock().await;
        let errors: Vec<_> = events
            .iter()
            .filter(|e| e.status == JobPhase::Error)
            .collect();
        assert_eq!(errors.len(), 2);
        assert!(!events.iter().any(|e| e.status == JobPhase::Expired));
    }

    #[tokio::test]
    async fn lingering_resources_trigger_bounded_destroy_retries() {
        let inventory = FakeInventory {
            remaining_polls: AtomicU32::new(1),
            ..FakeInventory::with_records(vec![record("g1", past())])
        };
        let (sweeper, inventory, publisher) = sweeper(inventory, GridStatusTracker::new());

        sweeper.sweep_once(now()).await;

        // Initial destroy plus one retry after the positive probe.
        assert_eq!(inventory.destroy_calls.load(Ordering::SeqCst), 2);
        let events = publisher.events.lock().await;
        assert_eq!(events.last().map(|e| e.status), Some(JobPhase::Expired));
    }

    #[tokio::test]
    async fn terminal_status_is_published_optimistically_after_retries_run_out() {
        let inventory = FakeInventory {
            remaining_polls: AtomicU32::new(10),
            ..FakeInventory::with_records(vec![record("g1", past())])
        };
        let (sweeper, inventory, publisher) = sweeper(inventory, GridStatusTracker::new());

        sweeper.sweep_once(now()).await;

        // Initial destroy plus the bounded retries, then give up.
        assert_eq!(inventory.destroy_calls.load(Ordering::SeqCst), 3);
        let events = publisher.events.lock().await;
        assert_eq!(events.last().map(|e| e.status), Some(JobPhase::Expired));
    }

    #[tokio::test]
    async fn reap_events_carry_the_grid_region() {
        let (sweeper, _inventory, publisher) = sweeper(
            FakeInventory::with_records(vec![record("g1", past())]),
            GridStatusTracker::new(),
        );

        sweeper.sweep_once(now()).await;

        let events = publisher.events.lock().await;
        assert_eq!(
            events[0].params.get(PARAM_GRID_REGION).map(String::as_str),
            Some("us-east-1")
        );
    }
}
