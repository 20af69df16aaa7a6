//! Deployment lifecycle state machine.
//!
//! A job phase event on `deployer.status` expands into zero, one or two
//! derived entity status updates depending on the deployment type and on
//! which optional parameters are present. The table lives here, once; the
//! status router drives the status store with it and the TTL reaper derives
//! its grid tracker from it, so both observe the same domain transitions
//! without coupling to each other.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::deployment::{DeploymentStatusEvent, DeploymentType};

/// Raw phase of a deployment job as published on the wire.
///
/// `Expired` is only ever published by the TTL reaper's optimistic terminal
/// path; the runner publishes the other three.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobPhase {
    Started,
    Completed,
    Error,
    Expired,
}

impl fmt::Display for JobPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobPhase::Started => "Started",
            JobPhase::Completed => "Completed",
            JobPhase::Error => "Error",
            JobPhase::Expired => "Expired",
        };
        f.write_str(s)
    }
}

/// The two entity kinds the status store knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntityKind {
    Grid,
    Test,
}

impl EntityKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EntityKind::Grid => "Grid",
            EntityKind::Test => "Test",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Domain status of a grid or test entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntityStatus {
    Deploying,
    Available,
    Deployed,
    Deleting,
    Deleted,
    Cleaning,
    Stopping,
    Stopped,
    Expired,
    Error,
}

impl EntityStatus {
    /// Terminal grid statuses; the TTL tracker evicts on these.
    pub fn is_terminal(self) -> bool {
        matches!(self, EntityStatus::Deleted | EntityStatus::Expired)
    }

    /// Test transitions that trigger a dashboard snapshot request.
    pub fn triggers_snapshot(self) -> bool {
        matches!(
            self,
            EntityStatus::Stopped | EntityStatus::Expired | EntityStatus::Deployed
        )
    }
}

impl fmt::Display for EntityStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EntityStatus::Deploying => "Deploying",
            EntityStatus::Available => "Available",
            EntityStatus::Deployed => "Deployed",
            EntityStatus::Deleting => "Deleting",
            EntityStatus::Deleted => "Deleted",
            EntityStatus::Cleaning => "Cleaning",
            EntityStatus::Stopping => "Stopping",
            EntityStatus::Stopped => "Stopped",
            EntityStatus::Expired => "Expired",
            EntityStatus::Error => "Error",
        };
        f.write_str(s)
    }
}

/// One derived status update for a single entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityStatusUpdate {
    pub kind: EntityKind,
    pub id: String,
    pub status: EntityStatus,
}

impl EntityStatusUpdate {
    fn grid(id: &str, status: EntityStatus) -> Self {
        Self {
            kind: EntityKind::Grid,
            id: id.to_string(),
            status,
        }
    }

    fn test(id: &str, status: EntityStatus) -> Self {
        Self {
            kind: EntityKind::Test,
            id: id.to_string(),
            status,
        }
    }
}

/// Expands one phase event into its derived entity status updates.
///
/// CancelTest deliberately mirrors only the grid side of StopTest; the two
/// are not unified.
pub fn derived_updates(event: &DeploymentStatusEvent) -> Vec<EntityStatusUpdate> {
    match event.status {
        JobPhase::Started => initial_updates(event),
        JobPhase::Completed => final_updates(event),
        JobPhase::Error => error_updates(event),
        JobPhase::Expired => expired_updates(event),
    }
}

fn initial_updates(event: &DeploymentStatusEvent) -> Vec<EntityStatusUpdate> {
    match event.deployment_type {
        DeploymentType::Grid => vec![EntityStatusUpdate::grid(&event.id, EntityStatus::Deploying)],
        DeploymentType::Test => vec![EntityStatusUpdate::test(&event.id, EntityStatus::Deploying)],
        DeploymentType::DeleteGrid => {
            vec![EntityStatusUpdate::grid(&event.id, EntityStatus::Deleting)]
        }
        DeploymentType::CancelGrid => vec![EntityStatusUpdate::grid(
            event.grid_ref(),
            EntityStatus::Stopping,
        )],
        DeploymentType::StopTest => {
            let mut updates = vec![EntityStatusUpdate::grid(
                event.grid_ref(),
                EntityStatus::Cleaning,
            )];
            if let Some(test_id) = event.test_ref() {
                updates.push(EntityStatusUpdate::test(test_id, EntityStatus::Stopping));
            }
            updates
        }
        DeploymentType::CancelTest => vec![EntityStatusUpdate::grid(
            event.grid_ref(),
            EntityStatus::Cleaning,
        )],
        DeploymentType::GridCleanup => {
            vec![EntityStatusUpdate::grid(&event.id, EntityStatus::Cleaning)]
        }
    }
}

fn final_updates(event: &DeploymentStatusEvent) -> Vec<EntityStatusUpdate> {
    match event.deployment_type {
        DeploymentType::Grid => vec![EntityStatusUpdate::grid(&event.id, EntityStatus::Available)],
        DeploymentType::Test => vec![EntityStatusUpdate::test(&event.id, EntityStatus::Deployed)],
        DeploymentType::DeleteGrid => {
            vec![EntityStatusUpdate::grid(&event.id, EntityStatus::Deleted)]
        }
        DeploymentType::CancelGrid => vec![EntityStatusUpdate::grid(
            event.grid_ref(),
            EntityStatus::Available,
        )],
        DeploymentType::StopTest => {
            let mut updates = vec![EntityStatusUpdate::grid(
                event.grid_ref(),
                EntityStatus::Available,
            )];
            if let Some(test_id) = event.test_ref() {
                updates.push(EntityStatusUpdate::test(test_id, EntityStatus::Stopped));
            }
            updates
        }
        DeploymentType::CancelTest => vec![EntityStatusUpdate::grid(
            event.grid_ref(),
            EntityStatus::Available,
        )],
        DeploymentType::GridCleanup => {
            vec![EntityStatusUpdate::grid(&event.id, EntityStatus::Available)]
        }
    }
}

fn error_updates(event: &DeploymentStatusEvent) -> Vec<EntityStatusUpdate> {
    match event.deployment_type {
        DeploymentType::Grid
        | DeploymentType::DeleteGrid
        | DeploymentType::CancelGrid
        | DeploymentType::GridCleanup => {
            vec![EntityStatusUpdate::grid(event.grid_ref(), EntityStatus::Error)]
        }
        DeploymentType::Test => {
            let mut updates = vec![EntityStatusUpdate::test(&event.id, EntityStatus::Error)];
            // A failed test deployment releases its grid back to the pool.
            if event.grid_ref() != event.id {
                updates.push(EntityStatusUpdate::grid(
                    event.grid_ref(),
                    EntityStatus::Available,
                ));
            }
            updates
        }
        DeploymentType::StopTest | DeploymentType::CancelTest => {
            vec![EntityStatusUpdate::grid(event.grid_ref(), EntityStatus::Error)]
        }
    }
}

fn expired_updates(event: &DeploymentStatusEvent) -> Vec<EntityStatusUpdate> {
    match event.deployment_type {
        DeploymentType::Grid
        | DeploymentType::DeleteGrid
        | DeploymentType::CancelGrid
        | DeploymentType::GridCleanup => {
            vec![EntityStatusUpdate::grid(event.grid_ref(), EntityStatus::Expired)]
        }
        // Expired is a grid-side terminal; test-scoped kinds never carry it.
        DeploymentType::Test | DeploymentType::StopTest | DeploymentType::CancelTest => vec![],
    }
}

/// Test transition cascaded from a grid reaching a terminal status.
pub fn cascaded_test_status(grid_status: EntityStatus) -> Option<EntityStatus> {
    match grid_status {
        EntityStatus::Deleted => Some(EntityStatus::Stopped),
        EntityStatus::Expired => Some(EntityStatus::Expired),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deployment::{PARAM_GRID_ID, PARAM_TEST_ID};
    use std::collections::BTreeMap;

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

    #[test]
    fn grid_success_path() {
        let started = event("g1", DeploymentType::Grid, JobPhase::Started, &[]);
        assert_eq!(
            derived_updates(&started),
            vec![EntityStatusUpdate::grid("g1", EntityStatus::Deploying)]
        );

        let completed = event("g1", DeploymentType::Grid, JobPhase::Completed, &[]);
        assert_eq!(
            derived_updates(&completed),
            vec![EntityStatusUpdate::grid("g1", EntityStatus::Available)]
        );
    }

    #[test]
    fn grid_failure_yields_single_error_update() {
        let failed = event("g1", DeploymentType::Grid, JobPhase::Error, &[]);
        assert_eq!(
            derived_updates(&failed),
            vec![EntityStatusUpdate::grid("g1", EntityStatus::Error)]
        );
    }

    #[test]
    fn stop_test_updates_both_entities_in_both_phases() {
        let params = [(PARAM_GRID_ID, "g1"), (PARAM_TEST_ID, "t1")];
        let started = event("g1", DeploymentType::StopTest, JobPhase::Started, &params);
        assert_eq!(
            derived_updates(&started),
            vec![
                EntityStatusUpdate::grid("g1", EntityStatus::Cleaning),
                EntityStatusUpdate::test("t1", EntityStatus::Stopping),
            ]
        );

        let completed = event("g1", DeploymentType::StopTest, JobPhase::Completed, &params);
        assert_eq!(
            derived_updates(&completed),
            vec![
                EntityStatusUpdate::grid("g1", EntityStatus::Available),
                EntityStatusUpdate::test("t1", EntityStatus::Stopped),
            ]
        );
    }

    #[test]
    fn stop_test_without_test_id_updates_grid_only() {
        let started = event(
            "g1",
            DeploymentType::StopTest,
            JobPhase::Started,
            &[(PARAM_GRID_ID, "g1")],
        );
        assert_eq!(
            derived_updates(&started),
            vec![EntityStatusUpdate::grid("g1", EntityStatus::Cleaning)]
        );
    }

    #[test]
    fn cancel_test_never_touches_the_test_entity() {
        let params = [(PARAM_GRID_ID, "g1"), (PARAM_TEST_ID, "t1")];
        for phase in [JobPhase::Started, JobPhase::Completed] {
            let ev = event("t1", DeploymentType::CancelTest, phase, &params);
            for update in derived_updates(&ev) {
                assert_eq!(update.kind, EntityKind::Grid);
            }
        }
    }

    #[test]
    fn delete_grid_lifecycle() {
        let started = event("g1", DeploymentType::DeleteGrid, JobPhase::Started, &[]);
        assert_eq!(
            derived_updates(&started),
            vec![EntityStatusUpdate::grid("g1", EntityStatus::Deleting)]
        );

        let completed = event("g1", DeploymentType::DeleteGrid, JobPhase::Completed, &[]);
        assert_eq!(
            derived_updates(&completed),
            vec![EntityStatusUpdate::grid("g1", EntityStatus::Deleted)]
        );

        let expired = event("g1", DeploymentType::DeleteGrid, JobPhase::Expired, &[]);
        assert_eq!(
            derived_updates(&expired),
            vec![EntityStatusUpdate::grid("g1", EntityStatus::Expired)]
        );
    }

    #[test]
    fn test_error_releases_the_grid() {
        let failed = event(
            "t1",
            DeploymentType::Test,
            JobPhase::Error,
            &[(PARAM_GRID_ID, "g1")],
        );
        assert_eq!(
            derived_updates(&failed),
            vec![
                EntityStatusUpdate::test("t1", EntityStatus::Error),
                EntityStatusUpdate::grid("g1", EntityStatus::Available),
            ]
        );
    }

    #[test]
    fn grid_cleanup_maps_onto_the_grid_entity() {
        let started = event("g1", DeploymentType::GridCleanup, JobPhase::Started, &[]);
        assert_eq!(
            derived_updates(&started),
            vec![EntityStatusUpdate::grid("g1", EntityStatus::Cleaning)]
        );
        let completed = event("g1", DeploymentType::GridCleanup, JobPhase::Completed, &[]);
        assert_eq!(
            derived_updates(&completed),
            vec![EntityStatusUpdate::grid("g1", EntityStatus::Available)]
        );
    }

    #[test]
    fn cascade_table() {
        assert_eq!(
            cascaded_test_status(EntityStatus::Deleted),
            Some(EntityStatus::Stopped)
        );
        assert_eq!(
            cascaded_test_status(EntityStatus::Expired),
            Some(EntityStatus::Expired)
        );
        assert_eq!(cascaded_test_status(EntityStatus::Available), None);
    }

    #[test]
    fn snapshot_trigger_statuses() {
        assert!(EntityStatus::Stopped.triggers_snapshot());
        assert!(EntityStatus::Expired.triggers_snapshot());
        assert!(EntityStatus::Deployed.triggers_snapshot());
        assert!(!EntityStatus::Deploying.triggers_snapshot());
    }

    #[test]
    fn phase_serializes_as_bare_string() {
        assert_eq!(
            serde_json::to_string(&JobPhase::Started).unwrap(),
            r#""Started""#
        );
    }
}
