//! In-memory record of the jobs this replica is running.
//!
//! The registry owns the map; callers only get the synchronized accessors,
//! so the duplicate-delivery guard and removal cannot race.

use std::collections::HashMap;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use stampede_shared::deployment::{
    DeploymentRequest, DeploymentType, PARAM_GRID_REGION, PARAM_TEST_ID,
};

/// Composite key scoping the at-most-one-concurrent-job guarantee.
///
/// Grid-scoped kinds key on the referenced grid and region; test-scoped
/// kinds additionally carry the test id, so a test job and a grid job for
/// the same grid never collide. A stop request for the same entity derives
/// the same key as the start request it targets.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JobKey(String);

impl JobKey {
    pub fn derive(request: &DeploymentRequest) -> Self {
        let region = request
            .params
            .get(PARAM_GRID_REGION)
            .map(String::as_str)
            .unwrap_or("");
        let key = if request.deployment_type.is_grid_scoped() {
            format!("grid:{}:{}", request.grid_ref(), region)
        } else {
            let test_id = request
                .params
                .get(PARAM_TEST_ID)
                .map(String::as_str)
                .filter(|s| !s.is_empty())
                .unwrap_or(&request.id);
            format!("test:{}:{}:{}", test_id, request.grid_ref(), region)
        };
        JobKey(key)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Handle to a registered job: enough to identify it and ask it to stop.
#[derive(Debug, Clone)]
pub struct JobHandle {
    pub id: String,
    pub deployment_type: DeploymentType,
    pub cancel: CancellationToken,
}

#[derive(Default)]
pub struct JobRegistry {
    jobs: Mutex<HashMap<JobKey, JobHandle>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a job unless one with the same key already exists.
    /// Returns false on the duplicate, leaving the existing entry untouched.
    pub async fn try_register(&self, key: JobKey, handle: JobHandle) -> bool {
        let mut jobs = self.jobs.lock().await;
        if jobs.contains_key(&key) {
            return false;
        }
        jobs.insert(key, handle);
        true
    }

    pub async fn get(&self, key: &JobKey) -> Option<JobHandle> {
        self.jobs.lock().await.get(key).cloned()
    }

    pub async fn remove(&self, key: &JobKey) -> Option<JobHandle> {
        self.jobs.lock().await.remove(key)
    }

    #[cfg(test)]
    pub async fn len(&self) -> usize {
        self.jobs.lock().await.len()
    }
}
