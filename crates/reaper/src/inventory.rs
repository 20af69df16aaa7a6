//! Provisioned-grid inventory backed by per-grid state directories.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, warn};

/// One provisioned grid with its declared expiry.
///
/// `state_path` is the directory the record was read from; directory names
/// are not required to match grid ids.
#[derive(Debug, Clone, PartialEq)]
pub struct GridRecord {
    pub grid_id: String,
    pub region: String,
    pub expires_at: DateTime<Utc>,
    pub state_path: PathBuf,
}

#[derive(Error, Debug)]
pub enum InventoryError {
    #[error("listing inventory at {path}: {reason}")]
    List { path: String, reason: String },

    #[error("reading metadata for {path}: {reason}")]
    Metadata { path: String, reason: String },

    #[error("destroying grid {grid_id}: {reason}")]
    Destroy { grid_id: String, reason: String },

    #[error("probing grid {grid_id}: {reason}")]
    Probe { grid_id: String, reason: String },
}

/// Source of provisioned grids and their teardown operation.
#[async_trait]
pub trait Inventory: Send + Sync {
    /// Enumerates provisioned grids. Items whose metadata cannot be read
    /// are logged and skipped, never failing the whole listing.
    async fn list(&self) -> Result<Vec<GridRecord>, InventoryError>;

    /// Tears the grid down. Idempotent: destroying an already-destroyed
    /// grid is a no-op.
    async fn destroy(&self, grid: &GridRecord) -> Result<(), InventoryError>;

    /// True while live resources still exist for the grid.
    async fn remaining(&self, grid: &GridRecord) -> Result<bool, InventoryError>;
}

/// State-output document produced by the provisioning tool.
#[derive(Deserialize)]
struct StateOutputs {
    ttl: StateValue,
    grid_id: StateValue,
    grid_region: StateValue,
}

#[derive(Deserialize)]
struct StateValue {
    value: String,
}

/// Inventory over a directory of provisioning-state subdirectories, one per
/// grid, with teardown delegated to a script.
pub struct ScriptInventory {
    state_dir: PathBuf,
    teardown_script: PathBuf,
}

impl ScriptInventory {
    pub fn new(state_dir: PathBuf, teardown_script: PathBuf) -> Self {
        Self {
            state_dir,
            teardown_script,
        }
    }

    async fn read_metadata(&self, dir: &PathBuf) -> Result<GridRecord, InventoryError> {
        let path = dir.display().to_string();
        let metadata_err = |reason: String| InventoryError::Metadata {
            path: path.clone(),
            reason,
        };

        let output = Command::new("terraform")
            .args(["output", "-json"])
            .current_dir(dir)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| metadata_err(e.to_string()))?;
        if !output.status.success() {
            return Err(metadata_err(format!(
                "state output command exited with {}",
                output.status
            )));
        }

        let outputs: StateOutputs =
            serde_json::from_slice(&output.stdout).map_err(|e| metadata_err(e.to_string()))?;
        let expires_at = DateTime::parse_from_rfc3339(&outputs.ttl.value)
            .map_err(|e| metadata_err(format!("bad ttl {:?}: {}", outputs.ttl.value, e)))?
            .with_timezone(&Utc);

        Ok(GridRecord {
            grid_id: outputs.grid_id.value,
            region: outputs.grid_region.value,
            expires_at,
            state_path: dir.clone(),
        })
    }
}

#[async_trait]
impl Inventory for ScriptInventory {
    async fn list(&self) -> Result<Vec<GridRecord>, InventoryError> {
        let mut entries =
            tokio::fs::read_dir(&self.state_dir)
                .await
                .map_err(|e| InventoryError::List {
                    path: self.state_dir.display().to_string(),
                    reason: e.to_string(),
                })?;

        let mut records = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|e| InventoryError::List {
            path: self.state_dir.display().to_string(),
            reason: e.to_string(),
        })? {
            let dir = entry.path();
            if !dir.is_dir() {
                continue;
            }
            match self.read_metadata(&dir).await {
                Ok(record) => {
                    debug!(grid = %record.grid_id, expires_at = %record.expires_at, "inventory item");
                    records.push(record);
                }
                Err(e) => warn!(error = %e, "skipping unreadable inventory item"),
            }
        }
        Ok(records)
    }

    async fn destroy(&self, grid: &GridRecord) -> Result<(), InventoryError> {
        let status = Command::new(&self.teardown_script)
            .env("GRID_ID", &grid.grid_id)
            .env("GRID_REGION", &grid.region)
            .env("DESTROY", "true")
            .stdin(Stdio::null())
            .status()
            .await
            .map_err(|e| InventoryError::Destroy {
                grid_id: grid.grid_id.clone(),
                reason: e.to_string(),
            })?;

        if !status.success() {
            return Err(InventoryError::Destroy {
                grid_id: grid.grid_id.clone(),
                reason: format!("teardown script exited with {}", status),
            });
        }
        Ok(())
    }

    async fn remaining(&self, grid: &GridRecord) -> Result<bool, InventoryError> {
        // A completed teardown removes the grid's state directory.
        tokio::fs::try_exists(&grid.state_path)
            .await
            .map_err(|e| InventoryError::Probe {
                grid_id: grid.grid_id.clone(),
                reason: e.to_string(),
            })
    }
}
