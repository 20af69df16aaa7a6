//! Wire message shapes exchanged over the deployer subjects.
//!
//! Field names are part of the bus contract consumed by the control plane
//! and the log viewers, hence the explicit serde renames.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::lifecycle::JobPhase;

/// Well-known parameter keys carried in `Params`.
pub const PARAM_GRID_ID: &str = "GRID_ID";
pub const PARAM_TEST_ID: &str = "TEST_ID";
pub const PARAM_GRID_REGION: &str = "GRID_REGION";

/// Closed set of deployment kinds.
///
/// Every branch that inspects a deployment type matches exhaustively on this
/// enum, so adding a kind is a compile-time-checked exercise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeploymentType {
    Grid,
    Test,
    StopTest,
    CancelTest,
    CancelGrid,
    DeleteGrid,
    GridCleanup,
}

impl DeploymentType {
    /// The cancel counterpart used when a job exits with the sentinel code.
    ///
    /// Kinds without a cancel counterpart map to themselves.
    pub fn cancelled(self) -> DeploymentType {
        match self {
            DeploymentType::Grid => DeploymentType::CancelGrid,
            DeploymentType::Test => DeploymentType::CancelTest,
            DeploymentType::StopTest
            | DeploymentType::CancelTest
            | DeploymentType::CancelGrid
            | DeploymentType::DeleteGrid
            | DeploymentType::GridCleanup => self,
        }
    }

    /// True for kinds whose primary entity is a grid.
    pub fn is_grid_scoped(self) -> bool {
        match self {
            DeploymentType::Grid
            | DeploymentType::CancelGrid
            | DeploymentType::DeleteGrid
            | DeploymentType::GridCleanup => true,
            DeploymentType::Test | DeploymentType::StopTest | DeploymentType::CancelTest => false,
        }
    }

    /// Name of the fixed executable handling this kind, relative to the
    /// configured script directory.
    pub fn script_name(self) -> &'static str {
        match self {
            DeploymentType::Grid => "grid.sh",
            DeploymentType::Test => "test.sh",
            DeploymentType::StopTest => "stop-test.sh",
            DeploymentType::CancelTest => "cancel-test.sh",
            DeploymentType::CancelGrid => "cancel-grid.sh",
            DeploymentType::DeleteGrid => "delete-grid.sh",
            DeploymentType::GridCleanup => "grid-cleanup.sh",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DeploymentType::Grid => "Grid",
            DeploymentType::Test => "Test",
            DeploymentType::StopTest => "StopTest",
            DeploymentType::CancelTest => "CancelTest",
            DeploymentType::CancelGrid => "CancelGrid",
            DeploymentType::DeleteGrid => "DeleteGrid",
            DeploymentType::GridCleanup => "GridCleanup",
        }
    }
}

impl fmt::Display for DeploymentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeploymentType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Grid" => Ok(DeploymentType::Grid),
            "Test" => Ok(DeploymentType::Test),
            "StopTest" => Ok(DeploymentType::StopTest),
            "CancelTest" => Ok(DeploymentType::CancelTest),
            "CancelGrid" => Ok(DeploymentType::CancelGrid),
            "DeleteGrid" => Ok(DeploymentType::DeleteGrid),
            "GridCleanup" => Ok(DeploymentType::GridCleanup),
            other => Err(format!("unknown deployment type: {}", other)),
        }
    }
}

/// Start/stop request published by the control plane on `deployer.start`
/// and `deployer.stop`.
///
/// `Params` is an ordered mapping; the runner injects it into the child
/// process environment with uppercased keys.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentRequest {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "DeploymentType")]
    pub deployment_type: DeploymentType,
    #[serde(rename = "Params", default)]
    pub params: BTreeMap<String, String>,
}

impl DeploymentRequest {
    pub fn new(id: impl Into<String>, deployment_type: DeploymentType) -> Self {
        Self {
            id: id.into(),
            deployment_type,
            params: BTreeMap::new(),
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    /// The grid this request refers to: the `GRID_ID` parameter when
    /// present and non-empty, the primary id otherwise.
    pub fn grid_ref(&self) -> &str {
        grid_ref(&self.id, &self.params)
    }
}

/// Raw job phase event published on `deployer.status`.
///
/// Each publication is independently consumed; there is no retention beyond
/// the bus's own log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentStatusEvent {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "DeploymentType")]
    pub deployment_type: DeploymentType,
    #[serde(rename = "Status")]
    pub status: JobPhase,
    #[serde(rename = "Params", default)]
    pub params: BTreeMap<String, String>,
}

impl DeploymentStatusEvent {
    pub fn new(
        id: impl Into<String>,
        deployment_type: DeploymentType,
        status: JobPhase,
        params: BTreeMap<String, String>,
    ) -> Self {
        Self {
            id: id.into(),
            deployment_type,
            status,
            params,
        }
    }

    pub fn grid_ref(&self) -> &str {
        grid_ref(&self.id, &self.params)
    }

    pub fn test_ref(&self) -> Option<&str> {
        self.params
            .get(PARAM_TEST_ID)
            .map(String::as_str)
            .filter(|s| !s.is_empty())
    }
}

fn grid_ref<'a>(id: &'a str, params: &'a BTreeMap<String, String>) -> &'a str {
    params
        .get(PARAM_GRID_ID)
        .map(String::as_str)
        .filter(|s| !s.is_empty())
        .unwrap_or(id)
}

/// Which process stream a streamed line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum StreamType {
    #[serde(rename = "stdout")]
    Stdout,
    #[serde(rename = "stderr")]
    Stderr,
    #[default]
    #[serde(rename = "")]
    None,
}

/// Streamed output or completion marker published on `deployer.output.<ID>`
/// and, for completions, on `deployer.done`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobOutput {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "DeploymentType")]
    pub deployment_type: DeploymentType,
    #[serde(rename = "StreamType", default)]
    pub stream_type: StreamType,
    #[serde(rename = "Output", default)]
    pub output: String,
    #[serde(rename = "Running")]
    pub running: bool,
}

impl JobOutput {
    pub fn line(
        id: impl Into<String>,
        deployment_type: DeploymentType,
        stream_type: StreamType,
        output: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            deployment_type,
            stream_type,
            output: output.into(),
            running: true,
        }
    }

    pub fn completed(id: impl Into<String>, deployment_type: DeploymentType) -> Self {
        Self {
            id: id.into(),
            deployment_type,
            stream_type: StreamType::None,
            output: String::new(),
            running: false,
        }
    }
}
