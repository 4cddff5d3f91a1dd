//! Execution snapshot model and status state machine.
//!
//! An [`Execution`] is the state a flow carries between steps. The
//! orchestration core treats most of it as opaque: it only reads the split
//! and branch identifiers, clears the position on cancel, and records the
//! flow termination type in the system context.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{AppError, AppResult};

/// Branch identifier of a root (non-branch) execution.
pub const EMPTY_BRANCH: &str = "";

/// Positions reserved by the retired branch mechanism.
pub const LEGACY_BRANCH_POSITIONS: [i64; 2] = [-1, -2];

/// Execution status as tracked per (execution id, branch id).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Running,
    Paused,
    PendingPause,
    PendingCancel,
    Canceled,
    Completed,
    SystemFailure,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Running => "RUNNING",
            ExecutionStatus::Paused => "PAUSED",
            ExecutionStatus::PendingPause => "PENDING_PAUSE",
            ExecutionStatus::PendingCancel => "PENDING_CANCEL",
            ExecutionStatus::Canceled => "CANCELED",
            ExecutionStatus::Completed => "COMPLETED",
            ExecutionStatus::SystemFailure => "SYSTEM_FAILURE",
        }
    }

    /// Statuses reported by cancellation queries.
    pub fn cancelled_statuses() -> [ExecutionStatus; 2] {
        [ExecutionStatus::Canceled, ExecutionStatus::PendingCancel]
    }

    /// Whether an execution in this status has been asked to cancel.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ExecutionStatus::Canceled | ExecutionStatus::PendingCancel)
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ExecutionStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "RUNNING" => Ok(ExecutionStatus::Running),
            "PAUSED" => Ok(ExecutionStatus::Paused),
            "PENDING_PAUSE" => Ok(ExecutionStatus::PendingPause),
            "PENDING_CANCEL" => Ok(ExecutionStatus::PendingCancel),
            "CANCELED" => Ok(ExecutionStatus::Canceled),
            "COMPLETED" => Ok(ExecutionStatus::Completed),
            "SYSTEM_FAILURE" => Ok(ExecutionStatus::SystemFailure),
            _ => Err(AppError::Validation(format!(
                "Unknown execution status: {}",
                s
            ))),
        }
    }
}

/// Outputs of one finished branch, as merged into its parent at join.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EndBranchData {
    pub contexts: BTreeMap<String, Value>,
    pub system_context: SystemContext,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Engine-owned context travelling with an execution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemContext {
    /// Set when the flow is to terminate with the given status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flow_termination_type: Option<ExecutionStatus>,

    /// Branch outputs appended by the join.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub finished_branches: Vec<EndBranchData>,

    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// A flow execution snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    pub execution_id: i64,
    pub running_execution_plan_id: i64,
    #[serde(default)]
    pub position: Option<i64>,
    #[serde(default)]
    pub branch_id: Option<String>,
    #[serde(default)]
    pub split_id: Option<String>,
    #[serde(default)]
    pub contexts: BTreeMap<String, Value>,
    #[serde(default)]
    pub system_context: SystemContext,
    #[serde(default)]
    pub error: Option<String>,
}

impl Execution {
    pub fn new(execution_id: i64, running_execution_plan_id: i64, position: Option<i64>) -> Self {
        Self {
            execution_id,
            running_execution_plan_id,
            position,
            ..Self::default()
        }
    }

    /// Build a branch of this execution belonging to `split_id`.
    pub fn branch(&self, branch_id: &str, split_id: &str, position: Option<i64>) -> Self {
        Self {
            execution_id: self.execution_id,
            running_execution_plan_id: self.running_execution_plan_id,
            position,
            branch_id: Some(branch_id.to_string()),
            split_id: Some(split_id.to_string()),
            contexts: self.contexts.clone(),
            system_context: SystemContext::default(),
            error: None,
        }
    }

    /// True when the flow is set to terminate as cancelled.
    pub fn is_canceled(&self) -> bool {
        self.system_context.flow_termination_type == Some(ExecutionStatus::Canceled)
    }

    /// Stop the execution at its next step boundary and terminate it as cancelled.
    pub fn mark_canceled(&mut self) {
        self.position = None;
        self.system_context.flow_termination_type = Some(ExecutionStatus::Canceled);
    }

    pub fn put_finished_child_branches_data(&mut self, data: Vec<EndBranchData>) {
        self.system_context.finished_branches.extend(data);
    }

    /// Reject positions reserved by the retired branch mechanism.
    pub fn ensure_not_legacy_branch(&self) -> AppResult<()> {
        match self.position {
            Some(position) if LEGACY_BRANCH_POSITIONS.contains(&position) => {
                Err(AppError::InvalidState(format!(
                    "branch {} of execution {} finished with reserved position {}",
                    self.branch_id.as_deref().unwrap_or(EMPTY_BRANCH),
                    self.execution_id,
                    position
                )))
            }
            _ => Ok(()),
        }
    }
}

/// Converts execution snapshots to and from their stored bytes.
pub trait ExecutionCodec: Send + Sync {
    fn serialize(&self, execution: &Execution) -> AppResult<Vec<u8>>;
    fn deserialize(&self, bytes: &[u8]) -> AppResult<Execution>;
}

/// JSON snapshot codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonExecutionCodec;

impl ExecutionCodec for JsonExecutionCodec {
    fn serialize(&self, execution: &Execution) -> AppResult<Vec<u8>> {
        Ok(serde_json::to_vec(execution)?)
    }

    fn deserialize(&self, bytes: &[u8]) -> AppResult<Execution> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Result codes of execution control requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionActionResult {
    Success,
    FailedNotFound,
    FailedAlreadyCompleted,
    FailedAlreadyCanceledOrPendingCancellation,
    FailedPendingPause,
    FailedSystemFailure,
}

impl ExecutionActionResult {
    pub fn is_success(&self) -> bool {
        matches!(self, ExecutionActionResult::Success)
    }
}
