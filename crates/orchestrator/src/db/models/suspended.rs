//! Suspended executions and their finished branches.
//!
//! A suspended execution is a parent flow paused at a split until every
//! branch has reported back. Both records live only between the fork and
//! the join.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::types::Json;
use sqlx::FromRow;

use crate::engine::{EndBranchData, Execution, SystemContext, EMPTY_BRANCH};

/// Outputs captured from a finished branch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BranchContexts {
    pub cancelled: bool,
    pub contexts: BTreeMap<String, Value>,
    pub system_context: SystemContext,
}

/// Completion record of one branch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinishedBranch {
    pub execution_id: String,
    pub branch_id: String,
    pub split_id: String,
    pub branch_error: Option<String>,
    pub branch_contexts: BranchContexts,
}

impl FinishedBranch {
    /// Capture a branch's outputs. The branch counts as cancelled when its
    /// flow terminated as CANCELED.
    pub fn from_execution(execution: &Execution) -> Self {
        Self {
            execution_id: execution.execution_id.to_string(),
            branch_id: execution
                .branch_id
                .clone()
                .unwrap_or_else(|| EMPTY_BRANCH.to_string()),
            split_id: execution.split_id.clone().unwrap_or_default(),
            branch_error: execution.error.clone(),
            branch_contexts: BranchContexts {
                cancelled: execution.is_canceled(),
                contexts: execution.contexts.clone(),
                system_context: execution.system_context.clone(),
            },
        }
    }

    pub fn end_branch_data(&self) -> EndBranchData {
        EndBranchData {
            contexts: self.branch_contexts.contexts.clone(),
            system_context: self.branch_contexts.system_context.clone(),
            error: self.branch_error.clone(),
        }
    }
}

/// A parent execution waiting for its branches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuspendedExecution {
    /// Storage id, assigned on insert
    pub id: i64,
    pub execution_id: String,
    /// Correlation key of the fork, unique
    pub split_id: String,
    /// Fixed at creation
    pub number_of_branches: i32,
    /// Serialized parent execution
    pub execution_object: Vec<u8>,
    /// In order of completion
    pub finished_branches: Vec<FinishedBranch>,
}

impl SuspendedExecution {
    pub fn new(
        execution_id: String,
        split_id: String,
        number_of_branches: i32,
        execution_object: Vec<u8>,
    ) -> Self {
        Self {
            id: 0,
            execution_id,
            split_id,
            number_of_branches,
            execution_object,
            finished_branches: Vec::new(),
        }
    }

    pub fn is_join_ready(&self) -> bool {
        self.finished_branches.len() == self.number_of_branches as usize
    }
}

/// Database row of `orch.suspended_executions`.
#[derive(Debug, Clone, FromRow)]
pub struct SuspendedExecutionRow {
    pub id: i64,
    pub execution_id: String,
    pub split_id: String,
    pub number_of_branches: i32,
    pub execution_object: Vec<u8>,
}

impl SuspendedExecutionRow {
    pub fn into_suspended(self, finished_branches: Vec<FinishedBranch>) -> SuspendedExecution {
        SuspendedExecution {
            id: self.id,
            execution_id: self.execution_id,
            split_id: self.split_id,
            number_of_branches: self.number_of_branches,
            execution_object: self.execution_object,
            finished_branches,
        }
    }
}

/// Database row of `orch.finished_branches`.
#[derive(Debug, Clone, FromRow)]
pub struct FinishedBranchRow {
    pub suspended_execution_id: i64,
    pub execution_id: String,
    pub branch_id: String,
    pub split_id: String,
    pub branch_error: Option<String>,
    pub branch_contexts: Json<BranchContexts>,
}

impl From<FinishedBranchRow> for FinishedBranch {
    fn from(row: FinishedBranchRow) -> Self {
        Self {
            execution_id: row.execution_id,
            branch_id: row.branch_id,
            split_id: row.split_id,
            branch_error: row.branch_error,
            branch_contexts: row.branch_contexts.0,
        }
    }
}
