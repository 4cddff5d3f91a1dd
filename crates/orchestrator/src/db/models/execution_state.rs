//! Execution state model.
//!
//! One row per (execution id, branch id). The root execution uses the
//! empty branch id.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::engine::{ExecutionStatus, EMPTY_BRANCH};
use crate::error::AppError;

/// Tracked status and snapshot of an execution or one of its branches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionState {
    pub execution_id: i64,
    pub branch_id: String,
    pub status: ExecutionStatus,
    #[serde(skip)]
    pub execution_object: Option<Vec<u8>>,
    pub updated_at: DateTime<Utc>,
}

impl ExecutionState {
    pub fn new(
        execution_id: i64,
        branch_id: &str,
        status: ExecutionStatus,
        execution_object: Option<Vec<u8>>,
    ) -> Self {
        Self {
            execution_id,
            branch_id: branch_id.to_string(),
            status,
            execution_object,
            updated_at: Utc::now(),
        }
    }

    pub fn is_root(&self) -> bool {
        self.branch_id == EMPTY_BRANCH
    }
}

/// Database row of `orch.execution_states`.
#[derive(Debug, Clone, FromRow)]
pub struct ExecutionStateRow {
    pub execution_id: i64,
    pub branch_id: String,
    pub status: String,
    pub execution_object: Option<Vec<u8>>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<ExecutionStateRow> for ExecutionState {
    type Error = AppError;

    fn try_from(row: ExecutionStateRow) -> Result<Self, Self::Error> {
        Ok(Self {
            execution_id: row.execution_id,
            branch_id: row.branch_id,
            status: row.status.parse()?,
            execution_object: row.execution_object,
            updated_at: row.updated_at,
        })
    }
}
