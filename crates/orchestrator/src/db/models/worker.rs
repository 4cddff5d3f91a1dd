//! Worker node model.
//!
//! A worker node is one registered worker identity. It is never physically
//! deleted: deregistration sets `deleted` and the uuid is not reused.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::error::AppError;

/// Group every new worker joins.
pub const DEFAULT_WORKER_GROUP: &str = "DEFAULT";

/// Worker liveness status.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerStatus {
    Failed,
    Running,
    InRecovery,
    Recovered,
}

impl WorkerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerStatus::Failed => "FAILED",
            WorkerStatus::Running => "RUNNING",
            WorkerStatus::InRecovery => "IN_RECOVERY",
            WorkerStatus::Recovered => "RECOVERED",
        }
    }
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for WorkerStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "FAILED" => Ok(WorkerStatus::Failed),
            "RUNNING" => Ok(WorkerStatus::Running),
            "IN_RECOVERY" => Ok(WorkerStatus::InRecovery),
            "RECOVERED" => Ok(WorkerStatus::Recovered),
            _ => Err(AppError::Validation(format!("Unknown worker status: {}", s))),
        }
    }
}

/// A registered worker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerNode {
    /// Storage id, assigned on insert
    pub id: i64,

    /// Immutable worker identity
    pub uuid: String,

    pub host_name: String,

    pub install_path: String,

    /// Login secret, never returned by the API
    #[serde(skip_serializing, default)]
    pub password: String,

    pub status: WorkerStatus,

    pub active: bool,

    /// Time of the last liveness ping
    pub ack_time: Option<DateTime<Utc>>,

    /// System recovery version observed at the last liveness ping
    pub ack_version: i64,

    /// Worker recovery version (WRV) issued at creation and at each recovery
    pub worker_recovery_version: String,

    /// Bulk number of the last committed dispatch
    pub bulk_number: Option<String>,

    /// Software version reported at login
    pub version: String,

    /// Group membership, never empty
    pub groups: Vec<String>,

    pub deleted: bool,
}

impl WorkerNode {
    /// A freshly registered worker: FAILED, inactive, in the default group.
    pub fn new(uuid: &str, password: &str, host_name: &str, install_path: &str) -> Self {
        Self {
            id: 0,
            uuid: uuid.to_string(),
            host_name: host_name.to_string(),
            install_path: install_path.to_string(),
            password: password.to_string(),
            status: WorkerStatus::Failed,
            active: false,
            ack_time: None,
            ack_version: 0,
            worker_recovery_version: uuid::Uuid::new_v4().to_string(),
            bulk_number: None,
            version: String::new(),
            groups: vec![DEFAULT_WORKER_GROUP.to_string()],
            deleted: false,
        }
    }

    /// Whether the worker may receive work from its groups.
    pub fn is_available(&self) -> bool {
        self.active && !self.deleted && self.status == WorkerStatus::Running
    }
}

/// Database row of `orch.worker_nodes`.
#[derive(Debug, Clone, FromRow)]
pub struct WorkerNodeRow {
    pub id: i64,
    pub uuid: String,
    pub host_name: String,
    pub install_path: String,
    pub password: String,
    pub status: String,
    pub active: bool,
    pub ack_time: Option<DateTime<Utc>>,
    pub ack_version: i64,
    pub worker_recovery_version: String,
    pub bulk_number: Option<String>,
    pub version: String,
    pub groups: Vec<String>,
    pub deleted: bool,
}

impl TryFrom<WorkerNodeRow> for WorkerNode {
    type Error = AppError;

    fn try_from(row: WorkerNodeRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            uuid: row.uuid,
            host_name: row.host_name,
            install_path: row.install_path,
            password: row.password,
            status: row.status.parse()?,
            active: row.active,
            ack_time: row.ack_time,
            ack_version: row.ack_version,
            worker_recovery_version: row.worker_recovery_version,
            bulk_number: row.bulk_number,
            version: row.version,
            groups: row.groups,
            deleted: row.deleted,
        })
    }
}

/// Filter for listing workers. `None` fields match any value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkerFilter {
    pub deleted: Option<bool>,
    pub active: Option<bool>,
    pub status: Option<WorkerStatus>,
}

impl WorkerFilter {
    pub fn not_deleted() -> Self {
        Self {
            deleted: Some(false),
            ..Self::default()
        }
    }

    pub fn matches(&self, worker: &WorkerNode) -> bool {
        self.deleted.map_or(true, |d| worker.deleted == d)
            && self.active.map_or(true, |a| worker.active == a)
            && self.status.map_or(true, |s| worker.status == s)
    }
}
