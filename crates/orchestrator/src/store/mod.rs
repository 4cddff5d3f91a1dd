//! Transactional storage seam of the orchestration core.
//!
//! Every service operation runs inside one [`StoreTx`]. A transaction is
//! committed explicitly with [`StoreTx::commit`]; dropping it without
//! committing rolls back everything it wrote, including queued messages.
//!
//! Two backends implement the traits:
//!
//! - [`PgStore`]: PostgreSQL via SQLx, row locks for the worker lock
//! - [`MemoryStore`]: in-process with emulated row locks, for tests and local runs

use async_trait::async_trait;

use crate::db::models::{
    ExecutionState, FinishedBranch, SuspendedExecution, WorkerFilter, WorkerNode, WorkerStatus,
};
use crate::engine::{ExecutionMessage, ExecutionStatus};
use crate::error::AppResult;

pub mod memory;
pub mod postgres;

pub use memory::{MemoryStats, MemoryStore};
pub use postgres::{PgStore, PgVersionSource};

/// Topic of the system recovery version advanced by every recovery cycle.
pub const MSG_RECOVERY_VERSION: &str = "MSG_RECOVERY_VERSION";

/// Opens transactions against a backend.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    type Tx: StoreTx;

    async fn begin(&self) -> AppResult<Self::Tx>;
}

/// One unit of work. Rolls back on drop unless committed.
#[async_trait]
pub trait StoreTx:
    WorkerLockRepository
    + WorkerNodeRepository
    + SuspendedExecutionRepository
    + ExecutionStateRepository
    + QueueRepository
    + Send
{
    async fn commit(self) -> AppResult<()>;
}

/// Per-worker lock rows.
#[async_trait]
pub trait WorkerLockRepository {
    /// Fails with `AlreadyExists` when an entry for `uuid` exists.
    async fn create_worker_lock(&mut self, uuid: &str) -> AppResult<()>;

    /// No-op for an unknown uuid.
    async fn delete_worker_lock(&mut self, uuid: &str) -> AppResult<()>;

    /// Block until the lock on `uuid` is held by this transaction.
    ///
    /// Fails with `NotFound` when no entry exists. Locking again within the
    /// same transaction returns immediately.
    async fn lock_worker(&mut self, uuid: &str) -> AppResult<()>;
}

#[async_trait]
pub trait WorkerNodeRepository {
    /// Insert and return the stored worker with its id assigned.
    async fn insert_worker(&mut self, worker: &WorkerNode) -> AppResult<WorkerNode>;

    async fn find_worker(&mut self, uuid: &str, include_deleted: bool)
        -> AppResult<Option<WorkerNode>>;

    /// Workers matching `filter`, ordered by id.
    async fn find_workers(&mut self, filter: &WorkerFilter) -> AppResult<Vec<WorkerNode>>;

    async fn update_worker(&mut self, worker: &WorkerNode) -> AppResult<()>;

    /// Uuids with `ack_version < min_version` and status other than `excluded_status`.
    async fn find_non_responding_workers(
        &mut self,
        min_version: i64,
        excluded_status: WorkerStatus,
    ) -> AppResult<Vec<String>>;

    /// Distinct group names, sorted. Restricted to `names` when given.
    async fn find_groups(&mut self, names: Option<&[String]>) -> AppResult<Vec<String>>;
}

#[async_trait]
pub trait SuspendedExecutionRepository {
    async fn insert_suspended_executions(
        &mut self,
        suspended: &[SuspendedExecution],
    ) -> AppResult<()>;

    /// Suspended executions for the given split ids, finished branches
    /// loaded. The rows stay locked until the transaction ends; a concurrent
    /// caller waits and then sees the committed state.
    async fn find_suspended_by_split_ids(
        &mut self,
        split_ids: &[String],
    ) -> AppResult<Vec<SuspendedExecution>>;

    /// Attach a finished branch to the suspended execution with `suspended_id`.
    async fn insert_finished_branch(
        &mut self,
        suspended_id: i64,
        branch: &FinishedBranch,
    ) -> AppResult<()>;

    /// Up to `limit` suspended executions whose finished branch count equals
    /// their number of branches. Rows returned are held by this transaction
    /// and skipped by concurrent callers.
    async fn find_join_ready(&mut self, limit: usize) -> AppResult<Vec<SuspendedExecution>>;

    /// Delete by split id, together with their finished branches. Returns
    /// the number of suspended executions removed.
    async fn delete_suspended_executions(&mut self, split_ids: &[String]) -> AppResult<usize>;

    async fn count_suspended_executions(&mut self) -> AppResult<i64>;
}

#[async_trait]
pub trait ExecutionStateRepository {
    async fn find_execution_state(
        &mut self,
        execution_id: i64,
        branch_id: &str,
    ) -> AppResult<Option<ExecutionState>>;

    /// The root and every branch of `execution_id`.
    async fn find_execution_states(&mut self, execution_id: i64)
        -> AppResult<Vec<ExecutionState>>;

    async fn find_execution_ids_by_statuses(
        &mut self,
        statuses: &[ExecutionStatus],
    ) -> AppResult<Vec<i64>>;

    async fn upsert_execution_state(&mut self, state: &ExecutionState) -> AppResult<()>;
}

/// The transactional queue sink.
#[async_trait]
pub trait QueueRepository {
    /// Enqueue one batch, visible to consumers once the transaction commits.
    async fn enqueue(&mut self, messages: &[ExecutionMessage]) -> AppResult<()>;
}

/// Source of the monotonic system versions.
#[async_trait]
pub trait VersionSource: Send + Sync {
    async fn current_version(&self, topic: &str) -> AppResult<i64>;

    /// Advance `topic` and return the new value.
    async fn increment_version(&self, topic: &str) -> AppResult<i64>;
}
