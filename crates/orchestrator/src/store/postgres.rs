//! PostgreSQL store.

use std::collections::HashSet;

use async_trait::async_trait;
use sqlx::{Postgres, Transaction};

use super::{
    ExecutionStateRepository, QueueRepository, Store, StoreTx, SuspendedExecutionRepository,
    VersionSource, WorkerLockRepository, WorkerNodeRepository,
};
use crate::db::models::{
    ExecutionState, FinishedBranch, SuspendedExecution, WorkerFilter, WorkerNode, WorkerStatus,
};
use crate::db::queries;
use crate::db::DbPool;
use crate::engine::{ExecutionMessage, ExecutionStatus};
use crate::error::AppResult;

/// Store backed by a PostgreSQL pool.
#[derive(Clone)]
pub struct PgStore {
    pool: DbPool,
}

impl PgStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }
}

#[async_trait]
impl Store for PgStore {
    type Tx = PgTx;

    async fn begin(&self) -> AppResult<PgTx> {
        Ok(PgTx {
            tx: self.pool.begin().await?,
            locked: HashSet::new(),
        })
    }
}

/// An open PostgreSQL transaction. SQLx rolls it back on drop.
pub struct PgTx {
    tx: Transaction<'static, Postgres>,
    locked: HashSet<String>,
}

#[async_trait]
impl StoreTx for PgTx {
    async fn commit(self) -> AppResult<()> {
        self.tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl WorkerLockRepository for PgTx {
    async fn create_worker_lock(&mut self, uuid: &str) -> AppResult<()> {
        queries::worker_lock::insert_lock(&mut self.tx, uuid).await
    }

    async fn delete_worker_lock(&mut self, uuid: &str) -> AppResult<()> {
        queries::worker_lock::delete_lock(&mut self.tx, uuid).await
    }

    async fn lock_worker(&mut self, uuid: &str) -> AppResult<()> {
        if self.locked.contains(uuid) {
            return Ok(());
        }
        queries::worker_lock::lock(&mut self.tx, uuid).await?;
        self.locked.insert(uuid.to_string());
        Ok(())
    }
}

#[async_trait]
impl WorkerNodeRepository for PgTx {
    async fn insert_worker(&mut self, worker: &WorkerNode) -> AppResult<WorkerNode> {
        let id = queries::worker::insert_worker(&mut self.tx, worker).await?;
        Ok(WorkerNode {
            id,
            ..worker.clone()
        })
    }

    async fn find_worker(
        &mut self,
        uuid: &str,
        include_deleted: bool,
    ) -> AppResult<Option<WorkerNode>> {
        queries::worker::get_worker(&mut self.tx, uuid, include_deleted).await
    }

    async fn find_workers(&mut self, filter: &WorkerFilter) -> AppResult<Vec<WorkerNode>> {
        queries::worker::list_workers(&mut self.tx, filter).await
    }

    async fn update_worker(&mut self, worker: &WorkerNode) -> AppResult<()> {
        queries::worker::update_worker(&mut self.tx, worker).await
    }

    async fn find_non_responding_workers(
        &mut self,
        min_version: i64,
        excluded_status: WorkerStatus,
    ) -> AppResult<Vec<String>> {
        queries::worker::list_non_responding(&mut self.tx, min_version, excluded_status).await
    }

    async fn find_groups(&mut self, names: Option<&[String]>) -> AppResult<Vec<String>> {
        queries::worker::list_groups(&mut self.tx, names).await
    }
}

#[async_trait]
impl SuspendedExecutionRepository for PgTx {
    async fn insert_suspended_executions(
        &mut self,
        suspended: &[SuspendedExecution],
    ) -> AppResult<()> {
        queries::suspended::insert_suspended(&mut self.tx, suspended).await
    }

    async fn find_suspended_by_split_ids(
        &mut self,
        split_ids: &[String],
    ) -> AppResult<Vec<SuspendedExecution>> {
        queries::suspended::get_by_split_ids(&mut self.tx, split_ids).await
    }

    async fn insert_finished_branch(
        &mut self,
        suspended_id: i64,
        branch: &FinishedBranch,
    ) -> AppResult<()> {
        queries::suspended::insert_finished_branch(&mut self.tx, suspended_id, branch).await
    }

    async fn find_join_ready(&mut self, limit: usize) -> AppResult<Vec<SuspendedExecution>> {
        queries::suspended::get_join_ready(&mut self.tx, limit).await
    }

    async fn delete_suspended_executions(&mut self, split_ids: &[String]) -> AppResult<usize> {
        queries::suspended::delete_by_split_ids(&mut self.tx, split_ids).await
    }

    async fn count_suspended_executions(&mut self) -> AppResult<i64> {
        queries::suspended::count(&mut self.tx).await
    }
}

#[async_trait]
impl ExecutionStateRepository for PgTx {
    async fn find_execution_state(
        &mut self,
        execution_id: i64,
        branch_id: &str,
    ) -> AppResult<Option<ExecutionState>> {
        queries::execution_state::get_state(&mut self.tx, execution_id, branch_id).await
    }

    async fn find_execution_states(
        &mut self,
        execution_id: i64,
    ) -> AppResult<Vec<ExecutionState>> {
        queries::execution_state::get_states(&mut self.tx, execution_id).await
    }

    async fn find_execution_ids_by_statuses(
        &mut self,
        statuses: &[ExecutionStatus],
    ) -> AppResult<Vec<i64>> {
        queries::execution_state::get_ids_by_statuses(&mut self.tx, statuses).await
    }

    async fn upsert_execution_state(&mut self, state: &ExecutionState) -> AppResult<()> {
        queries::execution_state::upsert_state(&mut self.tx, state).await
    }
}

#[async_trait]
impl QueueRepository for PgTx {
    async fn enqueue(&mut self, messages: &[ExecutionMessage]) -> AppResult<()> {
        queries::queue::enqueue(&mut self.tx, messages).await
    }
}

/// Version topics stored in `orch.versions`.
#[derive(Clone)]
pub struct PgVersionSource {
    pool: DbPool,
}

impl PgVersionSource {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl VersionSource for PgVersionSource {
    async fn current_version(&self, topic: &str) -> AppResult<i64> {
        queries::version::current_version(&self.pool, topic).await
    }

    async fn increment_version(&self, topic: &str) -> AppResult<i64> {
        queries::version::increment_version(&self.pool, topic).await
    }
}
