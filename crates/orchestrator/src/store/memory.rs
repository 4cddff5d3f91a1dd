//! In-memory store.
//!
//! Writes are applied in place as they happen and recorded in an undo log,
//! which is replayed when a transaction is dropped without commit. Queued
//! messages and write counters are buffered and only published on commit.
//!
//! Row locks are emulated per key: a worker lock entry or a split id. A
//! transaction holds the owned guard of every row it locked until it ends,
//! so concurrent transactions on different workers or splits proceed while
//! those on the same one wait, as they would on PostgreSQL. Reads that take
//! no lock may see another transaction's uncommitted writes.
//!
//! Intended for tests and single-process local runs.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::{Mutex as RowMutex, OwnedMutexGuard};

use super::{
    ExecutionStateRepository, QueueRepository, Store, StoreTx, SuspendedExecutionRepository,
    VersionSource, WorkerLockRepository, WorkerNodeRepository,
};
use crate::db::models::{
    ExecutionState, FinishedBranch, SuspendedExecution, WorkerFilter, WorkerNode, WorkerStatus,
};
use crate::engine::{ExecutionMessage, ExecutionStatus};
use crate::error::{AppError, AppResult};

/// Write counters, published on commit together with the queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryStats {
    /// Non-empty batches handed to the queue
    pub enqueue_batches: usize,
    /// Worker rows written
    pub worker_updates: usize,
    /// Finished branch rows written
    pub finished_branch_inserts: usize,
}

impl MemoryStats {
    fn absorb(&mut self, other: MemoryStats) {
        self.enqueue_batches += other.enqueue_batches;
        self.worker_updates += other.worker_updates;
        self.finished_branch_inserts += other.finished_branch_inserts;
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    next_id: i64,
    workers: HashMap<String, WorkerNode>,
    locks: BTreeSet<String>,
    /// By storage id, so scans run in insertion order
    suspended: BTreeMap<i64, SuspendedExecution>,
    execution_states: BTreeMap<(i64, String), ExecutionState>,
    queue: Vec<ExecutionMessage>,
    stats: MemoryStats,
}

impl MemoryState {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn suspended_id(&self, split_id: &str) -> Option<i64> {
        self.suspended
            .values()
            .find(|s| s.split_id == split_id)
            .map(|s| s.id)
    }
}

/// Prior value of a row written by an open transaction.
enum Undo {
    Worker(String, Option<WorkerNode>),
    LockEntry(String, bool),
    Suspended(i64, Option<SuspendedExecution>),
    ExecutionState((i64, String), Option<ExecutionState>),
}

type RowLocks = Arc<Mutex<HashMap<String, Arc<RowMutex<()>>>>>;

fn worker_row(uuid: &str) -> String {
    format!("worker/{}", uuid)
}

fn split_row(split_id: &str) -> String {
    format!("split/{}", split_id)
}

fn poisoned<T>(_: PoisonError<T>) -> AppError {
    AppError::Internal("memory store lock poisoned".to_string())
}

fn lock_state(state: &Mutex<MemoryState>) -> AppResult<MutexGuard<'_, MemoryState>> {
    state.lock().map_err(poisoned)
}

/// Store keeping everything in process memory.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
    rows: RowLocks,
    versions: Arc<Mutex<HashMap<String, i64>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn snapshot<R>(&self, read: impl FnOnce(&MemoryState) -> R) -> R {
        read(&*self.state.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// Messages committed to the queue, in enqueue order.
    pub async fn queued_messages(&self) -> Vec<ExecutionMessage> {
        self.snapshot(|state| state.queue.clone())
    }

    pub async fn stats(&self) -> MemoryStats {
        self.snapshot(|state| state.stats)
    }

    /// Suspended executions currently stored, finished branches included.
    pub async fn suspended_executions(&self) -> Vec<SuspendedExecution> {
        self.snapshot(|state| state.suspended.values().cloned().collect())
    }

    pub async fn set_version(&self, topic: &str, version: i64) {
        self.versions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(topic.to_string(), version);
    }
}

#[async_trait]
impl Store for MemoryStore {
    type Tx = MemoryTx;

    async fn begin(&self) -> AppResult<MemoryTx> {
        Ok(MemoryTx {
            state: self.state.clone(),
            rows: self.rows.clone(),
            held: HashMap::new(),
            undo: Vec::new(),
            queued: Vec::new(),
            stats: MemoryStats::default(),
        })
    }
}

#[async_trait]
impl VersionSource for MemoryStore {
    async fn current_version(&self, topic: &str) -> AppResult<i64> {
        let versions = self.versions.lock().map_err(poisoned)?;
        Ok(versions.get(topic).copied().unwrap_or(0))
    }

    async fn increment_version(&self, topic: &str) -> AppResult<i64> {
        let mut versions = self.versions.lock().map_err(poisoned)?;
        let version = versions.entry(topic.to_string()).or_insert(0);
        *version += 1;
        Ok(*version)
    }
}

/// Transaction over a [`MemoryStore`].
pub struct MemoryTx {
    state: Arc<Mutex<MemoryState>>,
    rows: RowLocks,
    held: HashMap<String, OwnedMutexGuard<()>>,
    undo: Vec<Undo>,
    queued: Vec<ExecutionMessage>,
    stats: MemoryStats,
}

impl MemoryTx {
    fn row_mutex(&self, key: &str) -> AppResult<Arc<RowMutex<()>>> {
        let mut rows = self.rows.lock().map_err(poisoned)?;
        Ok(rows.entry(key.to_string()).or_default().clone())
    }

    /// Wait for the row lock on `key`. Locks already held are kept.
    async fn lock_row(&mut self, key: String) -> AppResult<()> {
        if self.held.contains_key(&key) {
            return Ok(());
        }
        let guard = self.row_mutex(&key)?.lock_owned().await;
        self.held.insert(key, guard);
        Ok(())
    }

    /// Take the row lock on `key` unless another transaction holds it.
    fn try_lock_row(&mut self, key: String) -> AppResult<bool> {
        if self.held.contains_key(&key) {
            return Ok(true);
        }
        match self.row_mutex(&key)?.try_lock_owned() {
            Ok(guard) => {
                self.held.insert(key, guard);
                Ok(true)
            }
            Err(_) => Ok(false),
        }
    }

    fn rollback(&mut self) {
        if self.undo.is_empty() {
            return;
        }
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        for undo in self.undo.drain(..).rev() {
            match undo {
                Undo::Worker(uuid, Some(worker)) => {
                    state.workers.insert(uuid, worker);
                }
                Undo::Worker(uuid, None) => {
                    state.workers.remove(&uuid);
                }
                Undo::LockEntry(uuid, true) => {
                    state.locks.insert(uuid);
                }
                Undo::LockEntry(uuid, false) => {
                    state.locks.remove(&uuid);
                }
                Undo::Suspended(id, Some(se)) => {
                    state.suspended.insert(id, se);
                }
                Undo::Suspended(id, None) => {
                    state.suspended.remove(&id);
                }
                Undo::ExecutionState(key, Some(es)) => {
                    state.execution_states.insert(key, es);
                }
                Undo::ExecutionState(key, None) => {
                    state.execution_states.remove(&key);
                }
            }
        }
    }
}

impl Drop for MemoryTx {
    fn drop(&mut self) {
        self.rollback();
    }
}

#[async_trait]
impl StoreTx for MemoryTx {
    async fn commit(mut self) -> AppResult<()> {
        let mut state = lock_state(&self.state)?;
        state.queue.append(&mut self.queued);
        state.stats.absorb(self.stats);
        drop(state);
        self.undo.clear();
        Ok(())
    }
}

#[async_trait]
impl WorkerLockRepository for MemoryTx {
    async fn create_worker_lock(&mut self, uuid: &str) -> AppResult<()> {
        if !lock_state(&self.state)?.locks.insert(uuid.to_string()) {
            return Err(AppError::AlreadyExists(format!("lock for worker {}", uuid)));
        }
        self.undo.push(Undo::LockEntry(uuid.to_string(), false));
        Ok(())
    }

    async fn delete_worker_lock(&mut self, uuid: &str) -> AppResult<()> {
        if lock_state(&self.state)?.locks.remove(uuid) {
            self.undo.push(Undo::LockEntry(uuid.to_string(), true));
        }
        Ok(())
    }

    async fn lock_worker(&mut self, uuid: &str) -> AppResult<()> {
        if !lock_state(&self.state)?.locks.contains(uuid) {
            return Err(AppError::NotFound(format!("lock for worker {}", uuid)));
        }
        self.lock_row(worker_row(uuid)).await
    }
}

#[async_trait]
impl WorkerNodeRepository for MemoryTx {
    async fn insert_worker(&mut self, worker: &WorkerNode) -> AppResult<WorkerNode> {
        let mut state = lock_state(&self.state)?;
        if state.workers.contains_key(&worker.uuid) {
            return Err(AppError::AlreadyExists(format!("worker {}", worker.uuid)));
        }
        let stored = WorkerNode {
            id: state.next_id(),
            ..worker.clone()
        };
        state.workers.insert(stored.uuid.clone(), stored.clone());
        self.undo.push(Undo::Worker(stored.uuid.clone(), None));
        Ok(stored)
    }

    async fn find_worker(
        &mut self,
        uuid: &str,
        include_deleted: bool,
    ) -> AppResult<Option<WorkerNode>> {
        Ok(lock_state(&self.state)?
            .workers
            .get(uuid)
            .filter(|w| include_deleted || !w.deleted)
            .cloned())
    }

    async fn find_workers(&mut self, filter: &WorkerFilter) -> AppResult<Vec<WorkerNode>> {
        let mut workers: Vec<WorkerNode> = lock_state(&self.state)?
            .workers
            .values()
            .filter(|w| filter.matches(w))
            .cloned()
            .collect();
        workers.sort_by_key(|w| w.id);
        Ok(workers)
    }

    async fn update_worker(&mut self, worker: &WorkerNode) -> AppResult<()> {
        let mut state = lock_state(&self.state)?;
        let stored = state
            .workers
            .get_mut(&worker.uuid)
            .ok_or_else(|| AppError::NotFound(format!("worker {}", worker.uuid)))?;
        let id = stored.id;
        let previous = std::mem::replace(
            stored,
            WorkerNode {
                id,
                ..worker.clone()
            },
        );
        self.undo.push(Undo::Worker(worker.uuid.clone(), Some(previous)));
        self.stats.worker_updates += 1;
        Ok(())
    }

    async fn find_non_responding_workers(
        &mut self,
        min_version: i64,
        excluded_status: WorkerStatus,
    ) -> AppResult<Vec<String>> {
        let state = lock_state(&self.state)?;
        let mut workers: Vec<&WorkerNode> = state
            .workers
            .values()
            .filter(|w| w.ack_version < min_version && w.status != excluded_status)
            .collect();
        workers.sort_by_key(|w| w.id);
        Ok(workers.into_iter().map(|w| w.uuid.clone()).collect())
    }

    async fn find_groups(&mut self, names: Option<&[String]>) -> AppResult<Vec<String>> {
        let groups: BTreeSet<String> = lock_state(&self.state)?
            .workers
            .values()
            .flat_map(|w| w.groups.iter())
            .filter(|g| names.map_or(true, |n| n.contains(g)))
            .cloned()
            .collect();
        Ok(groups.into_iter().collect())
    }
}

#[async_trait]
impl SuspendedExecutionRepository for MemoryTx {
    async fn insert_suspended_executions(
        &mut self,
        suspended: &[SuspendedExecution],
    ) -> AppResult<()> {
        let mut state = lock_state(&self.state)?;
        for se in suspended {
            if state.suspended_id(&se.split_id).is_some() {
                return Err(AppError::AlreadyExists(format!(
                    "suspended execution for split {}",
                    se.split_id
                )));
            }
            let id = state.next_id();
            state.suspended.insert(
                id,
                SuspendedExecution {
                    id,
                    finished_branches: Vec::new(),
                    ..se.clone()
                },
            );
            self.undo.push(Undo::Suspended(id, None));
        }
        Ok(())
    }

    async fn find_suspended_by_split_ids(
        &mut self,
        split_ids: &[String],
    ) -> AppResult<Vec<SuspendedExecution>> {
        let ordered: BTreeSet<&String> = split_ids.iter().collect();
        for split_id in ordered {
            self.lock_row(split_row(split_id)).await?;
        }

        Ok(lock_state(&self.state)?
            .suspended
            .values()
            .filter(|s| split_ids.contains(&s.split_id))
            .cloned()
            .collect())
    }

    async fn insert_finished_branch(
        &mut self,
        suspended_id: i64,
        branch: &FinishedBranch,
    ) -> AppResult<()> {
        let mut state = lock_state(&self.state)?;
        let parent = state
            .suspended
            .get_mut(&suspended_id)
            .ok_or_else(|| AppError::NotFound(format!("suspended execution {}", suspended_id)))?;
        let previous = parent.clone();
        parent.finished_branches.push(branch.clone());
        self.undo.push(Undo::Suspended(suspended_id, Some(previous)));
        self.stats.finished_branch_inserts += 1;
        Ok(())
    }

    async fn find_join_ready(&mut self, limit: usize) -> AppResult<Vec<SuspendedExecution>> {
        let candidates: Vec<String> = lock_state(&self.state)?
            .suspended
            .values()
            .filter(|s| s.is_join_ready())
            .map(|s| s.split_id.clone())
            .collect();

        let mut ready = Vec::new();
        for split_id in candidates {
            if ready.len() == limit {
                break;
            }
            if !self.try_lock_row(split_row(&split_id))? {
                continue;
            }
            let state = lock_state(&self.state)?;
            if let Some(se) = state
                .suspended
                .values()
                .find(|s| s.split_id == split_id && s.is_join_ready())
            {
                ready.push(se.clone());
            }
        }
        Ok(ready)
    }

    async fn delete_suspended_executions(&mut self, split_ids: &[String]) -> AppResult<usize> {
        let mut state = lock_state(&self.state)?;
        let ids: Vec<i64> = state
            .suspended
            .values()
            .filter(|s| split_ids.contains(&s.split_id))
            .map(|s| s.id)
            .collect();
        for id in &ids {
            let removed = state.suspended.remove(id);
            self.undo.push(Undo::Suspended(*id, removed));
        }
        Ok(ids.len())
    }

    async fn count_suspended_executions(&mut self) -> AppResult<i64> {
        Ok(lock_state(&self.state)?.suspended.len() as i64)
    }
}

#[async_trait]
impl ExecutionStateRepository for MemoryTx {
    async fn find_execution_state(
        &mut self,
        execution_id: i64,
        branch_id: &str,
    ) -> AppResult<Option<ExecutionState>> {
        Ok(lock_state(&self.state)?
            .execution_states
            .get(&(execution_id, branch_id.to_string()))
            .cloned())
    }

    async fn find_execution_states(
        &mut self,
        execution_id: i64,
    ) -> AppResult<Vec<ExecutionState>> {
        Ok(lock_state(&self.state)?
            .execution_states
            .range((execution_id, String::new())..)
            .take_while(|((id, _), _)| *id == execution_id)
            .map(|(_, state)| state.clone())
            .collect())
    }

    async fn find_execution_ids_by_statuses(
        &mut self,
        statuses: &[ExecutionStatus],
    ) -> AppResult<Vec<i64>> {
        let ids: BTreeSet<i64> = lock_state(&self.state)?
            .execution_states
            .values()
            .filter(|s| statuses.contains(&s.status))
            .map(|s| s.execution_id)
            .collect();
        Ok(ids.into_iter().collect())
    }

    async fn upsert_execution_state(&mut self, state: &ExecutionState) -> AppResult<()> {
        let key = (state.execution_id, state.branch_id.clone());
        let previous = lock_state(&self.state)?
            .execution_states
            .insert(key.clone(), state.clone());
        self.undo.push(Undo::ExecutionState(key, previous));
        Ok(())
    }
}

#[async_trait]
impl QueueRepository for MemoryTx {
    async fn enqueue(&mut self, messages: &[ExecutionMessage]) -> AppResult<()> {
        if messages.is_empty() {
            return Ok(());
        }
        self.queued.extend_from_slice(messages);
        self.stats.enqueue_batches += 1;
        Ok(())
    }
}
