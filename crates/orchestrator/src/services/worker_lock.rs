//! Per-worker lock.
//!
//! Dispatch and the recovery sweep both rewrite a worker's recovery version
//! and bulk number. They serialise on the worker's lock entry, held by the
//! calling transaction until it commits or rolls back.

use std::ops::{Deref, DerefMut};

use crate::error::AppResult;
use crate::store::{Store, StoreTx, WorkerLockRepository};

/// Proof that the worker lock is held by the wrapped transaction.
///
/// All work that must happen under the lock goes through the guard. The
/// lock itself is released when the transaction ends, on commit, rollback
/// or drop, so every exit path releases it.
pub struct WorkerLockGuard<'t, T: StoreTx> {
    tx: &'t mut T,
    worker_uuid: String,
}

impl<T: StoreTx> WorkerLockGuard<'_, T> {
    pub fn worker_uuid(&self) -> &str {
        &self.worker_uuid
    }
}

impl<T: StoreTx> std::fmt::Debug for WorkerLockGuard<'_, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerLockGuard")
            .field("worker_uuid", &self.worker_uuid)
            .finish_non_exhaustive()
    }
}

impl<T: StoreTx> Deref for WorkerLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &*self.tx
    }
}

impl<T: StoreTx> DerefMut for WorkerLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut *self.tx
    }
}

/// Acquire the lock on `uuid` for the lifetime of `tx`, waiting for any
/// other holder to finish.
pub async fn lock<'t, T: StoreTx>(tx: &'t mut T, uuid: &str) -> AppResult<WorkerLockGuard<'t, T>> {
    tx.lock_worker(uuid).await?;
    tracing::trace!(worker_uuid = %uuid, "Worker lock acquired");
    Ok(WorkerLockGuard {
        tx,
        worker_uuid: uuid.to_string(),
    })
}

/// Provision the lock entry of a newly registered worker.
pub async fn create_lock<T: StoreTx>(tx: &mut T, uuid: &str) -> AppResult<()> {
    tx.create_worker_lock(uuid).await
}

/// Remove the lock entry of a worker. Unknown uuids are ignored.
pub async fn delete_lock<T: StoreTx>(tx: &mut T, uuid: &str) -> AppResult<()> {
    tx.delete_worker_lock(uuid).await
}

/// Lock entry management in standalone transactions.
#[derive(Clone)]
pub struct WorkerLockService<S: Store> {
    store: S,
}

impl<S: Store> WorkerLockService<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub async fn create(&self, uuid: &str) -> AppResult<()> {
        let mut tx = self.store.begin().await?;
        create_lock(&mut tx, uuid).await?;
        tx.commit().await
    }

    pub async fn delete(&self, uuid: &str) -> AppResult<()> {
        let mut tx = self.store.begin().await?;
        delete_lock(&mut tx, uuid).await?;
        tx.commit().await
    }
}

#[cfg(test)]
mod tests {
    use tokio_test::{assert_pending, assert_ready_ok, task};

    use super::*;
    use crate::engine::ExecutionMessage;
    use crate::error::AppError;
    use crate::store::{MemoryStore, QueueRepository};

    async fn store_with_locks(uuids: &[&str]) -> MemoryStore {
        let store = MemoryStore::new();
        let service = WorkerLockService::new(store.clone());
        for uuid in uuids {
            service.create(uuid).await.unwrap();
        }
        store
    }

    #[tokio::test]
    async fn test_create_twice_fails() {
        let service = WorkerLockService::new(MemoryStore::new());
        service.create("w-1").await.unwrap();
        assert!(matches!(
            service.create("w-1").await,
            Err(AppError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_unknown_is_noop() {
        let service = WorkerLockService::new(MemoryStore::new());
        service.delete("never-created").await.unwrap();
    }

    #[tokio::test]
    async fn test_lock_unknown_worker_fails() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        assert!(matches!(
            lock(&mut tx, "ghost").await,
            Err(AppError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_guard_gives_access_to_transaction() {
        let store = store_with_locks(&["w-1"]).await;

        let mut tx = store.begin().await.unwrap();
        let mut guard = lock(&mut tx, "w-1").await.unwrap();
        assert_eq!(guard.worker_uuid(), "w-1");
        guard
            .enqueue(&[ExecutionMessage::new("1", vec![])])
            .await
            .unwrap();
        drop(guard);
        tx.commit().await.unwrap();

        assert_eq!(store.queued_messages().await.len(), 1);
    }

    #[tokio::test]
    async fn test_lock_blocks_until_holder_ends() {
        let store = store_with_locks(&["w-1"]).await;

        let mut holder = store.begin().await.unwrap();
        lock(&mut holder, "w-1").await.unwrap();

        let mut tx = store.begin().await.unwrap();
        let mut contender = task::spawn(lock(&mut tx, "w-1"));
        assert_pending!(contender.poll());

        drop(holder);
        assert!(contender.is_woken());
        assert_ready_ok!(contender.poll());
    }

    #[tokio::test]
    async fn test_lock_is_per_worker() {
        let store = store_with_locks(&["w-1", "w-2"]).await;

        let mut holder = store.begin().await.unwrap();
        lock(&mut holder, "w-1").await.unwrap();

        let mut tx = store.begin().await.unwrap();
        let mut other = task::spawn(lock(&mut tx, "w-2"));
        assert_ready_ok!(other.poll());
    }

    #[tokio::test]
    async fn test_relocking_in_same_transaction_returns_at_once() {
        let store = store_with_locks(&["w-1"]).await;

        let mut tx = store.begin().await.unwrap();
        lock(&mut tx, "w-1").await.unwrap();
        let mut again = task::spawn(lock(&mut tx, "w-1"));
        assert_ready_ok!(again.poll());
    }
}
