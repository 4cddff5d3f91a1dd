//! Worker registry service.
//!
//! Tracks worker liveness, recovery version, last accepted bulk number,
//! activation and group membership. Every method runs in its own
//! transaction; the `*_in` variants compose into a caller's transaction.
//!
//! A worker row is only rewritten under its worker lock, so a liveness ping
//! or a group change never writes back a recovery version or bulk number
//! that dispatch or recovery replaced in the meantime.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;

use super::worker_lock;
use crate::db::models::{WorkerFilter, WorkerNode, WorkerStatus};
use crate::error::{AppError, AppResult};
use crate::store::{Store, StoreTx, VersionSource, WorkerNodeRepository, MSG_RECOVERY_VERSION};

/// Callbacks around worker login. Any error aborts the login.
#[async_trait]
pub trait LoginListener: Send + Sync {
    async fn pre_login(&self, worker_uuid: &str) -> AppResult<()>;
    async fn post_login(&self, worker_uuid: &str) -> AppResult<()>;
}

/// Worker registry.
pub struct WorkerNodeService<S: Store> {
    store: S,
    versions: Arc<dyn VersionSource>,
    login_listeners: Vec<Arc<dyn LoginListener>>,
    max_version_gap_allowed: i64,
}

impl<S: Store> WorkerNodeService<S> {
    pub fn new(
        store: S,
        versions: Arc<dyn VersionSource>,
        login_listeners: Vec<Arc<dyn LoginListener>>,
        max_version_gap_allowed: i64,
    ) -> Self {
        Self {
            store,
            versions,
            login_listeners,
            max_version_gap_allowed,
        }
    }

    /// Record a liveness ping and return the worker's recovery version.
    pub async fn keep_alive(&self, uuid: &str) -> AppResult<String> {
        let mut tx = self.store.begin().await?;
        let wrv = self.keep_alive_in(&mut tx, uuid).await?;
        tx.commit().await?;
        Ok(wrv)
    }

    pub async fn keep_alive_in<T: StoreTx>(&self, tx: &mut T, uuid: &str) -> AppResult<String> {
        let mut guard = worker_lock::lock(tx, uuid).await?;
        let mut worker = read_by_uuid_in(&mut *guard, uuid).await?;
        let version = self.versions.current_version(MSG_RECOVERY_VERSION).await?;

        worker.ack_time = Some(Utc::now());
        worker.ack_version = version;
        if worker.status != WorkerStatus::InRecovery {
            worker.status = WorkerStatus::Running;
        }
        guard.update_worker(&worker).await?;

        tracing::debug!(worker_uuid = %uuid, ack_version = version, "Worker keep-alive");
        Ok(worker.worker_recovery_version)
    }

    /// Log a worker in and return its recovery version.
    ///
    /// Runs the pre-login listeners, the keep-alive, the post-login listeners
    /// and records the reported software version, all in one transaction.
    pub async fn up(&self, uuid: &str, version: &str) -> AppResult<String> {
        let mut tx = self.store.begin().await?;

        for listener in &self.login_listeners {
            listener.pre_login(uuid).await?;
        }
        let wrv = self.keep_alive_in(&mut tx, uuid).await?;
        for listener in &self.login_listeners {
            listener.post_login(uuid).await?;
        }
        update_version_in(&mut tx, uuid, version).await?;

        tx.commit().await?;
        tracing::info!(worker_uuid = %uuid, version = %version, "Worker logged in");
        Ok(wrv)
    }

    /// Register a worker: FAILED, inactive, in the default group, with its
    /// lock entry provisioned.
    pub async fn create(
        &self,
        uuid: &str,
        password: &str,
        host_name: &str,
        install_dir: &str,
    ) -> AppResult<WorkerNode> {
        let mut tx = self.store.begin().await?;

        if tx.find_worker(uuid, true).await?.is_some() {
            return Err(AppError::AlreadyExists(format!("worker {}", uuid)));
        }
        let worker = tx
            .insert_worker(&WorkerNode::new(uuid, password, host_name, install_dir))
            .await?;
        worker_lock::create_lock(&mut tx, uuid).await?;

        tx.commit().await?;
        tracing::info!(worker_uuid = %uuid, host_name = %host_name, "Worker registered");
        Ok(worker)
    }

    /// Soft-delete a worker. The uuid stays reserved.
    pub async fn update_worker_to_deleted(&self, uuid: &str) -> AppResult<()> {
        self.modify(uuid, |worker| {
            worker.active = false;
            worker.deleted = true;
            worker.status = WorkerStatus::InRecovery;
            Ok(())
        })
        .await?;
        tracing::info!(worker_uuid = %uuid, "Worker deleted");
        Ok(())
    }

    pub async fn read_all_not_deleted_workers(&self) -> AppResult<Vec<WorkerNode>> {
        self.find(WorkerFilter::not_deleted()).await
    }

    /// Non-deleted worker by uuid.
    pub async fn read_by_uuid(&self, uuid: &str) -> AppResult<WorkerNode> {
        let mut tx = self.store.begin().await?;
        read_by_uuid_in(&mut tx, uuid).await
    }

    /// Worker by uuid, deleted or not.
    pub async fn find_by_uuid(&self, uuid: &str) -> AppResult<WorkerNode> {
        let mut tx = self.store.begin().await?;
        find_by_uuid_in(&mut tx, uuid).await
    }

    pub async fn read_all_workers(&self) -> AppResult<Vec<WorkerNode>> {
        self.find(WorkerFilter::default()).await
    }

    pub async fn read_all_workers_uuids(&self) -> AppResult<Vec<String>> {
        Ok(self
            .read_all_workers()
            .await?
            .into_iter()
            .map(|w| w.uuid)
            .collect())
    }

    /// Record the software version a worker reported.
    pub async fn update_version(&self, uuid: &str, version: &str) -> AppResult<()> {
        let mut tx = self.store.begin().await?;
        update_version_in(&mut tx, uuid, version).await?;
        tx.commit().await
    }

    /// Workers more than `max_version_gap_allowed` recovery cycles behind
    /// that have not been recovered yet.
    pub async fn read_non_responding_workers(&self) -> AppResult<Vec<String>> {
        let mut tx = self.store.begin().await?;
        self.read_non_responding_workers_in(&mut tx).await
    }

    pub async fn read_non_responding_workers_in<T: StoreTx>(
        &self,
        tx: &mut T,
    ) -> AppResult<Vec<String>> {
        let system_version = self.versions.current_version(MSG_RECOVERY_VERSION).await?;
        let min_version_allowed = min_version_allowed(system_version, self.max_version_gap_allowed);
        tx.find_non_responding_workers(min_version_allowed, WorkerStatus::Recovered)
            .await
    }

    /// Non-deleted workers with the given activation.
    pub async fn read_workers_by_activation(&self, active: bool) -> AppResult<Vec<WorkerNode>> {
        self.find(WorkerFilter {
            deleted: Some(false),
            active: Some(active),
            status: None,
        })
        .await
    }

    pub async fn activate(&self, uuid: &str) -> AppResult<()> {
        self.modify(uuid, |worker| {
            worker.active = true;
            Ok(())
        })
        .await
    }

    pub async fn deactivate(&self, uuid: &str) -> AppResult<()> {
        self.modify(uuid, |worker| {
            worker.active = false;
            Ok(())
        })
        .await
    }

    /// Set the status of a worker, deleted or not.
    pub async fn update_status(&self, uuid: &str, status: WorkerStatus) -> AppResult<()> {
        let mut tx = self.store.begin().await?;
        update_status_in(&mut tx, uuid, status).await?;
        tx.commit().await
    }

    /// Every group any worker belongs to, sorted.
    pub async fn read_all_worker_groups(&self) -> AppResult<Vec<String>> {
        let mut tx = self.store.begin().await?;
        tx.find_groups(None).await
    }

    /// Those of `names` that at least one worker belongs to.
    pub async fn read_existing_groups(&self, names: &[String]) -> AppResult<Vec<String>> {
        let mut tx = self.store.begin().await?;
        tx.find_groups(Some(names)).await
    }

    pub async fn read_worker_groups(&self, uuid: &str) -> AppResult<Vec<String>> {
        Ok(self.read_by_uuid(uuid).await?.groups)
    }

    /// Replace a worker's groups. The set may not be empty.
    pub async fn update_worker_groups(&self, uuid: &str, groups: Vec<String>) -> AppResult<()> {
        let groups = dedup_groups(groups);
        if groups.is_empty() {
            return Err(empty_groups_error(uuid));
        }
        self.modify(uuid, move |worker| {
            worker.groups = groups;
            Ok(())
        })
        .await
    }

    /// Group name to uuids of the active, running, non-deleted workers in it.
    pub async fn read_group_workers_map_active_and_running(
        &self,
    ) -> AppResult<BTreeMap<String, Vec<String>>> {
        let workers = self
            .find(WorkerFilter {
                deleted: Some(false),
                active: Some(true),
                status: Some(WorkerStatus::Running),
            })
            .await?;

        let mut map: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for worker in workers {
            for group in &worker.groups {
                map.entry(group.clone()).or_default().push(worker.uuid.clone());
            }
        }
        Ok(map)
    }

    /// Add a group to a worker. Adding a group it already has is a no-op.
    pub async fn add_group_to_worker(&self, uuid: &str, group: &str) -> AppResult<()> {
        self.modify(uuid, |worker| {
            if !worker.groups.iter().any(|g| g == group) {
                worker.groups.push(group.to_string());
            }
            Ok(())
        })
        .await
    }

    /// Remove a group from a worker. A worker may not be left without groups.
    pub async fn remove_group_from_worker(&self, uuid: &str, group: &str) -> AppResult<()> {
        self.modify(uuid, |worker| {
            let remaining: Vec<String> = worker
                .groups
                .iter()
                .filter(|g| g.as_str() != group)
                .cloned()
                .collect();
            if remaining.is_empty() {
                return Err(empty_groups_error(&worker.uuid));
            }
            worker.groups = remaining;
            Ok(())
        })
        .await
    }

    pub async fn update_bulk_number(&self, uuid: &str, bulk_number: &str) -> AppResult<()> {
        let mut tx = self.store.begin().await?;
        update_bulk_number_in(&mut tx, uuid, bulk_number).await?;
        tx.commit().await
    }

    /// Set the recovery version of a worker, deleted or not.
    pub async fn update_wrv(&self, uuid: &str, wrv: &str) -> AppResult<()> {
        let mut tx = self.store.begin().await?;
        update_wrv_in(&mut tx, uuid, wrv).await?;
        tx.commit().await
    }

    async fn find(&self, filter: WorkerFilter) -> AppResult<Vec<WorkerNode>> {
        let mut tx = self.store.begin().await?;
        tx.find_workers(&filter).await
    }

    /// Change one non-deleted worker in a transaction of its own.
    async fn modify<F>(&self, uuid: &str, change: F) -> AppResult<()>
    where
        F: FnOnce(&mut WorkerNode) -> AppResult<()> + Send,
    {
        let mut tx = self.store.begin().await?;
        change_worker_in(&mut tx, uuid, false, change).await?;
        tx.commit().await
    }
}

/// Lowest ack version a worker may report without being non-responding.
pub fn min_version_allowed(system_version: i64, max_version_gap_allowed: i64) -> i64 {
    (system_version - max_version_gap_allowed).max(0)
}

pub async fn read_by_uuid_in<T: StoreTx>(tx: &mut T, uuid: &str) -> AppResult<WorkerNode> {
    tx.find_worker(uuid, false)
        .await?
        .ok_or_else(|| worker_not_found(uuid))
}

pub async fn find_by_uuid_in<T: StoreTx>(tx: &mut T, uuid: &str) -> AppResult<WorkerNode> {
    tx.find_worker(uuid, true)
        .await?
        .ok_or_else(|| worker_not_found(uuid))
}

fn worker_not_found(uuid: &str) -> AppError {
    AppError::NotFound(format!("no worker was found by uuid {}", uuid))
}

/// Lock the worker, then load, change and write it back.
async fn change_worker_in<T, F>(
    tx: &mut T,
    uuid: &str,
    include_deleted: bool,
    change: F,
) -> AppResult<()>
where
    T: StoreTx,
    F: FnOnce(&mut WorkerNode) -> AppResult<()> + Send,
{
    let mut guard = worker_lock::lock(tx, uuid).await?;
    let mut worker = guard
        .find_worker(uuid, include_deleted)
        .await?
        .ok_or_else(|| worker_not_found(uuid))?;
    change(&mut worker)?;
    guard.update_worker(&worker).await
}

pub async fn update_version_in<T: StoreTx>(tx: &mut T, uuid: &str, version: &str) -> AppResult<()> {
    change_worker_in(tx, uuid, true, |worker| {
        worker.version = version.to_string();
        Ok(())
    })
    .await
}

pub async fn update_status_in<T: StoreTx>(
    tx: &mut T,
    uuid: &str,
    status: WorkerStatus,
) -> AppResult<()> {
    change_worker_in(tx, uuid, true, |worker| {
        worker.status = status;
        Ok(())
    })
    .await
}

pub async fn update_bulk_number_in<T: StoreTx>(
    tx: &mut T,
    uuid: &str,
    bulk_number: &str,
) -> AppResult<()> {
    change_worker_in(tx, uuid, false, |worker| {
        worker.bulk_number = Some(bulk_number.to_string());
        Ok(())
    })
    .await
}

pub async fn update_wrv_in<T: StoreTx>(tx: &mut T, uuid: &str, wrv: &str) -> AppResult<()> {
    change_worker_in(tx, uuid, true, |worker| {
        worker.worker_recovery_version = wrv.to_string();
        Ok(())
    })
    .await
}

fn dedup_groups(groups: Vec<String>) -> Vec<String> {
    let mut unique: Vec<String> = Vec::with_capacity(groups.len());
    for group in groups {
        if !unique.contains(&group) {
            unique.push(group);
        }
    }
    unique
}

fn empty_groups_error(uuid: &str) -> AppError {
    AppError::InvalidState(format!(
        "cannot leave a worker without any group (worker {})",
        uuid
    ))
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use tokio_test::{assert_pending, assert_ready_ok, task};

    use super::*;
    use crate::db::models::DEFAULT_WORKER_GROUP;
    use crate::store::MemoryStore;

    #[derive(Default)]
    struct RecordingListener {
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl LoginListener for RecordingListener {
        async fn pre_login(&self, worker_uuid: &str) -> AppResult<()> {
            self.calls.lock().unwrap().push(format!("pre:{}", worker_uuid));
            Ok(())
        }

        async fn post_login(&self, worker_uuid: &str) -> AppResult<()> {
            self.calls.lock().unwrap().push(format!("post:{}", worker_uuid));
            Ok(())
        }
    }

    struct RejectingListener;

    #[async_trait]
    impl LoginListener for RejectingListener {
        async fn pre_login(&self, _worker_uuid: &str) -> AppResult<()> {
            Ok(())
        }

        async fn post_login(&self, worker_uuid: &str) -> AppResult<()> {
            Err(AppError::Hook(format!("license check failed for {}", worker_uuid)))
        }
    }

    fn service(
        store: &MemoryStore,
        listeners: Vec<Arc<dyn LoginListener>>,
    ) -> WorkerNodeService<MemoryStore> {
        WorkerNodeService::new(store.clone(), Arc::new(store.clone()), listeners, 2)
    }

    #[tokio::test]
    async fn test_create_registers_failed_inactive_worker_with_lock() {
        let store = MemoryStore::new();
        let service = service(&store, vec![]);
        let worker = service.create("w-1", "pw", "host", "/opt").await.unwrap();

        assert_eq!(worker.status, WorkerStatus::Failed);
        assert!(!worker.active);
        assert_eq!(worker.groups, vec![DEFAULT_WORKER_GROUP.to_string()]);

        let mut tx = store.begin().await.unwrap();
        worker_lock::lock(&mut tx, "w-1").await.unwrap();
    }

    #[tokio::test]
    async fn test_create_rejects_reused_uuid_even_when_deleted() {
        let store = MemoryStore::new();
        let service = service(&store, vec![]);
        service.create("w-1", "pw", "host", "/opt").await.unwrap();
        service.update_worker_to_deleted("w-1").await.unwrap();

        assert!(matches!(
            service.create("w-1", "pw", "host", "/opt").await,
            Err(AppError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn test_keep_alive_updates_ack_and_status() {
        let store = MemoryStore::new();
        store.set_version(MSG_RECOVERY_VERSION, 5).await;
        let service = service(&store, vec![]);
        let created = service.create("w-1", "pw", "host", "/opt").await.unwrap();

        let wrv = service.keep_alive("w-1").await.unwrap();
        assert_eq!(wrv, created.worker_recovery_version);

        let worker = service.read_by_uuid("w-1").await.unwrap();
        assert_eq!(worker.ack_version, 5);
        assert_eq!(worker.status, WorkerStatus::Running);
        assert!(worker.ack_time.is_some());
    }

    #[tokio::test]
    async fn test_keep_alive_keeps_in_recovery_status() {
        let store = MemoryStore::new();
        let service = service(&store, vec![]);
        service.create("w-1", "pw", "host", "/opt").await.unwrap();
        service
            .update_status("w-1", WorkerStatus::InRecovery)
            .await
            .unwrap();

        service.keep_alive("w-1").await.unwrap();
        let worker = service.read_by_uuid("w-1").await.unwrap();
        assert_eq!(worker.status, WorkerStatus::InRecovery);
    }

    #[tokio::test]
    async fn test_keep_alive_unknown_worker_fails() {
        let store = MemoryStore::new();
        let service = service(&store, vec![]);
        assert!(matches!(
            service.keep_alive("ghost").await,
            Err(AppError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_up_runs_hooks_in_order_and_records_version() {
        let store = MemoryStore::new();
        let listener = Arc::new(RecordingListener::default());
        let service = service(&store, vec![listener.clone() as Arc<dyn LoginListener>]);
        service.create("w-1", "pw", "host", "/opt").await.unwrap();

        service.up("w-1", "1.4.0").await.unwrap();

        assert_eq!(
            *listener.calls.lock().unwrap(),
            vec!["pre:w-1".to_string(), "post:w-1".to_string()]
        );
        let worker = service.read_by_uuid("w-1").await.unwrap();
        assert_eq!(worker.version, "1.4.0");
        assert_eq!(worker.status, WorkerStatus::Running);
    }

    #[tokio::test]
    async fn test_up_hook_failure_aborts_login() {
        let store = MemoryStore::new();
        let service = service(&store, vec![Arc::new(RejectingListener) as Arc<dyn LoginListener>]);
        service.create("w-1", "pw", "host", "/opt").await.unwrap();

        assert!(matches!(
            service.up("w-1", "1.4.0").await,
            Err(AppError::Hook(_))
        ));

        let worker = service.read_by_uuid("w-1").await.unwrap();
        assert_eq!(worker.status, WorkerStatus::Failed);
        assert_eq!(worker.version, "");
        assert!(worker.ack_time.is_none());
    }

    #[tokio::test]
    async fn test_non_responding_boundary() {
        let store = MemoryStore::new();
        let service = service(&store, vec![]);
        service.create("lagging", "pw", "host", "/opt").await.unwrap();
        service.create("fresh", "pw", "host", "/opt").await.unwrap();

        store.set_version(MSG_RECOVERY_VERSION, 7).await;
        service.keep_alive("lagging").await.unwrap();
        store.set_version(MSG_RECOVERY_VERSION, 8).await;
        service.keep_alive("fresh").await.unwrap();
        store.set_version(MSG_RECOVERY_VERSION, 10).await;

        assert_eq!(
            service.read_non_responding_workers().await.unwrap(),
            vec!["lagging".to_string()]
        );
    }

    #[tokio::test]
    async fn test_recovered_workers_are_not_non_responding() {
        let store = MemoryStore::new();
        let service = service(&store, vec![]);
        service.create("w-1", "pw", "host", "/opt").await.unwrap();
        store.set_version(MSG_RECOVERY_VERSION, 10).await;
        assert_eq!(service.read_non_responding_workers().await.unwrap().len(), 1);

        service
            .update_status("w-1", WorkerStatus::Recovered)
            .await
            .unwrap();
        assert!(service.read_non_responding_workers().await.unwrap().is_empty());
    }

    #[test]
    fn test_min_version_allowed_never_negative() {
        assert_eq!(min_version_allowed(10, 2), 8);
        assert_eq!(min_version_allowed(1, 2), 0);
    }

    #[tokio::test]
    async fn test_removing_last_group_fails_and_keeps_groups() {
        let store = MemoryStore::new();
        let service = service(&store, vec![]);
        service.create("w-1", "pw", "host", "/opt").await.unwrap();

        let err = service
            .remove_group_from_worker("w-1", DEFAULT_WORKER_GROUP)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidState(ref m) if m.contains("without any group")));
        assert_eq!(
            service.read_worker_groups("w-1").await.unwrap(),
            vec![DEFAULT_WORKER_GROUP.to_string()]
        );
    }

    #[tokio::test]
    async fn test_group_membership_changes() {
        let store = MemoryStore::new();
        let service = service(&store, vec![]);
        service.create("w-1", "pw", "host", "/opt").await.unwrap();

        service.add_group_to_worker("w-1", "gpu").await.unwrap();
        service.add_group_to_worker("w-1", "gpu").await.unwrap();
        assert_eq!(
            service.read_worker_groups("w-1").await.unwrap(),
            vec![DEFAULT_WORKER_GROUP.to_string(), "gpu".to_string()]
        );

        service
            .remove_group_from_worker("w-1", DEFAULT_WORKER_GROUP)
            .await
            .unwrap();
        assert_eq!(service.read_worker_groups("w-1").await.unwrap(), vec!["gpu"]);

        assert!(matches!(
            service.update_worker_groups("w-1", vec![]).await,
            Err(AppError::InvalidState(_))
        ));
        service
            .update_worker_groups("w-1", vec!["a".into(), "b".into(), "a".into()])
            .await
            .unwrap();
        assert_eq!(service.read_worker_groups("w-1").await.unwrap(), vec!["a", "b"]);
        assert_eq!(
            service.read_existing_groups(&["b".to_string(), "zzz".to_string()]).await.unwrap(),
            vec!["b"]
        );
    }

    #[tokio::test]
    async fn test_group_map_only_lists_available_workers() {
        let store = MemoryStore::new();
        let service = service(&store, vec![]);
        for uuid in ["w-1", "w-2", "w-3"] {
            service.create(uuid, "pw", "host", "/opt").await.unwrap();
            service.keep_alive(uuid).await.unwrap();
        }
        service.activate("w-1").await.unwrap();
        service.activate("w-2").await.unwrap();
        service.add_group_to_worker("w-2", "gpu").await.unwrap();
        service.update_worker_to_deleted("w-2").await.unwrap();

        let map = service.read_group_workers_map_active_and_running().await.unwrap();
        assert_eq!(map.get(DEFAULT_WORKER_GROUP).unwrap(), &vec!["w-1".to_string()]);
        assert!(!map.contains_key("gpu"));
        assert_eq!(service.read_all_worker_groups().await.unwrap(), vec![DEFAULT_WORKER_GROUP, "gpu"]);
    }

    #[tokio::test]
    async fn test_deleted_worker_hidden_from_reads() {
        let store = MemoryStore::new();
        let service = service(&store, vec![]);
        service.create("w-1", "pw", "host", "/opt").await.unwrap();
        service.create("w-2", "pw", "host", "/opt").await.unwrap();
        service.update_worker_to_deleted("w-1").await.unwrap();

        assert!(matches!(
            service.read_by_uuid("w-1").await,
            Err(AppError::NotFound(_))
        ));
        let deleted = service.find_by_uuid("w-1").await.unwrap();
        assert!(deleted.deleted);
        assert_eq!(deleted.status, WorkerStatus::InRecovery);

        let live: Vec<String> = service
            .read_all_not_deleted_workers()
            .await
            .unwrap()
            .into_iter()
            .map(|w| w.uuid)
            .collect();
        assert_eq!(live, vec!["w-2"]);
        assert_eq!(service.read_all_workers_uuids().await.unwrap(), vec!["w-1", "w-2"]);
        assert!(service.read_workers_by_activation(true).await.unwrap().is_empty());
        assert_eq!(service.read_workers_by_activation(false).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_bulk_number_and_wrv_updates() {
        let store = MemoryStore::new();
        let service = service(&store, vec![]);
        service.create("w-1", "pw", "host", "/opt").await.unwrap();

        service.update_bulk_number("w-1", "17").await.unwrap();
        service.update_wrv("w-1", "wrv-2").await.unwrap();
        service.deactivate("w-1").await.unwrap();

        let worker = service.read_by_uuid("w-1").await.unwrap();
        assert_eq!(worker.bulk_number.as_deref(), Some("17"));
        assert_eq!(worker.worker_recovery_version, "wrv-2");
        assert!(!worker.active);
    }

    #[tokio::test]
    async fn test_keep_alive_waits_for_worker_lock_and_keeps_bulk_number() {
        let store = MemoryStore::new();
        let service = service(&store, vec![]);
        service.create("w-1", "pw", "host", "/opt").await.unwrap();

        let mut holder = store.begin().await.unwrap();
        let mut guard = worker_lock::lock(&mut holder, "w-1").await.unwrap();
        update_bulk_number_in(&mut *guard, "w-1", "b-9").await.unwrap();

        let mut ping = task::spawn(service.keep_alive("w-1"));
        assert_pending!(ping.poll());

        drop(guard);
        holder.commit().await.unwrap();
        assert!(ping.is_woken());
        assert_ready_ok!(ping.poll());

        let worker = service.read_by_uuid("w-1").await.unwrap();
        assert_eq!(worker.bulk_number.as_deref(), Some("b-9"));
        assert_eq!(worker.status, WorkerStatus::Running);
    }

    #[tokio::test]
    async fn test_group_change_waits_for_worker_lock() {
        let store = MemoryStore::new();
        let service = service(&store, vec![]);
        service.create("w-1", "pw", "host", "/opt").await.unwrap();

        let mut holder = store.begin().await.unwrap();
        let mut guard = worker_lock::lock(&mut holder, "w-1").await.unwrap();
        update_wrv_in(&mut *guard, "w-1", "wrv-7").await.unwrap();

        let mut change = task::spawn(service.update_worker_groups("w-1", vec!["etl".into()]));
        assert_pending!(change.poll());

        drop(guard);
        holder.commit().await.unwrap();
        assert_ready_ok!(change.poll());

        let worker = service.read_by_uuid("w-1").await.unwrap();
        assert_eq!(worker.worker_recovery_version, "wrv-7");
        assert_eq!(worker.groups, vec!["etl".to_string()]);
    }
}
