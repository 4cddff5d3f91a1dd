//! Worker recovery sweep.
//!
//! Each cycle advances the system recovery version and takes over every
//! worker that has not acknowledged a recent one. A recovered worker gets a
//! fresh recovery version, so dispatches still in flight from its previous
//! incarnation are discarded by the dispatch gate.

use std::sync::Arc;

use serde::Serialize;

use super::worker_lock;
use super::worker_node::{update_status_in, update_wrv_in, WorkerNodeService};
use crate::db::models::WorkerStatus;
use crate::error::AppResult;
use crate::result_ext::CycleResultExt;
use crate::store::{Store, StoreTx, VersionSource, MSG_RECOVERY_VERSION};

/// Result of one recovery cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    /// System recovery version after the increment
    pub version: i64,
    pub recovered: Vec<String>,
    pub failed: Vec<String>,
}

pub struct WorkerRecoveryService<S: Store> {
    store: S,
    versions: Arc<dyn VersionSource>,
    workers: Arc<WorkerNodeService<S>>,
}

impl<S: Store> WorkerRecoveryService<S> {
    pub fn new(
        store: S,
        versions: Arc<dyn VersionSource>,
        workers: Arc<WorkerNodeService<S>>,
    ) -> Self {
        Self {
            store,
            versions,
            workers,
        }
    }

    /// Recover one worker and return its new recovery version.
    ///
    /// The worker is marked IN_RECOVERY in a first transaction so the state
    /// is visible while its queued work is taken over, then given a new
    /// recovery version and marked RECOVERED. Both steps hold the worker
    /// lock, so they never interleave with a dispatch from that worker.
    pub async fn do_worker_recovery(&self, uuid: &str) -> AppResult<String> {
        let mut tx = self.store.begin().await?;
        let mut guard = worker_lock::lock(&mut tx, uuid).await?;
        update_status_in(&mut *guard, uuid, WorkerStatus::InRecovery).await?;
        drop(guard);
        tx.commit().await?;
        tracing::info!(worker_uuid = %uuid, "Worker in recovery");

        let wrv = uuid::Uuid::new_v4().to_string();
        let mut tx = self.store.begin().await?;
        let mut guard = worker_lock::lock(&mut tx, uuid).await?;
        update_wrv_in(&mut *guard, uuid, &wrv).await?;
        update_status_in(&mut *guard, uuid, WorkerStatus::Recovered).await?;
        drop(guard);
        tx.commit().await?;

        tracing::info!(worker_uuid = %uuid, wrv = %wrv, "Worker recovered");
        Ok(wrv)
    }

    /// Run one recovery cycle. A failure to recover one worker is logged and
    /// does not stop the others.
    pub async fn do_recovery(&self) -> AppResult<RecoveryReport> {
        let version = self.versions.increment_version(MSG_RECOVERY_VERSION).await?;
        let non_responding = self.workers.read_non_responding_workers().await?;
        tracing::debug!(
            version,
            count = non_responding.len(),
            "Recovery cycle"
        );

        let mut report = RecoveryReport {
            version,
            ..RecoveryReport::default()
        };
        for uuid in non_responding {
            match self.do_worker_recovery(&uuid).await {
                Ok(_) => report.recovered.push(uuid),
                Err(e) => {
                    tracing::error!(worker_uuid = %uuid, error = %e, "Worker recovery failed");
                    report.failed.push(uuid);
                }
            }
        }
        Ok(report)
    }

    /// Recovery cycle for the periodic trigger. Never fails.
    pub async fn recover_non_responding_workers(&self) -> Option<RecoveryReport> {
        self.do_recovery().await.or_log_cycle("worker recovery")
    }
}
