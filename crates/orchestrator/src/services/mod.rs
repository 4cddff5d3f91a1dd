//! Orchestration services.
//!
//! Each service owns a handle to the [`Store`] and runs its operations in
//! transactions of its own. Operations that must join a caller's
//! transaction have an `*_in` form taking the open transaction.

pub mod cancel;
pub mod dispatcher;
pub mod recovery;
pub mod split_join;
pub mod worker_lock;
pub mod worker_node;

use std::sync::Arc;

use serde::Serialize;

pub use cancel::CancelExecutionService;
pub use dispatcher::{DispatchOutcome, OrchestratorDispatcher};
pub use recovery::{RecoveryReport, WorkerRecoveryService};
pub use split_join::{EndBranchReport, SplitJoinService};
pub use worker_lock::{WorkerLockGuard, WorkerLockService};
pub use worker_node::{LoginListener, WorkerNodeService};

use crate::config::OrchestratorConfig;
use crate::engine::ExecutionCodec;
use crate::error::AppResult;
use crate::store::{Store, SuspendedExecutionRepository, VersionSource, MSG_RECOVERY_VERSION};

/// What the orchestrator currently looks like from its store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OrchestratorStatus {
    pub recovery_version: i64,
    /// Parents waiting for their branches
    pub suspended_executions: i64,
}

/// All orchestration services wired over one store.
pub struct Orchestrator<S: Store + Clone> {
    pub worker_locks: WorkerLockService<S>,
    pub worker_nodes: Arc<WorkerNodeService<S>>,
    pub split_join: Arc<SplitJoinService<S>>,
    pub dispatcher: OrchestratorDispatcher<S>,
    pub cancellation: CancelExecutionService<S>,
    pub recovery: WorkerRecoveryService<S>,
    store: S,
    versions: Arc<dyn VersionSource>,
}

impl<S: Store + Clone> Orchestrator<S> {
    pub fn new(
        store: S,
        versions: Arc<dyn VersionSource>,
        codec: Arc<dyn ExecutionCodec>,
        login_listeners: Vec<Arc<dyn LoginListener>>,
        config: &OrchestratorConfig,
    ) -> Self {
        let worker_nodes = Arc::new(WorkerNodeService::new(
            store.clone(),
            versions.clone(),
            login_listeners,
            config.max_version_gap_allowed,
        ));
        let split_join = Arc::new(SplitJoinService::new(
            store.clone(),
            codec.clone(),
            config.split_join_bulk_size,
        ));

        Self {
            worker_locks: WorkerLockService::new(store.clone()),
            dispatcher: OrchestratorDispatcher::new(store.clone(), split_join.clone()),
            cancellation: CancelExecutionService::new(store.clone(), codec),
            recovery: WorkerRecoveryService::new(
                store.clone(),
                versions.clone(),
                worker_nodes.clone(),
            ),
            worker_nodes,
            split_join,
            store,
            versions,
        }
    }

    /// Read the recovery version and the number of suspended executions.
    /// Fails when the store cannot be reached.
    pub async fn status(&self) -> AppResult<OrchestratorStatus> {
        let recovery_version = self.versions.current_version(MSG_RECOVERY_VERSION).await?;
        let mut tx = self.store.begin().await?;
        let suspended_executions = tx.count_suspended_executions().await?;
        Ok(OrchestratorStatus {
            recovery_version,
            suspended_executions,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::ExecutionState;
    use crate::engine::{
        DispatchMessage, Execution, ExecutionActionResult, ExecutionStatus, JsonExecutionCodec,
        SplitMessage, EMPTY_BRANCH,
    };
    use crate::store::{ExecutionStateRepository, MemoryStore, StoreTx};

    fn orchestrator(store: &MemoryStore) -> Orchestrator<MemoryStore> {
        Orchestrator::new(
            store.clone(),
            Arc::new(store.clone()),
            Arc::new(JsonExecutionCodec),
            Vec::new(),
            &OrchestratorConfig::default(),
        )
    }

    /// Fork through dispatch, cancel mid-flight, finish the branches and
    /// join: the parent resumes once, terminated as cancelled.
    #[tokio::test]
    async fn test_fork_cancel_join_round() {
        let store = MemoryStore::new();
        let orch = orchestrator(&store);
        orch.worker_nodes.create("w-1", "pw", "h", "/opt").await.unwrap();
        let wrv = orch.worker_nodes.up("w-1", "1.0").await.unwrap();

        let parent = Execution::new(1, 10, Some(4));
        let children: Vec<Execution> = (0..2)
            .map(|i| parent.branch(&format!("b{}", i), "s1", Some(0)))
            .collect();
        orch.dispatcher
            .dispatch(
                vec![DispatchMessage::Split(SplitMessage {
                    split_id: "s1".into(),
                    parent,
                    children: children.clone(),
                })],
                "bulk-1",
                &wrv,
                "w-1",
            )
            .await
            .unwrap();

        {
            let mut tx = store.begin().await.unwrap();
            tx.upsert_execution_state(&ExecutionState::new(
                1,
                EMPTY_BRANCH,
                ExecutionStatus::Running,
                None,
            ))
            .await
            .unwrap();
            tx.commit().await.unwrap();
        }
        assert_eq!(
            orch.cancellation.request_cancel_execution(1).await.unwrap(),
            ExecutionActionResult::Success
        );
        assert!(orch.cancellation.is_canceled_execution(1).await.unwrap());

        let mut finished = children;
        finished[1].system_context.flow_termination_type = Some(ExecutionStatus::Canceled);
        orch.split_join.end_branch(&finished).await.unwrap();

        assert_eq!(orch.split_join.join_finished_splits_default().await, 1);
        assert_eq!(orch.split_join.join_finished_splits_default().await, 0);

        let queued = store.queued_messages().await;
        assert_eq!(queued.len(), 3);
        let resumed = JsonExecutionCodec.deserialize(&queued[2].payload).unwrap();
        assert!(resumed.is_canceled());
        assert_eq!(resumed.system_context.finished_branches.len(), 2);
    }

    #[tokio::test]
    async fn test_status_reports_recovery_version_and_waiting_parents() {
        let store = MemoryStore::new();
        store.set_version(MSG_RECOVERY_VERSION, 4).await;
        let orch = orchestrator(&store);

        let parent = Execution::new(1, 10, Some(4));
        let children = vec![parent.branch("b0", "s1", Some(0))];
        orch.split_join
            .split(&[SplitMessage {
                split_id: "s1".into(),
                parent,
                children,
            }])
            .await
            .unwrap();

        assert_eq!(
            orch.status().await.unwrap(),
            OrchestratorStatus {
                recovery_version: 4,
                suspended_executions: 1
            }
        );
    }
}
