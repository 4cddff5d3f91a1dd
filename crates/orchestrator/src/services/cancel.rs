//! Cancellation controller.
//!
//! Moves an execution and its in-flight branches to PENDING_CANCEL. A
//! running step observes the status and finishes as CANCELED on its own; a
//! paused execution has its snapshot rewritten to terminate as cancelled and
//! is put back on the queue.

use std::sync::Arc;

use chrono::Utc;

use crate::db::models::ExecutionState;
use crate::engine::{
    ExecutionActionResult, ExecutionCodec, ExecutionMessage, ExecutionStatus, EMPTY_BRANCH,
};
use crate::error::{AppError, AppResult};
use crate::result_ext::MissingExt;
use crate::store::{ExecutionStateRepository, QueueRepository, Store, StoreTx};

pub struct CancelExecutionService<S: Store> {
    store: S,
    codec: Arc<dyn ExecutionCodec>,
}

impl<S: Store> CancelExecutionService<S> {
    pub fn new(store: S, codec: Arc<dyn ExecutionCodec>) -> Self {
        Self { store, codec }
    }

    /// Request cancellation of `execution_id`. Changes are committed only
    /// when the result is [`ExecutionActionResult::Success`].
    pub async fn request_cancel_execution(
        &self,
        execution_id: i64,
    ) -> AppResult<ExecutionActionResult> {
        let mut tx = self.store.begin().await?;

        let Some(root) = tx
            .find_execution_state(execution_id, EMPTY_BRANCH)
            .await?
            .log_missing(format_args!("execution {} to cancel", execution_id))
        else {
            return Ok(ExecutionActionResult::FailedNotFound);
        };

        let result = match root.status {
            ExecutionStatus::Completed => ExecutionActionResult::FailedAlreadyCompleted,
            ExecutionStatus::Canceled | ExecutionStatus::PendingCancel => {
                ExecutionActionResult::FailedAlreadyCanceledOrPendingCancellation
            }
            ExecutionStatus::PendingPause => ExecutionActionResult::FailedPendingPause,
            ExecutionStatus::SystemFailure => ExecutionActionResult::FailedSystemFailure,
            ExecutionStatus::Running => {
                tx.upsert_execution_state(&pending_cancel(root)).await?;
                ExecutionActionResult::Success
            }
            ExecutionStatus::Paused => {
                self.cancel_paused(&mut tx, root).await?;
                ExecutionActionResult::Success
            }
        };

        if result.is_success() {
            tx.commit().await?;
            tracing::info!(execution_id, "Execution cancellation requested");
        } else {
            tracing::debug!(execution_id, ?result, "Execution not cancelled");
        }
        Ok(result)
    }

    /// Cancel a paused root and fan out to its branches. Paused snapshots
    /// are rewritten and enqueued; running branches only change status.
    async fn cancel_paused<T: StoreTx>(&self, tx: &mut T, root: ExecutionState) -> AppResult<()> {
        let execution_id = root.execution_id;
        let root = self.cancel_snapshot(root)?;
        tx.upsert_execution_state(&root).await?;

        let branches: Vec<ExecutionState> = tx
            .find_execution_states(execution_id)
            .await?
            .into_iter()
            .filter(|state| !state.is_root())
            .collect();

        let mut resumed = Vec::new();
        if branches.is_empty() {
            resumed.push(message_for(&root));
        }

        for branch in branches {
            match branch.status {
                ExecutionStatus::Paused => {
                    let branch = self.cancel_snapshot(branch)?;
                    tx.upsert_execution_state(&branch).await?;
                    resumed.push(message_for(&branch));
                }
                ExecutionStatus::Running => {
                    tx.upsert_execution_state(&pending_cancel(branch)).await?;
                }
                _ => {}
            }
        }

        tracing::debug!(
            execution_id,
            resumed = resumed.len(),
            "Cancelled paused execution"
        );
        tx.enqueue(&resumed).await
    }

    /// Rewrite a paused snapshot so it terminates as cancelled.
    fn cancel_snapshot(&self, state: ExecutionState) -> AppResult<ExecutionState> {
        let bytes = state.execution_object.as_deref().ok_or_else(|| {
            AppError::InvalidState(format!(
                "paused execution {} branch '{}' has no snapshot",
                state.execution_id, state.branch_id
            ))
        })?;
        let mut execution = self.codec.deserialize(bytes)?;
        execution.mark_canceled();

        let mut state = pending_cancel(state);
        state.execution_object = Some(self.codec.serialize(&execution)?);
        Ok(state)
    }

    /// Whether the root of `execution_id` is CANCELED or PENDING_CANCEL.
    pub async fn is_canceled_execution(&self, execution_id: i64) -> AppResult<bool> {
        let mut tx = self.store.begin().await?;
        Ok(tx
            .find_execution_state(execution_id, EMPTY_BRANCH)
            .await?
            .is_some_and(|state| state.status.is_cancelled()))
    }

    pub async fn read_canceled_executions_ids(&self) -> AppResult<Vec<i64>> {
        let mut tx = self.store.begin().await?;
        tx.find_execution_ids_by_statuses(&ExecutionStatus::cancelled_statuses())
            .await
    }
}

fn message_for(state: &ExecutionState) -> ExecutionMessage {
    ExecutionMessage::new(
        state.execution_id.to_string(),
        state.execution_object.clone().unwrap_or_default(),
    )
}

fn pending_cancel(mut state: ExecutionState) -> ExecutionState {
    state.status = ExecutionStatus::PendingCancel;
    state.updated_at = Utc::now();
    state
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{Execution, JsonExecutionCodec};
    use crate::store::MemoryStore;

    fn service(store: &MemoryStore) -> CancelExecutionService<MemoryStore> {
        CancelExecutionService::new(store.clone(), Arc::new(JsonExecutionCodec))
    }

    fn snapshot(execution: &Execution) -> Option<Vec<u8>> {
        Some(JsonExecutionCodec.serialize(execution).unwrap())
    }

    async fn put(store: &MemoryStore, states: Vec<ExecutionState>) {
        let mut tx = store.begin().await.unwrap();
        for state in &states {
            tx.upsert_execution_state(state).await.unwrap();
        }
        tx.commit().await.unwrap();
    }

    async fn status(store: &MemoryStore, execution_id: i64, branch_id: &str) -> ExecutionStatus {
        let mut tx = store.begin().await.unwrap();
        tx.find_execution_state(execution_id, branch_id)
            .await
            .unwrap()
            .unwrap()
            .status
    }

    async fn stored_snapshot(store: &MemoryStore, execution_id: i64, branch_id: &str) -> Execution {
        let mut tx = store.begin().await.unwrap();
        let state = tx
            .find_execution_state(execution_id, branch_id)
            .await
            .unwrap()
            .unwrap();
        JsonExecutionCodec
            .deserialize(&state.execution_object.unwrap())
            .unwrap()
    }

    #[tokio::test]
    async fn test_unknown_execution_not_found() {
        let store = MemoryStore::new();
        assert_eq!(
            service(&store).request_cancel_execution(404).await.unwrap(),
            ExecutionActionResult::FailedNotFound
        );
    }

    #[tokio::test]
    async fn test_running_becomes_pending_cancel() {
        let store = MemoryStore::new();
        put(&store, vec![ExecutionState::new(1, EMPTY_BRANCH, ExecutionStatus::Running, None)]).await;

        let result = service(&store).request_cancel_execution(1).await.unwrap();
        assert_eq!(result, ExecutionActionResult::Success);
        assert_eq!(status(&store, 1, EMPTY_BRANCH).await, ExecutionStatus::PendingCancel);
        assert!(store.queued_messages().await.is_empty());
    }

    #[tokio::test]
    async fn test_terminal_and_transitional_states_are_refused() {
        let cases = [
            (ExecutionStatus::Completed, ExecutionActionResult::FailedAlreadyCompleted),
            (
                ExecutionStatus::Canceled,
                ExecutionActionResult::FailedAlreadyCanceledOrPendingCancellation,
            ),
            (
                ExecutionStatus::PendingCancel,
                ExecutionActionResult::FailedAlreadyCanceledOrPendingCancellation,
            ),
            (ExecutionStatus::PendingPause, ExecutionActionResult::FailedPendingPause),
            (ExecutionStatus::SystemFailure, ExecutionActionResult::FailedSystemFailure),
        ];

        for (initial, expected) in cases {
            let store = MemoryStore::new();
            put(&store, vec![ExecutionState::new(1, EMPTY_BRANCH, initial, None)]).await;

            let result = service(&store).request_cancel_execution(1).await.unwrap();
            assert_eq!(result, expected, "cancelling {}", initial);
            assert_eq!(status(&store, 1, EMPTY_BRANCH).await, initial);
        }
    }

    #[tokio::test]
    async fn test_paused_with_paused_branch_cancels_both() {
        let store = MemoryStore::new();
        let root = Execution::new(1, 10, Some(5));
        let branch = root.branch("b-1", "s-1", Some(2));
        put(
            &store,
            vec![
                ExecutionState::new(1, EMPTY_BRANCH, ExecutionStatus::Paused, snapshot(&root)),
                ExecutionState::new(1, "b-1", ExecutionStatus::Paused, snapshot(&branch)),
            ],
        )
        .await;

        let result = service(&store).request_cancel_execution(1).await.unwrap();
        assert_eq!(result, ExecutionActionResult::Success);

        assert_eq!(status(&store, 1, EMPTY_BRANCH).await, ExecutionStatus::PendingCancel);
        assert_eq!(status(&store, 1, "b-1").await, ExecutionStatus::PendingCancel);

        let root = stored_snapshot(&store, 1, EMPTY_BRANCH).await;
        assert_eq!(root.position, None);
        assert!(root.is_canceled());

        let queued = store.queued_messages().await;
        assert_eq!(queued.len(), 1, "only the paused branch resumes");
        let resumed = JsonExecutionCodec.deserialize(&queued[0].payload).unwrap();
        assert_eq!(resumed.branch_id.as_deref(), Some("b-1"));
        assert!(resumed.is_canceled());
    }

    #[tokio::test]
    async fn test_paused_without_branches_resumes_root() {
        let store = MemoryStore::new();
        put(
            &store,
            vec![ExecutionState::new(
                1,
                EMPTY_BRANCH,
                ExecutionStatus::Paused,
                snapshot(&Execution::new(1, 10, Some(5))),
            )],
        )
        .await;

        service(&store).request_cancel_execution(1).await.unwrap();

        let queued = store.queued_messages().await;
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].msg_id, "1");
        assert!(JsonExecutionCodec.deserialize(&queued[0].payload).unwrap().is_canceled());
    }

    #[tokio::test]
    async fn test_paused_fan_out_skips_finished_branches() {
        let store = MemoryStore::new();
        let root = Execution::new(1, 10, Some(5));
        put(
            &store,
            vec![
                ExecutionState::new(1, EMPTY_BRANCH, ExecutionStatus::Paused, snapshot(&root)),
                ExecutionState::new(1, "running", ExecutionStatus::Running, None),
                ExecutionState::new(1, "done", ExecutionStatus::Completed, None),
            ],
        )
        .await;

        service(&store).request_cancel_execution(1).await.unwrap();

        assert_eq!(status(&store, 1, "running").await, ExecutionStatus::PendingCancel);
        assert_eq!(status(&store, 1, "done").await, ExecutionStatus::Completed);
        assert!(store.queued_messages().await.is_empty());
    }

    #[tokio::test]
    async fn test_paused_without_snapshot_rolls_back() {
        let store = MemoryStore::new();
        put(&store, vec![ExecutionState::new(1, EMPTY_BRANCH, ExecutionStatus::Paused, None)]).await;

        let result = service(&store).request_cancel_execution(1).await;
        assert!(matches!(result, Err(AppError::InvalidState(_))));
        assert_eq!(status(&store, 1, EMPTY_BRANCH).await, ExecutionStatus::Paused);
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent() {
        let store = MemoryStore::new();
        put(&store, vec![ExecutionState::new(1, EMPTY_BRANCH, ExecutionStatus::Running, None)]).await;
        let service = service(&store);

        assert!(service.request_cancel_execution(1).await.unwrap().is_success());
        assert_eq!(
            service.request_cancel_execution(1).await.unwrap(),
            ExecutionActionResult::FailedAlreadyCanceledOrPendingCancellation
        );
    }

    #[tokio::test]
    async fn test_cancellation_queries() {
        let store = MemoryStore::new();
        let service = service(&store);
        assert!(service.read_canceled_executions_ids().await.unwrap().is_empty());

        put(
            &store,
            vec![
                ExecutionState::new(1, EMPTY_BRANCH, ExecutionStatus::Canceled, None),
                ExecutionState::new(2, EMPTY_BRANCH, ExecutionStatus::Running, None),
                ExecutionState::new(3, EMPTY_BRANCH, ExecutionStatus::PendingCancel, None),
            ],
        )
        .await;

        assert!(service.is_canceled_execution(1).await.unwrap());
        assert!(!service.is_canceled_execution(2).await.unwrap());
        assert!(service.is_canceled_execution(3).await.unwrap());
        assert!(!service.is_canceled_execution(99).await.unwrap());
        assert_eq!(service.read_canceled_executions_ids().await.unwrap(), vec![1, 3]);
    }
}
