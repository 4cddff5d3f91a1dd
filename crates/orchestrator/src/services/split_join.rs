//! Split/join engine.
//!
//! A split suspends the parent execution and starts one branch per child.
//! Each finished branch is attached to its suspended parent; once every
//! branch has finished, the join merges the branch outputs into the parent
//! and puts it back on the queue, deleting the suspension in the same
//! transaction.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;

use crate::db::models::{FinishedBranch, SuspendedExecution};
use crate::engine::{Execution, ExecutionCodec, ExecutionMessage, ExecutionStatus, SplitMessage};
use crate::error::{AppError, AppResult};
use crate::result_ext::CycleResultExt;
use crate::store::{QueueRepository, Store, StoreTx, SuspendedExecutionRepository};

/// Outcome of reporting a batch of finished branches.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EndBranchReport {
    /// Finished branches stored to wait for their siblings
    pub persisted: usize,
    /// Parents joined inline through the single-branch path
    pub joined: usize,
    /// Split ids with no suspended parent; their branch results were dropped
    pub orphans: Vec<String>,
}

pub struct SplitJoinService<S: Store> {
    store: S,
    codec: Arc<dyn ExecutionCodec>,
    bulk_size: usize,
}

impl<S: Store> SplitJoinService<S> {
    /// `bulk_size` is used by [`Self::join_finished_splits_default`].
    pub fn new(store: S, codec: Arc<dyn ExecutionCodec>, bulk_size: usize) -> Self {
        Self {
            store,
            codec,
            bulk_size,
        }
    }

    pub async fn split(&self, messages: &[SplitMessage]) -> AppResult<usize> {
        let mut tx = self.store.begin().await?;
        let branches = self.split_in(&mut tx, messages).await?;
        tx.commit().await?;
        Ok(branches)
    }

    /// Enqueue every branch of every split in one batch, then store the
    /// suspended parents. Returns the number of branches started.
    ///
    /// A split without children could never be joined; it is logged and
    /// dropped so the rest of the batch still goes through.
    pub async fn split_in<T: StoreTx>(
        &self,
        tx: &mut T,
        messages: &[SplitMessage],
    ) -> AppResult<usize> {
        if messages.is_empty() {
            return Ok(0);
        }

        let mut branch_triggers = Vec::new();
        let mut suspended = Vec::with_capacity(messages.len());

        for message in messages {
            if message.children.is_empty() {
                tracing::warn!(
                    split_id = %message.split_id,
                    execution_id = message.parent.execution_id,
                    "Split has no branches, dropping it"
                );
                continue;
            }

            for child in &message.children {
                branch_triggers.push(ExecutionMessage::from_execution(self.codec.as_ref(), child)?);
            }

            suspended.push(SuspendedExecution::new(
                message.parent.execution_id.to_string(),
                message.split_id.clone(),
                message.children.len() as i32,
                self.codec.serialize(&message.parent)?,
            ));
        }

        if suspended.is_empty() {
            return Ok(0);
        }
        tx.enqueue(&branch_triggers).await?;
        tx.insert_suspended_executions(&suspended).await?;

        tracing::debug!(
            splits = suspended.len(),
            branches = branch_triggers.len(),
            "Suspended parents and started branches"
        );
        Ok(branch_triggers.len())
    }

    pub async fn end_branch(&self, executions: &[Execution]) -> AppResult<EndBranchReport> {
        let mut tx = self.store.begin().await?;
        let report = self.end_branch_in(&mut tx, executions).await?;
        tx.commit().await?;
        Ok(report)
    }

    /// Attach finished branches to their suspended parents.
    ///
    /// A parent with a single branch is joined immediately and its finished
    /// branch is never stored. A branch whose split has no suspended parent
    /// is logged and dropped.
    pub async fn end_branch_in<T: StoreTx>(
        &self,
        tx: &mut T,
        executions: &[Execution],
    ) -> AppResult<EndBranchReport> {
        let mut report = EndBranchReport::default();
        if executions.is_empty() {
            return Ok(report);
        }

        let mut split_ids: Vec<String> = Vec::with_capacity(executions.len());
        for execution in executions {
            execution.ensure_not_legacy_branch()?;
            let split_id = execution.split_id.as_deref().ok_or_else(|| {
                AppError::InvalidState(format!(
                    "finished branch of execution {} carries no split id",
                    execution.execution_id
                ))
            })?;
            tracing::debug!(
                execution_id = execution.execution_id,
                branch_id = execution.branch_id.as_deref().unwrap_or_default(),
                split_id = %split_id,
                "Finishing branch"
            );
            if !split_ids.iter().any(|s| s == split_id) {
                split_ids.push(split_id.to_string());
            }
        }

        let mut parents: HashMap<String, SuspendedExecution> = tx
            .find_suspended_by_split_ids(&split_ids)
            .await?
            .into_iter()
            .map(|se| (se.split_id.clone(), se))
            .collect();

        for split_id in &split_ids {
            if !parents.contains_key(split_id) {
                let execution_id = executions
                    .iter()
                    .find(|e| e.split_id.as_deref() == Some(split_id.as_str()))
                    .map(|e| e.execution_id);
                tracing::error!(
                    split_id = %split_id,
                    execution_id = ?execution_id,
                    "No suspended execution found for finished branch"
                );
                report.orphans.push(split_id.clone());
            }
        }

        let mut single_branch: Vec<String> = Vec::new();
        for execution in executions {
            let finished = FinishedBranch::from_execution(execution);
            let Some(parent) = parents.get_mut(&finished.split_id) else {
                continue;
            };

            if parent.number_of_branches == 1 {
                parent.finished_branches.push(finished);
                if !single_branch.contains(&parent.split_id) {
                    single_branch.push(parent.split_id.clone());
                }
            } else {
                tx.insert_finished_branch(parent.id, &finished).await?;
                parent.finished_branches.push(finished);
                report.persisted += 1;
            }
        }

        if !single_branch.is_empty() {
            let ready: Vec<SuspendedExecution> = single_branch
                .iter()
                .filter_map(|split_id| parents.remove(split_id))
                .collect();
            report.joined = self.join_and_send_to_queue(tx, ready).await?;
        }

        Ok(report)
    }

    /// Join up to `bulk_size` suspended executions whose branches have all
    /// finished. Returns the number joined.
    pub async fn join_finished_splits(&self, bulk_size: usize) -> AppResult<usize> {
        let mut tx = self.store.begin().await?;
        let ready = tx.find_join_ready(bulk_size).await?;
        let joined = self.join_and_send_to_queue(&mut tx, ready).await?;
        tx.commit().await?;
        Ok(joined)
    }

    /// Join sweep with the configured bulk size. Failures are logged and
    /// reported as zero joins.
    pub async fn join_finished_splits_default(&self) -> usize {
        self.join_finished_splits(self.bulk_size)
            .await
            .or_log_cycle("split/join")
            .unwrap_or(0)
    }

    async fn join_and_send_to_queue<T: StoreTx>(
        &self,
        tx: &mut T,
        suspended: Vec<SuspendedExecution>,
    ) -> AppResult<usize> {
        tracing::debug!(
            count = suspended.len(),
            "Joining suspended executions with all branches finished"
        );
        if suspended.is_empty() {
            return Ok(0);
        }

        let mut messages = Vec::with_capacity(suspended.len());
        for se in &suspended {
            let parent = self.join_split(se)?;
            messages.push(ExecutionMessage::from_execution(self.codec.as_ref(), &parent)?);
        }

        let split_ids: Vec<String> = suspended.iter().map(|se| se.split_id.clone()).collect();
        tx.enqueue(&messages).await?;
        let deleted = tx.delete_suspended_executions(&split_ids).await?;
        if deleted != split_ids.len() {
            return Err(AppError::InvalidState(format!(
                "joined {} suspended executions but only {} were still stored",
                split_ids.len(),
                deleted
            )));
        }

        Ok(suspended.len())
    }

    /// Merge the finished branches into the parent. One cancelled branch
    /// cancels the parent.
    fn join_split(&self, se: &SuspendedExecution) -> AppResult<Execution> {
        if se.finished_branches.len() != se.number_of_branches as usize {
            return Err(AppError::InvalidState(format!(
                "expected suspended execution {} of split {} to have {} finished branches, but found {}",
                se.execution_id,
                se.split_id,
                se.number_of_branches,
                se.finished_branches.len()
            )));
        }

        let mut parent = self.codec.deserialize(&se.execution_object)?;
        let cancelled = se
            .finished_branches
            .iter()
            .any(|fb| fb.branch_contexts.cancelled);

        parent.put_finished_child_branches_data(
            se.finished_branches
                .iter()
                .map(FinishedBranch::end_branch_data)
                .collect(),
        );
        if cancelled {
            parent.system_context.flow_termination_type = Some(ExecutionStatus::Canceled);
        }

        tracing::debug!(
            execution_id = parent.execution_id,
            split_id = %se.split_id,
            cancelled,
            "Joined execution"
        );
        Ok(parent)
    }
}

#[cfg(test)]
mod tests {
    use tokio_test::{assert_pending, assert_ready_ok, task};

    use super::*;
    use crate::engine::JsonExecutionCodec;
    use crate::store::MemoryStore;

    fn service(store: &MemoryStore) -> SplitJoinService<MemoryStore> {
        SplitJoinService::new(store.clone(), Arc::new(JsonExecutionCodec), 200)
    }

    fn split_message(execution_id: i64, split_id: &str, branches: usize) -> SplitMessage {
        let parent = Execution::new(execution_id, 100, Some(7));
        let children = (0..branches)
            .map(|i| parent.branch(&format!("{}-b{}", split_id, i), split_id, Some(0)))
            .collect();
        SplitMessage {
            split_id: split_id.to_string(),
            parent,
            children,
        }
    }

    fn finished(execution_id: i64, split_id: &str, branch: usize) -> Execution {
        let mut execution = Execution::new(execution_id, 100, None)
            .branch(&format!("{}-b{}", split_id, branch), split_id, None);
        execution
            .contexts
            .insert("result".to_string(), serde_json::json!(branch));
        execution
    }

    fn decode(message: &ExecutionMessage) -> Execution {
        JsonExecutionCodec.deserialize(&message.payload).unwrap()
    }

    #[tokio::test]
    async fn test_split_empty_is_noop() {
        let store = MemoryStore::new();
        assert_eq!(service(&store).split(&[]).await.unwrap(), 0);
        assert_eq!(store.stats().await.enqueue_batches, 0);
        assert!(store.suspended_executions().await.is_empty());
    }

    #[tokio::test]
    async fn test_split_without_children_is_dropped() {
        let store = MemoryStore::new();
        let started = service(&store)
            .split(&[split_message(1, "s1", 0), split_message(2, "s2", 2)])
            .await
            .unwrap();
        assert_eq!(started, 2);

        let suspended = store.suspended_executions().await;
        assert_eq!(suspended.len(), 1);
        assert_eq!(suspended[0].split_id, "s2");
        assert_eq!(store.queued_messages().await.len(), 2);

        assert_eq!(service(&store).split(&[split_message(3, "s3", 0)]).await.unwrap(), 0);
        assert_eq!(store.stats().await.enqueue_batches, 1);
    }

    #[tokio::test]
    async fn test_split_enqueues_branches_in_one_batch_and_suspends_parents() {
        let store = MemoryStore::new();
        let started = service(&store)
            .split(&[split_message(1, "s1", 2), split_message(2, "s2", 3)])
            .await
            .unwrap();
        assert_eq!(started, 5);

        let queued = store.queued_messages().await;
        assert_eq!(queued.len(), 5);
        assert_eq!(store.stats().await.enqueue_batches, 1);
        assert_eq!(decode(&queued[0]).split_id.as_deref(), Some("s1"));

        let suspended = store.suspended_executions().await;
        assert_eq!(suspended.len(), 2);
        assert_eq!(suspended[0].number_of_branches, 2);
        assert_eq!(suspended[1].number_of_branches, 3);
        assert_eq!(suspended[1].execution_id, "2");
    }

    #[tokio::test]
    async fn test_join_happens_only_when_all_branches_finished() {
        let store = MemoryStore::new();
        let service = service(&store);
        service.split(&[split_message(1, "s1", 3)]).await.unwrap();

        let report = service
            .end_branch(&[finished(1, "s1", 0), finished(1, "s1", 1)])
            .await
            .unwrap();
        assert_eq!(report.persisted, 2);
        assert_eq!(service.join_finished_splits(10).await.unwrap(), 0);

        service.end_branch(&[finished(1, "s1", 2)]).await.unwrap();
        assert_eq!(
            store.suspended_executions().await[0].number_of_branches,
            3,
            "branch count changed after creation"
        );
        assert_eq!(service.join_finished_splits(10).await.unwrap(), 1);

        assert!(store.suspended_executions().await.is_empty());
        let queued = store.queued_messages().await;
        let parent = decode(queued.last().unwrap());
        assert_eq!(parent.execution_id, 1);
        assert_eq!(parent.position, Some(7));
        assert_eq!(parent.system_context.finished_branches.len(), 3);
        assert_eq!(
            parent.system_context.finished_branches[2].contexts["result"],
            serde_json::json!(2)
        );
        assert_eq!(parent.system_context.flow_termination_type, None);
    }

    #[tokio::test]
    async fn test_single_branch_joins_inline_without_persisting() {
        let store = MemoryStore::new();
        let service = service(&store);
        service.split(&[split_message(1, "sub", 1)]).await.unwrap();

        let report = service.end_branch(&[finished(1, "sub", 0)]).await.unwrap();
        assert_eq!(report.joined, 1);
        assert_eq!(report.persisted, 0);
        assert_eq!(store.stats().await.finished_branch_inserts, 0);
        assert!(store.suspended_executions().await.is_empty());

        let queued = store.queued_messages().await;
        assert_eq!(queued.len(), 2);
        assert_eq!(decode(&queued[1]).system_context.finished_branches.len(), 1);
    }

    #[tokio::test]
    async fn test_one_cancelled_branch_cancels_parent() {
        let store = MemoryStore::new();
        let service = service(&store);
        service.split(&[split_message(1, "s1", 3)]).await.unwrap();

        let mut cancelled = finished(1, "s1", 1);
        cancelled.system_context.flow_termination_type = Some(ExecutionStatus::Canceled);
        let mut completed = finished(1, "s1", 2);
        completed.system_context.flow_termination_type = Some(ExecutionStatus::Completed);

        service
            .end_branch(&[finished(1, "s1", 0), cancelled, completed])
            .await
            .unwrap();
        service.join_finished_splits(10).await.unwrap();

        let parent = decode(store.queued_messages().await.last().unwrap());
        assert!(parent.is_canceled());
    }

    #[tokio::test]
    async fn test_orphan_branch_is_logged_and_skipped() {
        let store = MemoryStore::new();
        let service = service(&store);
        service.split(&[split_message(1, "s1", 3)]).await.unwrap();

        let report = service
            .end_branch(&[
                finished(1, "s1", 0),
                finished(9, "missing", 0),
                finished(1, "s1", 1),
            ])
            .await
            .unwrap();

        assert_eq!(report.orphans, vec!["missing".to_string()]);
        assert_eq!(report.persisted, 2);
        assert_eq!(store.suspended_executions().await[0].finished_branches.len(), 2);
    }

    #[tokio::test]
    async fn test_legacy_position_rejected_before_storage() {
        let store = MemoryStore::new();
        let service = service(&store);
        service.split(&[split_message(1, "s1", 2)]).await.unwrap();

        let mut legacy = finished(1, "s1", 0);
        legacy.position = Some(-1);
        assert!(matches!(
            service.end_branch(&[legacy]).await,
            Err(AppError::InvalidState(_))
        ));
        assert_eq!(store.stats().await.finished_branch_inserts, 0);
    }

    #[tokio::test]
    async fn test_branch_count_mismatch_aborts_join() {
        let store = MemoryStore::new();
        let service = service(&store);
        service.split(&[split_message(1, "sub", 1)]).await.unwrap();

        let result = service
            .end_branch(&[finished(1, "sub", 0), finished(1, "sub", 1)])
            .await;
        assert!(matches!(result, Err(AppError::InvalidState(_))));

        assert_eq!(store.suspended_executions().await.len(), 1);
        assert_eq!(store.queued_messages().await.len(), 1);
    }

    #[tokio::test]
    async fn test_join_respects_bulk_size() {
        let store = MemoryStore::new();
        let service = service(&store);
        for i in 0..3 {
            let split_id = format!("s{}", i);
            service.split(&[split_message(i, &split_id, 2)]).await.unwrap();
            service
                .end_branch(&[finished(i, &split_id, 0), finished(i, &split_id, 1)])
                .await
                .unwrap();
        }

        assert_eq!(service.join_finished_splits(2).await.unwrap(), 2);
        assert_eq!(service.join_finished_splits_default().await, 1);
        assert_eq!(service.join_finished_splits_default().await, 0);
    }

    #[tokio::test]
    async fn test_default_join_swallows_failures() {
        let store = MemoryStore::new();
        {
            let mut tx = store.begin().await.unwrap();
            tx.insert_suspended_executions(&[SuspendedExecution::new(
                "1".into(),
                "broken".into(),
                1,
                b"not an execution".to_vec(),
            )])
            .await
            .unwrap();
            let id = tx.find_suspended_by_split_ids(&["broken".to_string()]).await.unwrap()[0].id;
            tx.insert_finished_branch(id, &FinishedBranch::from_execution(&finished(1, "broken", 0)))
                .await
                .unwrap();
            tx.commit().await.unwrap();
        }

        let service = service(&store);
        assert_eq!(service.join_finished_splits_default().await, 0);
        assert!(service.join_finished_splits(10).await.is_err());
        assert_eq!(store.suspended_executions().await.len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_single_branch_end_joins_once() {
        let store = MemoryStore::new();
        let service = service(&store);
        service.split(&[split_message(1, "sub", 1)]).await.unwrap();

        let mut first = store.begin().await.unwrap();
        let report = service
            .end_branch_in(&mut first, &[finished(1, "sub", 0)])
            .await
            .unwrap();
        assert_eq!(report.joined, 1);

        let second_batch = [finished(1, "sub", 0)];
        let mut second = task::spawn(service.end_branch(&second_batch));
        assert_pending!(second.poll());

        first.commit().await.unwrap();
        assert!(second.is_woken());
        let report = assert_ready_ok!(second.poll());
        assert_eq!(report.joined, 0);
        assert_eq!(report.orphans, vec!["sub".to_string()]);

        // One branch trigger and one joined parent.
        assert_eq!(store.queued_messages().await.len(), 2);
    }

    #[tokio::test]
    async fn test_join_of_already_removed_split_fails() {
        let store = MemoryStore::new();
        let service = service(&store);
        service.split(&[split_message(1, "sub", 1)]).await.unwrap();

        {
            let mut tx = store.begin().await.unwrap();
            let split_ids = vec!["sub".to_string()];
            let mut se = tx.find_suspended_by_split_ids(&split_ids).await.unwrap().remove(0);
            se.finished_branches
                .push(FinishedBranch::from_execution(&finished(1, "sub", 0)));
            assert_eq!(tx.delete_suspended_executions(&split_ids).await.unwrap(), 1);

            let result = service.join_and_send_to_queue(&mut tx, vec![se]).await;
            assert!(matches!(result, Err(AppError::InvalidState(_))));
        }

        assert_eq!(store.suspended_executions().await.len(), 1);
        assert_eq!(store.queued_messages().await.len(), 1);
    }
}
