//! Dispatch gate.
//!
//! Admits a worker's batch of messages to the queue at most once per bulk
//! number, and only while the worker's recovery version is current. The
//! check and the writes happen under the worker lock in one transaction.

use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;

use super::split_join::SplitJoinService;
use super::worker_lock;
use super::worker_node::{read_by_uuid_in, update_bulk_number_in};
use crate::engine::{DispatchMessage, ExecutionMessage, SplitMessage};
use crate::error::AppResult;
use crate::store::{QueueRepository, Store, StoreTx};

/// What happened to a dispatched batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DispatchOutcome {
    /// Committed; the bulk number advanced.
    Dispatched {
        execution_messages: usize,
        split_messages: usize,
        /// Messages of an unknown kind
        dropped: usize,
    },
    /// The batch was committed by an earlier call.
    DuplicateBulk,
    /// The caller holds a recovery version that is no longer current.
    StaleRecoveryVersion,
}

impl DispatchOutcome {
    pub fn is_dispatched(&self) -> bool {
        matches!(self, DispatchOutcome::Dispatched { .. })
    }
}

pub struct OrchestratorDispatcher<S: Store> {
    store: S,
    split_join: Arc<SplitJoinService<S>>,
}

impl<S: Store> OrchestratorDispatcher<S> {
    pub fn new(store: S, split_join: Arc<SplitJoinService<S>>) -> Self {
        Self { store, split_join }
    }

    pub async fn dispatch(
        &self,
        messages: Vec<DispatchMessage>,
        bulk_number: &str,
        wrv: &str,
        worker_uuid: &str,
    ) -> AppResult<DispatchOutcome> {
        let mut tx = self.store.begin().await?;
        let mut guard = worker_lock::lock(&mut tx, worker_uuid).await?;

        let worker = read_by_uuid_in(&mut *guard, worker_uuid).await?;

        if worker.bulk_number.as_deref() == Some(bulk_number) {
            tracing::warn!(
                worker_uuid = %worker_uuid,
                bulk_number = %bulk_number,
                "Bulk was already dispatched, discarding"
            );
            return Ok(DispatchOutcome::DuplicateBulk);
        }

        if worker.worker_recovery_version != wrv {
            tracing::warn!(
                worker_uuid = %worker_uuid,
                wrv = %wrv,
                current_wrv = %worker.worker_recovery_version,
                "Messages from a worker with an outdated recovery version, discarding"
            );
            return Ok(DispatchOutcome::StaleRecoveryVersion);
        }

        let outcome = self.dispatch_in(&mut *guard, messages).await?;
        update_bulk_number_in(&mut *guard, worker_uuid, bulk_number).await?;

        drop(guard);
        tx.commit().await?;
        Ok(outcome)
    }

    async fn dispatch_in<T: StoreTx>(
        &self,
        tx: &mut T,
        messages: Vec<DispatchMessage>,
    ) -> AppResult<DispatchOutcome> {
        let started = Instant::now();
        let total = messages.len();
        tracing::debug!(count = total, "Dispatching messages");

        let mut executions: Vec<ExecutionMessage> = Vec::new();
        let mut splits: Vec<SplitMessage> = Vec::new();
        for message in messages {
            match message {
                DispatchMessage::Execution(m) => executions.push(m),
                DispatchMessage::Split(m) => splits.push(m),
                DispatchMessage::Unknown => {}
            }
        }

        if !executions.is_empty() {
            tx.enqueue(&executions).await?;
        }
        if !splits.is_empty() {
            self.split_join.split_in(tx, &splits).await?;
        }

        let dropped = total - executions.len() - splits.len();
        if dropped > 0 {
            tracing::warn!(
                dropped,
                "Messages of unknown kind were not dispatched"
            );
        }

        tracing::debug!(
            count = executions.len() + splits.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Dispatch done"
        );
        Ok(DispatchOutcome::Dispatched {
            execution_messages: executions.len(),
            split_messages: splits.len(),
            dropped,
        })
    }
}
