//! Periodic triggers for the join sweep and the recovery sweep.
//!
//! Both loops run until their task is aborted. A failed cycle is logged by
//! the service and the loop waits for the next tick.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::nats::{NotificationReason, QueueNotifier};
use crate::services::Orchestrator;
use crate::store::Store;

/// Join suspended executions whose branches have all finished, every `period`.
pub fn spawn_join_sweep<S: Store + Clone>(
    orchestrator: Arc<Orchestrator<S>>,
    period: Duration,
    notifier: Option<QueueNotifier>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await; // Skip first immediate tick

        loop {
            ticker.tick().await;

            let joined = orchestrator.split_join.join_finished_splits_default().await;
            if joined > 0 {
                tracing::debug!(joined, "Join sweep resumed parents");
                if let Some(notifier) = &notifier {
                    notifier.notify(NotificationReason::Join, joined, None).await;
                }
            } else {
                tracing::trace!("Join sweep found nothing to join");
            }
        }
    })
}

/// Run a worker recovery cycle every `period`.
pub fn spawn_recovery_sweep<S: Store + Clone>(
    orchestrator: Arc<Orchestrator<S>>,
    period: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await;

        loop {
            ticker.tick().await;

            if let Some(report) = orchestrator.recovery.recover_non_responding_workers().await {
                if !report.recovered.is_empty() || !report.failed.is_empty() {
                    tracing::info!(
                        version = report.version,
                        recovered = report.recovered.len(),
                        failed = report.failed.len(),
                        "Recovery cycle finished"
                    );
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OrchestratorConfig;
    use crate::engine::{Execution, JsonExecutionCodec, SplitMessage};
    use crate::store::{MemoryStore, VersionSource, MSG_RECOVERY_VERSION};

    fn orchestrator(store: &MemoryStore) -> Arc<Orchestrator<MemoryStore>> {
        Arc::new(Orchestrator::new(
            store.clone(),
            Arc::new(store.clone()),
            Arc::new(JsonExecutionCodec),
            Vec::new(),
            &OrchestratorConfig::default(),
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_sweep_joins_ready_splits() {
        let store = MemoryStore::new();
        let orch = orchestrator(&store);

        let parent = Execution::new(1, 1, Some(2));
        let children: Vec<Execution> = (0..2)
            .map(|i| parent.branch(&i.to_string(), "s1", None))
            .collect();
        orch.split_join
            .split(&[SplitMessage {
                split_id: "s1".into(),
                parent,
                children: children.clone(),
            }])
            .await
            .unwrap();
        orch.split_join.end_branch(&children).await.unwrap();

        let handle = spawn_join_sweep(orch, Duration::from_millis(100), None);
        tokio::time::sleep(Duration::from_millis(250)).await;
        handle.abort();

        assert!(store.suspended_executions().await.is_empty());
        assert_eq!(store.queued_messages().await.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovery_sweep_advances_version_each_tick() {
        let store = MemoryStore::new();
        let handle = spawn_recovery_sweep(orchestrator(&store), Duration::from_secs(1));

        tokio::time::sleep(Duration::from_millis(2500)).await;
        handle.abort();

        assert_eq!(store.current_version(MSG_RECOVERY_VERSION).await.unwrap(), 2);
    }
}
