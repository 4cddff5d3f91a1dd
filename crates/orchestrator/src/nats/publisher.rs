//! NATS queue notification publisher.
//!
//! The queue tables are the transactional sink. After a transaction that
//! enqueued messages commits, the server publishes a lightweight
//! notification so that idle workers poll right away instead of waiting
//! for their next cycle.

use async_nats::jetstream::{self, Context};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

/// Default NATS subject for queue notifications.
pub const DEFAULT_SUBJECT: &str = "orchestrator.queue";

/// Default JetStream stream name.
pub const DEFAULT_STREAM: &str = "orchestrator_queue";

/// Errors that can occur during NATS operations.
#[derive(Debug, Error)]
pub enum NatsError {
    #[error("JetStream error: {0}")]
    JetStream(String),

    #[error("Publish error: {0}")]
    Publish(String),
}

impl From<NatsError> for crate::error::AppError {
    fn from(err: NatsError) -> Self {
        crate::error::AppError::Nats(err.to_string())
    }
}

/// What put messages on the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationReason {
    Dispatch,
    Join,
    Cancel,
}

/// Notification published after messages were committed to the queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueNotification {
    pub reason: NotificationReason,

    /// Messages made visible by the commit.
    pub message_count: usize,

    /// Worker whose dispatch produced the messages, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_uuid: Option<String>,
}

/// JetStream publisher for queue notifications.
///
/// Optional: without it workers only find new messages by polling.
#[derive(Clone)]
pub struct QueueNotifier {
    js: Context,
    subject: String,
}

impl QueueNotifier {
    /// Create a notifier from a connected client, creating the stream when
    /// it does not exist.
    pub async fn new(
        client: Arc<async_nats::Client>,
        subject: Option<&str>,
        stream_name: Option<&str>,
    ) -> Result<Self, NatsError> {
        let subject = subject.unwrap_or(DEFAULT_SUBJECT).to_string();
        let stream = stream_name.unwrap_or(DEFAULT_STREAM);

        let js = jetstream::new((*client).clone());
        Self::ensure_stream(&js, stream, &subject).await?;

        Ok(Self { js, subject })
    }

    async fn ensure_stream(js: &Context, stream: &str, subject: &str) -> Result<(), NatsError> {
        match js.get_stream(stream).await {
            Ok(_) => {
                tracing::debug!(stream = %stream, "Using existing NATS stream");
                Ok(())
            }
            Err(_) => {
                let config = jetstream::stream::Config {
                    name: stream.to_string(),
                    subjects: vec![subject.to_string()],
                    // notifications are only useful while fresh
                    max_age: std::time::Duration::from_secs(300),
                    storage: jetstream::stream::StorageType::Memory,
                    ..Default::default()
                };

                js.create_stream(config)
                    .await
                    .map_err(|e| NatsError::JetStream(e.to_string()))?;

                tracing::info!(stream = %stream, subject = %subject, "Created NATS stream");
                Ok(())
            }
        }
    }

    pub async fn publish(&self, notification: &QueueNotification) -> Result<(), NatsError> {
        let payload = serde_json::to_vec(notification)
            .map_err(|e| NatsError::Publish(format!("Serialization error: {}", e)))?;

        self.js
            .publish(self.subject.clone(), payload.into())
            .await
            .map_err(|e| NatsError::Publish(e.to_string()))?
            .await
            .map_err(|e| NatsError::Publish(e.to_string()))?;

        tracing::debug!(
            reason = ?notification.reason,
            message_count = notification.message_count,
            "Published queue notification"
        );
        Ok(())
    }

    /// Publish, logging failures. Nothing is sent for an empty commit.
    pub async fn notify(
        &self,
        reason: NotificationReason,
        message_count: usize,
        worker_uuid: Option<&str>,
    ) {
        if message_count == 0 {
            return;
        }
        let notification = QueueNotification {
            reason,
            message_count,
            worker_uuid: worker_uuid.map(str::to_string),
        };
        if let Err(e) = self.publish(&notification).await {
            tracing::warn!(error = %e, reason = ?reason, "Queue notification failed");
        }
    }
}
