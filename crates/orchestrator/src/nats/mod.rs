//! NATS JetStream integration.
//!
//! Publishes queue notifications to workers after commits.

pub mod publisher;

pub use publisher::{NatsError, NotificationReason, QueueNotification, QueueNotifier};
