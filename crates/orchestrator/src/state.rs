//! Application state for the orchestrator server.
//!
//! Shared by all handlers through Axum's state management.

use crate::config::AppConfig;
use crate::db::DbPool;
use crate::nats::QueueNotifier;
use crate::services::Orchestrator;
use crate::store::PgStore;
use std::sync::Arc;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    /// Database connection pool
    pub db: DbPool,

    /// Application configuration
    pub config: Arc<AppConfig>,

    /// Orchestration services over the PostgreSQL store
    pub orchestrator: Arc<Orchestrator<PgStore>>,

    /// Queue notifier (optional)
    pub notifier: Option<QueueNotifier>,

    /// Server start time for uptime calculation
    pub start_time: std::time::Instant,
}

impl AppState {
    pub fn new(
        db: DbPool,
        config: AppConfig,
        orchestrator: Arc<Orchestrator<PgStore>>,
        notifier: Option<QueueNotifier>,
    ) -> Self {
        Self {
            db,
            config: Arc::new(config),
            orchestrator,
            notifier,
            start_time: std::time::Instant::now(),
        }
    }

    /// Get the server uptime in seconds.
    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Check if queue notifications are published.
    pub fn has_nats(&self) -> bool {
        self.notifier.is_some()
    }
}
