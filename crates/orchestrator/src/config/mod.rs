//! Configuration module for the orchestrator.
//!
//! Configuration is loaded from environment variables using the `envy`
//! crate and handed to the services at construction time.

mod app;
mod database;

pub use app::{AppConfig, OrchestratorConfig};
pub use database::DatabaseConfig;
