//! HTTP handlers for the orchestrator API.
//!
//! This module contains all route handlers organized by domain.

pub mod database;
pub mod dispatch;
pub mod executions;
pub mod health;
pub mod workers;

pub use health::{api_health, health_check};
