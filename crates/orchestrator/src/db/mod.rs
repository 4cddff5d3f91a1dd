//! Database module for the orchestration core.
//!
//! This module provides PostgreSQL connectivity, the schema DDL, models
//! and queries using SQLx.

pub mod models;
pub mod pool;
pub mod queries;
pub mod schema;

pub use pool::{create_pool, DbPool};
