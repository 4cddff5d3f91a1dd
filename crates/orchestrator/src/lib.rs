//! Orchestration Core Library
//!
//! This crate provides the consistency core of a distributed workflow
//! engine, handling:
//!
//! - **Split/Join**: fork a flow into branches and join them exactly once
//! - **Dispatch**: admit worker batches idempotently, gated on the bulk
//!   number and the worker recovery version
//! - **Worker Registry and Lock**: liveness, recovery and group membership
//! - **Cancellation**: the execution cancellation state machine
//!
//! ## Architecture
//!
//! Services run every operation in one transaction of a [`store::Store`].
//! PostgreSQL is the production backend; an in-memory store serves tests
//! and local runs. NATS JetStream is used for optional queue notifications.
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading from environment variables
//! - [`db`]: Database connectivity, schema, models and queries
//! - [`engine`]: Execution snapshots and dispatch messages
//! - [`error`]: Custom error types with Axum integration
//! - [`handlers`]: HTTP route handlers
//! - [`scheduler`]: Periodic join and recovery sweeps
//! - [`services`]: The orchestration services
//! - [`state`]: Shared application state
//! - [`store`]: Transactional storage seam and its backends
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use orchestrator_core::{
//!     config::OrchestratorConfig,
//!     engine::JsonExecutionCodec,
//!     services::Orchestrator,
//!     store::MemoryStore,
//! };
//!
//! let store = MemoryStore::new();
//! let orchestrator = Orchestrator::new(
//!     store.clone(),
//!     Arc::new(store.clone()),
//!     Arc::new(JsonExecutionCodec),
//!     Vec::new(),
//!     &OrchestratorConfig::default(),
//! );
//! let joined = orchestrator.split_join.join_finished_splits_default().await;
//! ```

pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod handlers;
pub mod nats;
pub mod result_ext;
pub mod scheduler;
pub mod services;
pub mod state;
pub mod store;

pub use error::{AppError, AppResult};
pub use result_ext::{CycleResultExt, MissingExt};
