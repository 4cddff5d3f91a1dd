//! Database queries for the orchestration core.
//!
//! Query functions run on a connection so callers can compose them inside
//! one transaction.

pub mod execution_state;
pub mod queue;
pub mod suspended;
pub mod version;
pub mod worker;
pub mod worker_lock;
