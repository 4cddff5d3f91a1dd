//! Database models for the orchestration core.
//!
//! Each model pairs the domain record used by the services with the
//! SQLx row it is loaded from.

pub mod execution_state;
pub mod suspended;
pub mod worker;

pub use execution_state::*;
pub use suspended::*;
pub use worker::*;
