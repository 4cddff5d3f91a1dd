//! Execution model shared by the orchestration services.
//!
//! - **Execution**: the flow snapshot, its status state machine and codec
//! - **Messages**: the tagged message kinds accepted by dispatch

pub mod execution;
pub mod messages;

pub use execution::{
    EndBranchData, Execution, ExecutionActionResult, ExecutionCodec, ExecutionStatus,
    JsonExecutionCodec, SystemContext, EMPTY_BRANCH,
};
pub use messages::{DispatchMessage, ExecutionMessage, SplitMessage};
