//! Dispatch and split/join API handlers.
//!
//! Workers hand their message batches and finished branches to the
//! orchestrator here. Queue notifications are published after commit.

use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::{Deserialize, Serialize};

use crate::engine::{DispatchMessage, Execution};
use crate::error::AppError;
use crate::nats::NotificationReason;
use crate::services::{DispatchOutcome, EndBranchReport};
use crate::state::AppState;

/// A batch of messages from one worker.
#[derive(Debug, Clone, Deserialize)]
pub struct DispatchRequest {
    pub bulk_number: String,
    /// Worker recovery version known to the caller
    pub wrv: String,
    pub messages: Vec<DispatchMessage>,
}

/// Request reporting finished branch executions.
#[derive(Debug, Clone, Deserialize)]
pub struct EndBranchRequest {
    pub executions: Vec<Execution>,
}

/// Query parameters for an on-demand join.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JoinQuery {
    pub bulk_size: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct JoinResponse {
    pub joined: usize,
}

/// Dispatch a batch of messages for a worker.
///
/// POST /api/workers/{uuid}/dispatch
///
/// A duplicate bulk number or an outdated recovery version is not an
/// error: the batch is discarded and the outcome says why.
pub async fn dispatch(
    State(state): State<AppState>,
    Path(uuid): Path<String>,
    Json(request): Json<DispatchRequest>,
) -> Result<Json<DispatchOutcome>, AppError> {
    let outcome = state
        .orchestrator
        .dispatcher
        .dispatch(request.messages, &request.bulk_number, &request.wrv, &uuid)
        .await?;

    if let (Some(notifier), DispatchOutcome::Dispatched {
        execution_messages,
        split_messages,
        ..
    }) = (&state.notifier, &outcome)
    {
        notifier
            .notify(
                NotificationReason::Dispatch,
                execution_messages + split_messages,
                Some(&uuid),
            )
            .await;
    }

    Ok(Json(outcome))
}

/// Report finished branches.
///
/// POST /api/branches/finished
pub async fn end_branch(
    State(state): State<AppState>,
    Json(request): Json<EndBranchRequest>,
) -> Result<Json<EndBranchReport>, AppError> {
    let report = state
        .orchestrator
        .split_join
        .end_branch(&request.executions)
        .await?;

    if let Some(notifier) = &state.notifier {
        notifier
            .notify(NotificationReason::Join, report.joined, None)
            .await;
    }
    Ok(Json(report))
}

/// Join finished splits now instead of waiting for the sweep.
///
/// POST /api/splits/join
pub async fn join(
    State(state): State<AppState>,
    Query(query): Query<JoinQuery>,
) -> Result<Json<JoinResponse>, AppError> {
    let bulk_size = query
        .bulk_size
        .unwrap_or(state.config.split_join_bulk_size);
    let joined = state
        .orchestrator
        .split_join
        .join_finished_splits(bulk_size)
        .await?;

    if let Some(notifier) = &state.notifier {
        notifier.notify(NotificationReason::Join, joined, None).await;
    }
    Ok(Json(JoinResponse { joined }))
}
