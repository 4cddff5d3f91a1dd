//! Execution cancellation API handlers.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};

use crate::engine::ExecutionActionResult;
use crate::error::AppError;
use crate::nats::NotificationReason;
use crate::state::AppState;

/// Response for a cancellation request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelResponse {
    pub execution_id: i64,
    pub result: ExecutionActionResult,
}

/// Response for cancellation check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancellationCheckResponse {
    pub execution_id: i64,
    pub is_cancelled: bool,
}

/// Request cancellation of an execution.
///
/// POST /api/executions/{execution_id}/cancel
///
/// Refusals answer 409 with the refusing code in `result`; an unknown
/// execution answers 404.
pub async fn cancel(
    State(state): State<AppState>,
    Path(execution_id): Path<i64>,
) -> Result<(StatusCode, Json<CancelResponse>), AppError> {
    let result = state
        .orchestrator
        .cancellation
        .request_cancel_execution(execution_id)
        .await?;

    let status = match result {
        ExecutionActionResult::Success => {
            if let Some(notifier) = &state.notifier {
                notifier.notify(NotificationReason::Cancel, 1, None).await;
            }
            StatusCode::OK
        }
        ExecutionActionResult::FailedNotFound => StatusCode::NOT_FOUND,
        _ => StatusCode::CONFLICT,
    };

    Ok((
        status,
        Json(CancelResponse {
            execution_id,
            result,
        }),
    ))
}

/// Check if an execution is cancelled.
///
/// GET /api/executions/{execution_id}/cancellation-check
pub async fn cancellation_check(
    State(state): State<AppState>,
    Path(execution_id): Path<i64>,
) -> Result<Json<CancellationCheckResponse>, AppError> {
    let is_cancelled = state
        .orchestrator
        .cancellation
        .is_canceled_execution(execution_id)
        .await?;
    Ok(Json(CancellationCheckResponse {
        execution_id,
        is_cancelled,
    }))
}

/// Ids of executions that are cancelled or pending cancellation.
///
/// GET /api/executions/canceled
pub async fn list_canceled(State(state): State<AppState>) -> Result<Json<Vec<i64>>, AppError> {
    Ok(Json(
        state
            .orchestrator
            .cancellation
            .read_canceled_executions_ids()
            .await?,
    ))
}
