//! Health endpoints.

use axum::{extract::State, http::StatusCode, Json};
use serde::{Deserialize, Serialize};

use crate::error::AppResult;
use crate::services::OrchestratorStatus;
use crate::state::AppState;

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthCheckResponse {
    pub status: String,
}

/// Orchestrator health as seen through its store.
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiHealthResponse {
    /// "ok" or "unhealthy"
    pub status: String,

    /// "reachable" or "unreachable"
    pub store: String,

    /// Current value of the recovery version counter
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recovery_version: Option<i64>,

    /// Parents waiting for their branches to finish
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suspended_executions: Option<i64>,

    /// "publishing" when queue notifications go out over NATS, else "disabled"
    pub queue_notifications: String,

    pub uptime_seconds: u64,

    pub version: String,
}

/// `GET /health`
///
/// Liveness only; answers without touching the store.
pub async fn health_check() -> Json<HealthCheckResponse> {
    Json(HealthCheckResponse {
        status: "ok".to_string(),
    })
}

/// `GET /api/health`
///
/// Reads the recovery version and the suspended execution count. Answers
/// 503 when either read fails.
pub async fn api_health(State(state): State<AppState>) -> (StatusCode, Json<ApiHealthResponse>) {
    let status = state.orchestrator.status().await;
    let (code, response) = report(status, state.has_nats(), state.uptime_seconds());
    (code, Json(response))
}

fn report(
    status: AppResult<OrchestratorStatus>,
    notifications: bool,
    uptime_seconds: u64,
) -> (StatusCode, ApiHealthResponse) {
    let queue_notifications = if notifications { "publishing" } else { "disabled" }.to_string();
    let version = env!("CARGO_PKG_VERSION").to_string();

    match status {
        Ok(status) => (
            StatusCode::OK,
            ApiHealthResponse {
                status: "ok".to_string(),
                store: "reachable".to_string(),
                recovery_version: Some(status.recovery_version),
                suspended_executions: Some(status.suspended_executions),
                queue_notifications,
                uptime_seconds,
                version,
            },
        ),
        Err(e) => {
            tracing::warn!(error = %e, "Health check could not read the store");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                ApiHealthResponse {
                    status: "unhealthy".to_string(),
                    store: "unreachable".to_string(),
                    recovery_version: None,
                    suspended_executions: None,
                    queue_notifications,
                    uptime_seconds,
                    version,
                },
            )
        }
    }
}
