//! Worker registry API handlers.
//!
//! Handles worker registration, login, liveness, activation and group
//! membership.

use std::collections::BTreeMap;

use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::{Deserialize, Serialize};

use crate::db::models::WorkerNode;
use crate::error::AppError;
use crate::state::AppState;

/// Request for registering a worker.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateWorkerRequest {
    pub uuid: String,
    pub password: String,
    pub host_name: String,
    pub install_dir: String,
}

/// Request for a worker login.
#[derive(Debug, Clone, Deserialize)]
pub struct UpRequest {
    /// Software version of the worker
    pub version: String,
}

/// The worker recovery version a worker must present when dispatching.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WrvResponse {
    pub worker_uuid: String,
    pub wrv: String,
}

/// Request replacing a worker's groups.
#[derive(Debug, Clone, Deserialize)]
pub struct UpdateGroupsRequest {
    pub groups: Vec<String>,
}

/// Query parameters for listing workers.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListWorkersQuery {
    /// Only workers with this activation
    pub active: Option<bool>,
    /// Include soft-deleted workers
    #[serde(default)]
    pub include_deleted: bool,
}

/// Response for worker operations.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerOperationResponse {
    pub status: String,
    pub message: String,
}

fn ok(message: String) -> Json<WorkerOperationResponse> {
    Json(WorkerOperationResponse {
        status: "ok".to_string(),
        message,
    })
}

/// Register a worker.
///
/// POST /api/workers
pub async fn create(
    State(state): State<AppState>,
    Json(request): Json<CreateWorkerRequest>,
) -> Result<Json<WorkerNode>, AppError> {
    let worker = state
        .orchestrator
        .worker_nodes
        .create(
            &request.uuid,
            &request.password,
            &request.host_name,
            &request.install_dir,
        )
        .await?;
    Ok(Json(worker))
}

/// Soft-delete a worker.
///
/// DELETE /api/workers/{uuid}
pub async fn delete(
    State(state): State<AppState>,
    Path(uuid): Path<String>,
) -> Result<Json<WorkerOperationResponse>, AppError> {
    state
        .orchestrator
        .worker_nodes
        .update_worker_to_deleted(&uuid)
        .await?;
    Ok(ok(format!("Worker {} deleted", uuid)))
}

/// List workers.
///
/// GET /api/workers
pub async fn list(
    State(state): State<AppState>,
    Query(query): Query<ListWorkersQuery>,
) -> Result<Json<Vec<WorkerNode>>, AppError> {
    let workers = &state.orchestrator.worker_nodes;
    let result = match (query.include_deleted, query.active) {
        (true, _) => workers.read_all_workers().await?,
        (false, Some(active)) => workers.read_workers_by_activation(active).await?,
        (false, None) => workers.read_all_not_deleted_workers().await?,
    };
    Ok(Json(result))
}

/// Get a non-deleted worker.
///
/// GET /api/workers/{uuid}
pub async fn get(
    State(state): State<AppState>,
    Path(uuid): Path<String>,
) -> Result<Json<WorkerNode>, AppError> {
    Ok(Json(state.orchestrator.worker_nodes.read_by_uuid(&uuid).await?))
}

/// Log a worker in.
///
/// POST /api/workers/{uuid}/up
pub async fn up(
    State(state): State<AppState>,
    Path(uuid): Path<String>,
    Json(request): Json<UpRequest>,
) -> Result<Json<WrvResponse>, AppError> {
    let wrv = state
        .orchestrator
        .worker_nodes
        .up(&uuid, &request.version)
        .await?;
    Ok(Json(WrvResponse {
        worker_uuid: uuid,
        wrv,
    }))
}

/// Record a liveness ping.
///
/// POST /api/workers/{uuid}/keep-alive
pub async fn keep_alive(
    State(state): State<AppState>,
    Path(uuid): Path<String>,
) -> Result<Json<WrvResponse>, AppError> {
    let wrv = state.orchestrator.worker_nodes.keep_alive(&uuid).await?;
    Ok(Json(WrvResponse {
        worker_uuid: uuid,
        wrv,
    }))
}

/// POST /api/workers/{uuid}/activate
pub async fn activate(
    State(state): State<AppState>,
    Path(uuid): Path<String>,
) -> Result<Json<WorkerOperationResponse>, AppError> {
    state.orchestrator.worker_nodes.activate(&uuid).await?;
    Ok(ok(format!("Worker {} activated", uuid)))
}

/// POST /api/workers/{uuid}/deactivate
pub async fn deactivate(
    State(state): State<AppState>,
    Path(uuid): Path<String>,
) -> Result<Json<WorkerOperationResponse>, AppError> {
    state.orchestrator.worker_nodes.deactivate(&uuid).await?;
    Ok(ok(format!("Worker {} deactivated", uuid)))
}

/// GET /api/workers/{uuid}/groups
pub async fn get_groups(
    State(state): State<AppState>,
    Path(uuid): Path<String>,
) -> Result<Json<Vec<String>>, AppError> {
    Ok(Json(
        state.orchestrator.worker_nodes.read_worker_groups(&uuid).await?,
    ))
}

/// Replace the groups of a worker. An empty list is rejected.
///
/// PUT /api/workers/{uuid}/groups
pub async fn update_groups(
    State(state): State<AppState>,
    Path(uuid): Path<String>,
    Json(request): Json<UpdateGroupsRequest>,
) -> Result<Json<Vec<String>>, AppError> {
    let workers = &state.orchestrator.worker_nodes;
    workers.update_worker_groups(&uuid, request.groups).await?;
    Ok(Json(workers.read_worker_groups(&uuid).await?))
}

/// POST /api/workers/{uuid}/groups/{group}
pub async fn add_group(
    State(state): State<AppState>,
    Path((uuid, group)): Path<(String, String)>,
) -> Result<Json<WorkerOperationResponse>, AppError> {
    state
        .orchestrator
        .worker_nodes
        .add_group_to_worker(&uuid, &group)
        .await?;
    Ok(ok(format!("Worker {} joined group {}", uuid, group)))
}

/// Remove a worker from a group. Removing its last group is rejected.
///
/// DELETE /api/workers/{uuid}/groups/{group}
pub async fn remove_group(
    State(state): State<AppState>,
    Path((uuid, group)): Path<(String, String)>,
) -> Result<Json<WorkerOperationResponse>, AppError> {
    state
        .orchestrator
        .worker_nodes
        .remove_group_from_worker(&uuid, &group)
        .await?;
    Ok(ok(format!("Worker {} left group {}", uuid, group)))
}

/// Uuids of workers that missed too many recovery cycles.
///
/// GET /api/workers/non-responding
pub async fn non_responding(
    State(state): State<AppState>,
) -> Result<Json<Vec<String>>, AppError> {
    Ok(Json(
        state
            .orchestrator
            .worker_nodes
            .read_non_responding_workers()
            .await?,
    ))
}

/// Distinct group names across all workers.
///
/// GET /api/worker-groups
pub async fn list_groups(State(state): State<AppState>) -> Result<Json<Vec<String>>, AppError> {
    Ok(Json(
        state.orchestrator.worker_nodes.read_all_worker_groups().await?,
    ))
}

/// Group name to uuids of active, running workers.
///
/// GET /api/worker-groups/available
pub async fn available_groups(
    State(state): State<AppState>,
) -> Result<Json<BTreeMap<String, Vec<String>>>, AppError> {
    Ok(Json(
        state
            .orchestrator
            .worker_nodes
            .read_group_workers_map_active_and_running()
            .await?,
    ))
}
