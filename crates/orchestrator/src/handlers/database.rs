//! Database schema handlers.

use axum::{extract::State, Json};
use serde::Serialize;

use crate::db::schema;
use crate::error::AppError;
use crate::state::AppState;

/// Response for database schema operations.
#[derive(Debug, Clone, Serialize)]
pub struct SchemaOperationResponse {
    /// Operation status.
    pub status: String,

    /// Operation message.
    pub message: String,

    /// Whether every orchestration table exists.
    pub valid: bool,

    /// List of missing tables.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub missing: Vec<String>,
}

/// Create the orchestration schema.
///
/// POST /api/db/init
///
/// Idempotent: existing tables are left untouched.
pub async fn init_database(
    State(state): State<AppState>,
) -> Result<Json<SchemaOperationResponse>, AppError> {
    schema::init_schema(&state.db).await?;
    let missing = schema::missing_tables(&state.db).await?;

    Ok(Json(SchemaOperationResponse {
        status: "ok".to_string(),
        message: format!("Schema initialised with {} tables", schema::TABLES.len()),
        valid: missing.is_empty(),
        missing,
    }))
}

/// Report orchestration tables missing from the database.
///
/// GET /api/db/validate
pub async fn validate_database(
    State(state): State<AppState>,
) -> Result<Json<SchemaOperationResponse>, AppError> {
    let missing = schema::missing_tables(&state.db).await?;
    let valid = missing.is_empty();

    Ok(Json(SchemaOperationResponse {
        status: "ok".to_string(),
        message: if valid {
            "All orchestration tables exist".to_string()
        } else {
            format!("{} orchestration tables are missing", missing.len())
        },
        valid,
        missing,
    }))
}
