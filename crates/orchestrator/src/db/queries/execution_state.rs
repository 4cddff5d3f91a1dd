//! Execution state queries.

use sqlx::PgConnection;

use crate::db::models::{ExecutionState, ExecutionStateRow};
use crate::engine::ExecutionStatus;
use crate::error::AppResult;

/// Get the state of one execution branch.
pub async fn get_state(
    conn: &mut PgConnection,
    execution_id: i64,
    branch_id: &str,
) -> AppResult<Option<ExecutionState>> {
    let row = sqlx::query_as::<_, ExecutionStateRow>(
        r#"
        SELECT execution_id, branch_id, status, execution_object, updated_at
        FROM orch.execution_states
        WHERE execution_id = $1 AND branch_id = $2
        "#,
    )
    .bind(execution_id)
    .bind(branch_id)
    .fetch_optional(conn)
    .await?;

    row.map(ExecutionState::try_from).transpose()
}

/// Get the root and branch states of an execution.
pub async fn get_states(conn: &mut PgConnection, execution_id: i64) -> AppResult<Vec<ExecutionState>> {
    let rows = sqlx::query_as::<_, ExecutionStateRow>(
        r#"
        SELECT execution_id, branch_id, status, execution_object, updated_at
        FROM orch.execution_states
        WHERE execution_id = $1
        ORDER BY branch_id
        "#,
    )
    .bind(execution_id)
    .fetch_all(conn)
    .await?;

    rows.into_iter().map(ExecutionState::try_from).collect()
}

/// Distinct execution ids having a branch in one of `statuses`.
pub async fn get_ids_by_statuses(
    conn: &mut PgConnection,
    statuses: &[ExecutionStatus],
) -> AppResult<Vec<i64>> {
    let statuses: Vec<&str> = statuses.iter().map(|s| s.as_str()).collect();
    let ids: Vec<i64> = sqlx::query_scalar(
        r#"
        SELECT DISTINCT execution_id
        FROM orch.execution_states
        WHERE status = ANY($1)
        ORDER BY execution_id
        "#,
    )
    .bind(&statuses)
    .fetch_all(conn)
    .await?;

    Ok(ids)
}

/// Insert or replace the state of one execution branch.
pub async fn upsert_state(conn: &mut PgConnection, state: &ExecutionState) -> AppResult<()> {
    sqlx::query(
        r#"
        INSERT INTO orch.execution_states (
            execution_id, branch_id, status, execution_object, updated_at
        )
        VALUES ($1, $2, $3, $4, $5)
        ON CONFLICT (execution_id, branch_id) DO UPDATE SET
            status = EXCLUDED.status,
            execution_object = EXCLUDED.execution_object,
            updated_at = EXCLUDED.updated_at
        "#,
    )
    .bind(state.execution_id)
    .bind(&state.branch_id)
    .bind(state.status.as_str())
    .bind(&state.execution_object)
    .bind(state.updated_at)
    .execute(conn)
    .await?;

    Ok(())
}
