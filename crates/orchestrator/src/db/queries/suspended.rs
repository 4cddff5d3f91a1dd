//! Suspended execution and finished branch queries.

use std::collections::HashMap;

use sqlx::types::Json;
use sqlx::PgConnection;

use crate::db::models::{
    FinishedBranch, FinishedBranchRow, SuspendedExecution, SuspendedExecutionRow,
};
use crate::error::{AppError, AppResult};

/// Insert suspended executions.
pub async fn insert_suspended(
    conn: &mut PgConnection,
    suspended: &[SuspendedExecution],
) -> AppResult<()> {
    for se in suspended {
        sqlx::query(
            r#"
            INSERT INTO orch.suspended_executions (
                execution_id, split_id, number_of_branches, execution_object
            )
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(&se.execution_id)
        .bind(&se.split_id)
        .bind(se.number_of_branches)
        .bind(&se.execution_object)
        .execute(&mut *conn)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db) if db.is_unique_violation() => {
                AppError::AlreadyExists(format!("suspended execution for split {}", se.split_id))
            }
            other => AppError::Database(other),
        })?;
    }

    Ok(())
}

/// Lock and load suspended executions by split id, finished branches loaded.
pub async fn get_by_split_ids(
    conn: &mut PgConnection,
    split_ids: &[String],
) -> AppResult<Vec<SuspendedExecution>> {
    let rows = sqlx::query_as::<_, SuspendedExecutionRow>(
        r#"
        SELECT id, execution_id, split_id, number_of_branches, execution_object
        FROM orch.suspended_executions
        WHERE split_id = ANY($1)
        ORDER BY id
        FOR UPDATE
        "#,
    )
    .bind(split_ids)
    .fetch_all(&mut *conn)
    .await?;

    with_branches(conn, rows).await
}

/// Attach a finished branch to its suspended execution.
pub async fn insert_finished_branch(
    conn: &mut PgConnection,
    suspended_id: i64,
    branch: &FinishedBranch,
) -> AppResult<()> {
    sqlx::query(
        r#"
        INSERT INTO orch.finished_branches (
            suspended_execution_id, execution_id, branch_id, split_id,
            branch_error, branch_contexts
        )
        VALUES ($1, $2, $3, $4, $5, $6)
        "#,
    )
    .bind(suspended_id)
    .bind(&branch.execution_id)
    .bind(&branch.branch_id)
    .bind(&branch.split_id)
    .bind(&branch.branch_error)
    .bind(Json(&branch.branch_contexts))
    .execute(conn)
    .await?;

    Ok(())
}

/// Lock up to `limit` join-ready suspended executions, skipping rows held by
/// another joiner.
pub async fn get_join_ready(
    conn: &mut PgConnection,
    limit: usize,
) -> AppResult<Vec<SuspendedExecution>> {
    let rows = sqlx::query_as::<_, SuspendedExecutionRow>(
        r#"
        SELECT se.id, se.execution_id, se.split_id, se.number_of_branches, se.execution_object
        FROM orch.suspended_executions se
        WHERE se.number_of_branches = (
            SELECT COUNT(*) FROM orch.finished_branches fb
            WHERE fb.suspended_execution_id = se.id
        )
        ORDER BY se.id
        LIMIT $1
        FOR UPDATE SKIP LOCKED
        "#,
    )
    .bind(limit as i64)
    .fetch_all(&mut *conn)
    .await?;

    with_branches(conn, rows).await
}

/// Delete suspended executions by split id and return how many were removed.
/// Finished branches cascade.
pub async fn delete_by_split_ids(
    conn: &mut PgConnection,
    split_ids: &[String],
) -> AppResult<usize> {
    let result = sqlx::query("DELETE FROM orch.suspended_executions WHERE split_id = ANY($1)")
        .bind(split_ids)
        .execute(conn)
        .await?;

    Ok(result.rows_affected() as usize)
}

/// Number of parents waiting on a split.
pub async fn count(conn: &mut PgConnection) -> AppResult<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM orch.suspended_executions")
        .fetch_one(conn)
        .await?;
    Ok(count)
}

async fn with_branches(
    conn: &mut PgConnection,
    rows: Vec<SuspendedExecutionRow>,
) -> AppResult<Vec<SuspendedExecution>> {
    if rows.is_empty() {
        return Ok(Vec::new());
    }

    let ids: Vec<i64> = rows.iter().map(|r| r.id).collect();
    let branch_rows = sqlx::query_as::<_, FinishedBranchRow>(
        r#"
        SELECT suspended_execution_id, execution_id, branch_id, split_id,
               branch_error, branch_contexts
        FROM orch.finished_branches
        WHERE suspended_execution_id = ANY($1)
        ORDER BY id
        "#,
    )
    .bind(&ids)
    .fetch_all(conn)
    .await?;

    let mut by_parent: HashMap<i64, Vec<FinishedBranch>> = HashMap::new();
    for row in branch_rows {
        by_parent
            .entry(row.suspended_execution_id)
            .or_default()
            .push(row.into());
    }

    Ok(rows
        .into_iter()
        .map(|row| {
            let branches = by_parent.remove(&row.id).unwrap_or_default();
            row.into_suspended(branches)
        })
        .collect())
}
