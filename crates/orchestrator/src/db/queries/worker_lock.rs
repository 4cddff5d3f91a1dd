//! Worker lock queries.
//!
//! The lock is a row per worker uuid, locked with `SELECT ... FOR UPDATE`
//! and released when the holding transaction ends.

use sqlx::PgConnection;

use crate::error::{AppError, AppResult};

/// Create the lock row for a worker.
pub async fn insert_lock(conn: &mut PgConnection, uuid: &str) -> AppResult<()> {
    let result = sqlx::query(
        "INSERT INTO orch.worker_locks (uuid) VALUES ($1) ON CONFLICT (uuid) DO NOTHING",
    )
    .bind(uuid)
    .execute(conn)
    .await?;

    if result.rows_affected() == 0 {
        return Err(AppError::AlreadyExists(format!("lock for worker {}", uuid)));
    }

    Ok(())
}

/// Delete the lock row for a worker, if any.
pub async fn delete_lock(conn: &mut PgConnection, uuid: &str) -> AppResult<()> {
    sqlx::query("DELETE FROM orch.worker_locks WHERE uuid = $1")
        .bind(uuid)
        .execute(conn)
        .await?;

    Ok(())
}

/// Lock the row for a worker until the transaction ends.
pub async fn lock(conn: &mut PgConnection, uuid: &str) -> AppResult<()> {
    let locked: Option<String> =
        sqlx::query_scalar("SELECT uuid FROM orch.worker_locks WHERE uuid = $1 FOR UPDATE")
            .bind(uuid)
            .fetch_optional(conn)
            .await?;

    locked
        .map(|_| ())
        .ok_or_else(|| AppError::NotFound(format!("lock for worker {}", uuid)))
}
