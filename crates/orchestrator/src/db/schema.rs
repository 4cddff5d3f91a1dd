//! Schema DDL for the orchestration tables.
//!
//! Every statement is idempotent so initialisation can run on each deploy.

use crate::db::DbPool;
use crate::error::AppResult;

/// Tables created by [`init_schema`].
pub const TABLES: [&str; 7] = [
    "worker_nodes",
    "worker_locks",
    "versions",
    "execution_queue",
    "suspended_executions",
    "finished_branches",
    "execution_states",
];

const DDL: &[&str] = &[
    "CREATE SCHEMA IF NOT EXISTS orch",
    r#"
    CREATE TABLE IF NOT EXISTS orch.worker_nodes (
        id BIGSERIAL PRIMARY KEY,
        uuid TEXT NOT NULL UNIQUE,
        host_name TEXT NOT NULL,
        install_path TEXT NOT NULL,
        password TEXT NOT NULL,
        status TEXT NOT NULL,
        active BOOLEAN NOT NULL DEFAULT FALSE,
        ack_time TIMESTAMPTZ,
        ack_version BIGINT NOT NULL DEFAULT 0,
        worker_recovery_version TEXT NOT NULL,
        bulk_number TEXT,
        version TEXT NOT NULL DEFAULT '',
        groups TEXT[] NOT NULL,
        deleted BOOLEAN NOT NULL DEFAULT FALSE,
        CONSTRAINT worker_has_group CHECK (cardinality(groups) > 0)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS orch.worker_locks (
        uuid TEXT PRIMARY KEY
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS orch.versions (
        topic TEXT PRIMARY KEY,
        version BIGINT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS orch.execution_queue (
        id BIGSERIAL PRIMARY KEY,
        msg_id TEXT NOT NULL,
        payload BYTEA NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS orch.suspended_executions (
        id BIGSERIAL PRIMARY KEY,
        execution_id TEXT NOT NULL,
        split_id TEXT NOT NULL UNIQUE,
        number_of_branches INTEGER NOT NULL CHECK (number_of_branches >= 1),
        execution_object BYTEA NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS orch.finished_branches (
        id BIGSERIAL PRIMARY KEY,
        suspended_execution_id BIGINT NOT NULL
            REFERENCES orch.suspended_executions (id) ON DELETE CASCADE,
        execution_id TEXT NOT NULL,
        branch_id TEXT NOT NULL,
        split_id TEXT NOT NULL,
        branch_error TEXT,
        branch_contexts JSONB NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS finished_branches_parent_idx ON orch.finished_branches (suspended_execution_id)",
    r#"
    CREATE TABLE IF NOT EXISTS orch.execution_states (
        execution_id BIGINT NOT NULL,
        branch_id TEXT NOT NULL,
        status TEXT NOT NULL,
        execution_object BYTEA,
        updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        PRIMARY KEY (execution_id, branch_id)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS execution_states_status_idx ON orch.execution_states (status)",
];

/// Create the orchestration schema if it does not exist.
pub async fn init_schema(pool: &DbPool) -> AppResult<()> {
    let mut tx = pool.begin().await?;
    for statement in DDL {
        sqlx::query(statement).execute(&mut *tx).await?;
    }
    tx.commit().await?;

    tracing::info!(tables = TABLES.len(), "Orchestration schema initialised");
    Ok(())
}

/// Names of orchestration tables missing from the database.
pub async fn missing_tables(pool: &DbPool) -> AppResult<Vec<String>> {
    let existing: Vec<String> = sqlx::query_scalar(
        "SELECT table_name::text FROM information_schema.tables WHERE table_schema = 'orch'",
    )
    .fetch_all(pool)
    .await?;

    Ok(TABLES
        .iter()
        .filter(|t| !existing.iter().any(|e| e == *t))
        .map(|t| t.to_string())
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_table_has_ddl() {
        for table in TABLES {
            let qualified = format!("orch.{} (", table);
            assert!(
                DDL.iter().any(|s| s.contains(&qualified)),
                "no DDL for {}",
                table
            );
        }
    }
}
