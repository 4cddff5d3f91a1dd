//! Worker node queries.

use sqlx::PgConnection;

use crate::db::models::{WorkerFilter, WorkerNode, WorkerNodeRow, WorkerStatus};
use crate::error::{AppError, AppResult};

const WORKER_COLUMNS: &str = r#"
    id, uuid, host_name, install_path, password, status, active, ack_time,
    ack_version, worker_recovery_version, bulk_number, version, groups, deleted
"#;

/// Insert a worker and return its id.
pub async fn insert_worker(conn: &mut PgConnection, worker: &WorkerNode) -> AppResult<i64> {
    let row: (i64,) = sqlx::query_as(
        r#"
        INSERT INTO orch.worker_nodes (
            uuid, host_name, install_path, password, status, active, ack_time,
            ack_version, worker_recovery_version, bulk_number, version, groups, deleted
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
        RETURNING id
        "#,
    )
    .bind(&worker.uuid)
    .bind(&worker.host_name)
    .bind(&worker.install_path)
    .bind(&worker.password)
    .bind(worker.status.as_str())
    .bind(worker.active)
    .bind(worker.ack_time)
    .bind(worker.ack_version)
    .bind(&worker.worker_recovery_version)
    .bind(&worker.bulk_number)
    .bind(&worker.version)
    .bind(&worker.groups)
    .bind(worker.deleted)
    .fetch_one(conn)
    .await
    .map_err(|e| match e {
        sqlx::Error::Database(ref db) if db.is_unique_violation() => {
            AppError::AlreadyExists(format!("worker {}", worker.uuid))
        }
        other => AppError::Database(other),
    })?;

    Ok(row.0)
}

/// Get a worker by uuid.
pub async fn get_worker(
    conn: &mut PgConnection,
    uuid: &str,
    include_deleted: bool,
) -> AppResult<Option<WorkerNode>> {
    let row = sqlx::query_as::<_, WorkerNodeRow>(&format!(
        "SELECT {WORKER_COLUMNS} FROM orch.worker_nodes WHERE uuid = $1 AND ($2 OR NOT deleted)"
    ))
    .bind(uuid)
    .bind(include_deleted)
    .fetch_optional(conn)
    .await?;

    row.map(WorkerNode::try_from).transpose()
}

/// List workers matching a filter.
pub async fn list_workers(
    conn: &mut PgConnection,
    filter: &WorkerFilter,
) -> AppResult<Vec<WorkerNode>> {
    let rows = sqlx::query_as::<_, WorkerNodeRow>(&format!(
        r#"
        SELECT {WORKER_COLUMNS}
        FROM orch.worker_nodes
        WHERE ($1::BOOLEAN IS NULL OR deleted = $1)
          AND ($2::BOOLEAN IS NULL OR active = $2)
          AND ($3::TEXT IS NULL OR status = $3)
        ORDER BY id
        "#
    ))
    .bind(filter.deleted)
    .bind(filter.active)
    .bind(filter.status.map(|s| s.as_str()))
    .fetch_all(conn)
    .await?;

    rows.into_iter().map(WorkerNode::try_from).collect()
}

/// Write back every mutable attribute of a worker.
pub async fn update_worker(conn: &mut PgConnection, worker: &WorkerNode) -> AppResult<()> {
    let result = sqlx::query(
        r#"
        UPDATE orch.worker_nodes SET
            host_name = $2,
            install_path = $3,
            password = $4,
            status = $5,
            active = $6,
            ack_time = $7,
            ack_version = $8,
            worker_recovery_version = $9,
            bulk_number = $10,
            version = $11,
            groups = $12,
            deleted = $13
        WHERE uuid = $1
        "#,
    )
    .bind(&worker.uuid)
    .bind(&worker.host_name)
    .bind(&worker.install_path)
    .bind(&worker.password)
    .bind(worker.status.as_str())
    .bind(worker.active)
    .bind(worker.ack_time)
    .bind(worker.ack_version)
    .bind(&worker.worker_recovery_version)
    .bind(&worker.bulk_number)
    .bind(&worker.version)
    .bind(&worker.groups)
    .bind(worker.deleted)
    .execute(conn)
    .await?;

    if result.rows_affected() == 0 {
        return Err(AppError::NotFound(format!("worker {}", worker.uuid)));
    }

    Ok(())
}

/// Uuids of workers that stopped acknowledging recovery versions.
pub async fn list_non_responding(
    conn: &mut PgConnection,
    min_version: i64,
    excluded_status: WorkerStatus,
) -> AppResult<Vec<String>> {
    let uuids: Vec<String> = sqlx::query_scalar(
        r#"
        SELECT uuid FROM orch.worker_nodes
        WHERE ack_version < $1 AND status <> $2
        ORDER BY id
        "#,
    )
    .bind(min_version)
    .bind(excluded_status.as_str())
    .fetch_all(conn)
    .await?;

    Ok(uuids)
}

/// Distinct group names across all workers.
pub async fn list_groups(conn: &mut PgConnection, names: Option<&[String]>) -> AppResult<Vec<String>> {
    let groups: Vec<String> = sqlx::query_scalar(
        r#"
        SELECT DISTINCT g
        FROM orch.worker_nodes, UNNEST(groups) AS g
        WHERE $1::TEXT[] IS NULL OR g = ANY($1)
        ORDER BY g
        "#,
    )
    .bind(names)
    .fetch_all(conn)
    .await?;

    Ok(groups)
}
