//! Version topic queries.
//!
//! Versions are read and advanced outside the caller's transaction so a
//! recovery cycle is visible to every worker as soon as it starts.

use crate::db::DbPool;
use crate::error::AppResult;

/// Current value of a version topic, zero when never advanced.
pub async fn current_version(pool: &DbPool, topic: &str) -> AppResult<i64> {
    let version: Option<i64> =
        sqlx::query_scalar("SELECT version FROM orch.versions WHERE topic = $1")
            .bind(topic)
            .fetch_optional(pool)
            .await?;

    Ok(version.unwrap_or(0))
}

/// Advance a version topic and return the new value.
pub async fn increment_version(pool: &DbPool, topic: &str) -> AppResult<i64> {
    let version: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO orch.versions (topic, version) VALUES ($1, 1)
        ON CONFLICT (topic) DO UPDATE SET version = orch.versions.version + 1
        RETURNING version
        "#,
    )
    .bind(topic)
    .fetch_one(pool)
    .await?;

    Ok(version)
}
