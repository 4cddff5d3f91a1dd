//! Database connection pool management.

use crate::config::DatabaseConfig;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::time::Duration;

/// Type alias for the PostgreSQL connection pool.
pub type DbPool = PgPool;

/// Create the connection pool shared by the store and the version source.
///
/// Connections are opened eagerly so a misconfigured database fails startup.
pub async fn create_pool(config: &DatabaseConfig) -> Result<DbPool, sqlx::Error> {
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(Duration::from_secs(config.acquire_timeout))
        .connect_with(config.connect_options()?)
        .await?;

    tracing::info!(
        target = %config.target(),
        max_connections = config.max_connections,
        "Orchestrator database pool created"
    );

    Ok(pool)
}
