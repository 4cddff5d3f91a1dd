//! Orchestrator Server
//!
//! Serves the worker registry, dispatch, split/join and cancellation API
//! over PostgreSQL, and runs the periodic join and recovery sweeps.

use axum::{
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use orchestrator_core::{
    config::{AppConfig, DatabaseConfig},
    db::create_pool,
    engine::JsonExecutionCodec,
    handlers,
    nats::QueueNotifier,
    scheduler,
    services::Orchestrator,
    state::AppState,
    store::{PgStore, PgVersionSource},
};

/// Initialize tracing/logging.
fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,orchestrator_core=debug,tower_http=debug".into());
    let registry = tracing_subscriber::registry().with(filter);

    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Build the application router with all routes.
fn build_router(state: AppState) -> Router {
    // CORS configuration - allow all origins for development
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let health_routes = Router::new()
        .route("/health", get(handlers::health_check))
        .route("/api/health", get(handlers::api_health));

    let worker_routes = Router::new()
        .route(
            "/api/workers",
            post(handlers::workers::create).get(handlers::workers::list),
        )
        .route(
            "/api/workers/non-responding",
            get(handlers::workers::non_responding),
        )
        .route(
            "/api/workers/{uuid}",
            get(handlers::workers::get).delete(handlers::workers::delete),
        )
        .route("/api/workers/{uuid}/up", post(handlers::workers::up))
        .route(
            "/api/workers/{uuid}/keep-alive",
            post(handlers::workers::keep_alive),
        )
        .route(
            "/api/workers/{uuid}/activate",
            post(handlers::workers::activate),
        )
        .route(
            "/api/workers/{uuid}/deactivate",
            post(handlers::workers::deactivate),
        )
        .route(
            "/api/workers/{uuid}/groups",
            get(handlers::workers::get_groups).put(handlers::workers::update_groups),
        )
        .route(
            "/api/workers/{uuid}/groups/{group}",
            post(handlers::workers::add_group).delete(handlers::workers::remove_group),
        )
        .route("/api/worker-groups", get(handlers::workers::list_groups))
        .route(
            "/api/worker-groups/available",
            get(handlers::workers::available_groups),
        );

    let dispatch_routes = Router::new()
        .route(
            "/api/workers/{uuid}/dispatch",
            post(handlers::dispatch::dispatch),
        )
        .route("/api/branches/finished", post(handlers::dispatch::end_branch))
        .route("/api/splits/join", post(handlers::dispatch::join));

    let execution_routes = Router::new()
        .route(
            "/api/executions/canceled",
            get(handlers::executions::list_canceled),
        )
        .route(
            "/api/executions/{execution_id}/cancel",
            post(handlers::executions::cancel),
        )
        .route(
            "/api/executions/{execution_id}/cancellation-check",
            get(handlers::executions::cancellation_check),
        );

    let database_routes = Router::new()
        .route("/api/db/init", post(handlers::database::init_database))
        .route(
            "/api/db/validate",
            get(handlers::database::validate_database),
        );

    Router::new()
        .merge(health_routes)
        .merge(worker_routes)
        .merge(dispatch_routes)
        .merge(execution_routes)
        .merge(database_routes)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}

/// Connect to NATS and set up the notifier if configured.
async fn connect_notifier(config: &AppConfig) -> Option<QueueNotifier> {
    let Some(ref nats_url) = config.nats_url else {
        tracing::info!("NATS not configured, running without queue notifications");
        return None;
    };

    let client = match async_nats::connect(nats_url).await {
        Ok(client) => {
            tracing::info!(url = %nats_url, "Connected to NATS");
            client
        }
        Err(e) => {
            tracing::warn!(error = %e, url = %nats_url, "Failed to connect to NATS, continuing without it");
            return None;
        }
    };

    match QueueNotifier::new(Arc::new(client), None, None).await {
        Ok(notifier) => Some(notifier),
        Err(e) => {
            tracing::warn!(error = %e, "Failed to set up NATS stream, continuing without it");
            None
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if present
    dotenvy::dotenv().ok();

    let app_config = AppConfig::from_env();
    init_tracing(app_config.as_ref().map(|c| c.log_json).unwrap_or(false));

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting orchestrator"
    );

    let app_config = app_config.unwrap_or_else(|e| {
        tracing::warn!(error = %e, "Failed to load app config, using defaults");
        AppConfig::default()
    });

    let db_config = DatabaseConfig::from_env().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "Failed to load database config, using defaults");
        DatabaseConfig::default()
    });

    tracing::info!(
        host = %app_config.host,
        port = app_config.port,
        server_name = %app_config.server_name,
        max_version_gap_allowed = app_config.max_version_gap_allowed,
        split_join_bulk_size = app_config.split_join_bulk_size,
        "Configuration loaded"
    );

    let db_pool = create_pool(&db_config).await?;
    let notifier = connect_notifier(&app_config).await;

    let orchestrator = Arc::new(Orchestrator::new(
        PgStore::new(db_pool.clone()),
        Arc::new(PgVersionSource::new(db_pool.clone())),
        Arc::new(JsonExecutionCodec),
        Vec::new(),
        &app_config.orchestrator(),
    ));

    let join_sweep = scheduler::spawn_join_sweep(
        orchestrator.clone(),
        Duration::from_millis(app_config.join_interval_ms),
        notifier.clone(),
    );
    let recovery_sweep = scheduler::spawn_recovery_sweep(
        orchestrator.clone(),
        Duration::from_secs(app_config.recovery_interval_secs),
    );

    let state = AppState::new(db_pool, app_config.clone(), orchestrator, notifier);
    let app = build_router(state);

    let addr: SocketAddr = app_config.bind_address().parse()?;
    let listener = TcpListener::bind(addr).await?;

    tracing::info!(address = %addr, "Server listening");

    // Run the server with graceful shutdown
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    join_sweep.abort();
    recovery_sweep.abort();
    tracing::info!("Server shutdown complete");

    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, starting graceful shutdown");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        }
    }
}
