//! Siteline - analytics backend
//!
//! This library serves the dashboard's time-series endpoints. It handles:
//! - Adaptive week/month bucketing of a requested date range
//! - Fetching deal pipeline and profit/loss records from external APIs
//! - Stock vs flow aggregation with deterministic historical backfill
//! - SQLite snapshot caching and OAuth token persistence

pub mod api;
pub mod cache;
pub mod config;
pub mod db;
pub mod export;
pub mod metrics;
pub mod models;
pub mod periods;
pub mod service;
pub mod sources;

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing_subscriber::EnvFilter;

use config::{AppConfig, ConfigError};
use db::{Database, DbError};
use service::{AggregationService, AnalyticsError};

/// Failures that prevent the server from starting
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Failed to build aggregation service: {0}")]
    Service(#[from] AnalyticsError),

    #[error("Server I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// ============================================================================
// Application Setup
// ============================================================================

/// Install the tracing subscriber; `RUST_LOG` overrides the default `info`
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// Open the snapshot database, creating its directory when needed
pub fn open_database(config: &AppConfig) -> Result<Database, StartupError> {
    let db_path = config.database.resolved_path();
    tracing::info!("Database path: {:?}", db_path);

    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let database = Database::new(db_path.clone())?;
    database.initialize()?;
    tracing::info!("Database initialized successfully at {:?}", db_path);
    Ok(database)
}

/// Load configuration, build the service and serve HTTP until Ctrl-C
pub async fn run() -> Result<(), StartupError> {
    init_tracing();
    tracing::info!("Starting Siteline analytics backend");

    let config = AppConfig::load()?;
    let database = Arc::new(open_database(&config)?);
    let service = Arc::new(AggregationService::from_config(&config, database)?);

    let state = api::ApiState::new(
        service,
        Duration::from_secs(config.server.request_timeout_secs),
    );
    let app = api::router(state);

    let listener = tokio::net::TcpListener::bind(&config.server.bind_addr).await?;
    tracing::info!("Listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
}
