use anyhow::{Context, Result};
use axum::Router;
use std::{fs, io::ErrorKind, path::Path};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

mod config;
mod errors;
mod handlers;
mod models;
mod routes;
mod services;
mod state;
mod storage;

use config::{AppConfig, RunMode};
use services::coordinator::Coordinator;
use state::AppState;
use storage::{disk::DiskBlobStore, sqlite::SqliteMetadataStore};

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + run mode ---
    let (cfg, mode) = AppConfig::from_env_and_args()?;

    tracing::info!("Starting bucket-store ({:?}) with config: {:?}", mode, cfg);

    // --- Ensure storage directory exists ---
    if !Path::new(&cfg.storage_dir).exists() {
        fs::create_dir_all(&cfg.storage_dir)?;
        tracing::info!("Created storage directory at {}", cfg.storage_dir);
    }

    // --- Initialize SQLite connection ---
    let db_url = &cfg.database_url;
    let db_path = db_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .trim_start_matches("file:");
    tracing::debug!("Interpreted SQLite path => {}", db_path);

    // Create parent directory if needed
    if let Some(parent) = Path::new(db_path).parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)?;
            tracing::info!("Created missing directory {:?}", parent);
        }
    }

    let pool = storage::sqlite::connect(db_url, 5)
        .await
        .with_context(|| format!("connecting to {}", db_url))?;

    let coordinator = Coordinator::new(
        SqliteMetadataStore::new(pool.clone()),
        DiskBlobStore::new(&cfg.storage_dir),
    )
    .with_default_size_quota(cfg.default_size_quota);

    match mode {
        RunMode::Migrate => {
            storage::sqlite::run_migrations(&pool).await?;
            tracing::info!("Database migration complete.");
            return Ok(());
        }
        RunMode::PurgeDeleted => {
            let report = coordinator.purge_deleted().await?;
            if report.failed > 0 {
                anyhow::bail!("{} soft-deleted files could not be purged", report.failed);
            }
            return Ok(());
        }
        RunMode::Serve => {}
    }

    // --- Build router ---
    let state = AppState::new(coordinator, cfg.request_timeout);
    let app: Router = routes::routes(cfg.max_upload_bytes).with_state(state);

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!("could not listen for shutdown signal: {}", err);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown requested, draining connections");
}
