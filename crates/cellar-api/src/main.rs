//! cellar-api - HTTP API server for cellar
//!
//! Wires the lifecycle-owned core (registry, engine, file stores), the
//! janitor, the pg-wire front-end, and the axum router, then serves until
//! SIGTERM/SIGINT.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cellar_api::state::AppState;
use cellar_core::Layout;
use cellar_engine::{Engine, SnapshotCodec};
use cellar_files::{FilesStore, ObjectStore};
use cellar_jobs::{Janitor, JanitorConfig};
use cellar_pgwire::PgServerConfig;
use cellar_registry::Registry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Initialize tracing with configurable output
    //
    // Environment variables:
    //   LOG_FORMAT  - "json" or "text" (default: "text")
    //   LOG_FILE    - path to log file (optional, enables file logging)
    //   RUST_LOG    - standard env filter (default: "cellar=debug,tower_http=info")
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "text".to_string());
    let log_file = std::env::var("LOG_FILE").ok();

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "cellar=debug,cellar_api=debug,tower_http=info".into());
    let registry_layer = tracing_subscriber::registry().with(env_filter);

    let _file_guard = if let Some(ref path) = log_file {
        let file_dir = std::path::Path::new(path)
            .parent()
            .unwrap_or(std::path::Path::new("."));
        let file_name = std::path::Path::new(path)
            .file_name()
            .and_then(|f| f.to_str())
            .unwrap_or("cellar-api.log");
        let file_appender = tracing_appender::rolling::daily(file_dir, file_name);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
        if log_format == "json" {
            registry_layer
                .with(tracing_subscriber::fmt::layer().json().with_writer(non_blocking))
                .init();
        } else {
            registry_layer
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(non_blocking),
                )
                .init();
        }
        Some(guard)
    } else if log_format == "json" {
        registry_layer
            .with(tracing_subscriber::fmt::layer().json())
            .init();
        None
    } else {
        registry_layer.with(tracing_subscriber::fmt::layer()).init();
        None
    };

    info!(
        log_format = %log_format,
        log_file = log_file.as_deref().unwrap_or("(stdout)"),
        "Logging initialized"
    );

    // Fatal startup configuration
    let data_dir: PathBuf = std::env::var("DATA_DIR")
        .context("DATA_DIR must be set")?
        .into();
    let admin_key = std::env::var("ADMIN_API_KEY").context("ADMIN_API_KEY must be set")?;

    let layout = Layout::new(&data_dir);
    Layout::ensure_dir(layout.root()).context("cannot create DATA_DIR")?;

    let host = std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(cellar_core::defaults::SERVER_PORT);
    let pg_port: u16 = std::env::var("PG_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(cellar_core::defaults::PG_PORT);
    let codec = SnapshotCodec::parse(
        &std::env::var("SNAPSHOT_CODEC")
            .unwrap_or_else(|_| cellar_core::defaults::SNAPSHOT_CODEC.to_string()),
    )
    .context("invalid SNAPSHOT_CODEC")?;

    let rate_limit_enabled: bool = std::env::var("RATE_LIMIT_ENABLED")
        .map(|v| v == "true" || v == "1")
        .unwrap_or(true);
    let rate_limit_requests: u64 = std::env::var("RATE_LIMIT_REQUESTS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(cellar_core::defaults::RATE_LIMIT_REQUESTS);
    info!(
        enabled = rate_limit_enabled,
        per_minute = rate_limit_requests,
        "Rate limiting configured"
    );

    // Open the metadata registry (fatal when the file cannot be opened or
    // carries a schema newer than this binary).
    info!(path = %layout.registry_path().display(), "Opening metadata registry...");
    let registry = Registry::open(&layout.registry_path())
        .await
        .context("cannot open metadata registry")?;
    info!("Registry ready");

    let engine = Engine::new(registry.clone(), layout.clone(), codec);
    let files = FilesStore::new(registry.clone(), layout.clone());
    let objects = ObjectStore::new(layout.clone());

    let state = AppState::new(
        engine.clone(),
        files.clone(),
        objects,
        admin_key,
        rate_limit_enabled.then_some(rate_limit_requests),
    );

    // Janitor
    let janitor_handle = Janitor::new(engine.clone(), files, JanitorConfig::from_env()).start();

    // PG-wire front-end
    let pg_bind: SocketAddr = format!("{host}:{pg_port}")
        .parse()
        .context("invalid pg-wire bind address")?;
    let pg_handle = cellar_pgwire::serve(engine.clone(), PgServerConfig::new(pg_bind))
        .await
        .context("cannot bind pg-wire listener")?;

    // HTTP
    let app = cellar_api::router(state);
    let bind: SocketAddr = format!("{host}:{port}")
        .parse()
        .context("invalid bind address")?;
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .context("cannot bind HTTP listener")?;
    info!(addr = %bind, pg_addr = %pg_bind, data_dir = %data_dir.display(), "cellar-api listening");

    let server = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal());
    if let Err(e) = server.await {
        error!(error = %e, "HTTP server failed");
    }

    info!("Shutting down...");
    pg_handle.shutdown().await;
    janitor_handle.shutdown().await;
    info!("Bye");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.ok();
    };
    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("SIGINT received"),
        _ = terminate => info!("SIGTERM received"),
    }
}
