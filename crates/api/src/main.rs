use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use voxweave_api::config::{LogFormat, ServerConfig};
use voxweave_api::router::build_app_router;
use voxweave_api::state::AppState;
use voxweave_db::MemoryJobStore;
use voxweave_engine::HttpEngineClient;
use voxweave_events::{start_heartbeat, ProgressBroadcaster};
use voxweave_pipeline::TaskScheduler;

const DEFAULT_LOG_FILTER: &str =
    "voxweave_api=debug,voxweave_pipeline=debug,voxweave_events=info,tower_http=debug";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // --- Configuration ---
    let config = ServerConfig::from_env()?;

    // --- Tracing ---
    init_tracing(config.log_format);
    tracing::info!(
        host = %config.host,
        port = config.port,
        engine_url = %config.engine_url,
        "Loaded server configuration",
    );

    // --- Collaborators ---
    let store = Arc::new(MemoryJobStore::new());
    let engine = Arc::new(
        HttpEngineClient::new(config.engine_url.clone(), config.engine_timeout())
            .context("failed to build synthesis engine client")?,
    );

    // --- Broadcaster + heartbeat ---
    let broadcaster = Arc::new(ProgressBroadcaster::new(config.broadcaster_config()));
    let heartbeat_cancel = CancellationToken::new();
    let heartbeat_handle = start_heartbeat(Arc::clone(&broadcaster), heartbeat_cancel.clone());
    tracing::info!(
        interval_secs = config.heartbeat_interval_secs,
        idle_timeout_secs = config.idle_timeout_secs,
        "Observer heartbeat started",
    );

    // --- Scheduler ---
    let scheduler = TaskScheduler::new(
        store,
        engine.clone(),
        engine,
        Arc::clone(&broadcaster),
        config.scheduler_config(),
    );

    // --- App state ---
    let state = AppState {
        config: Arc::new(config.clone()),
        broadcaster: Arc::clone(&broadcaster),
        scheduler,
    };
    let app = build_app_router(state, &config);

    // --- Start server ---
    let host = config
        .host
        .parse()
        .with_context(|| format!("invalid HOST address {:?}", config.host))?;
    let addr = SocketAddr::new(host, config.port);
    tracing::info!(%addr, "Starting server");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind to {addr}"))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    // --- Post-shutdown cleanup ---
    tracing::info!("Server stopped accepting connections, cleaning up");

    heartbeat_cancel.cancel();
    let grace = Duration::from_secs(config.shutdown_timeout_secs);
    if tokio::time::timeout(grace, heartbeat_handle).await.is_err() {
        tracing::warn!("Heartbeat did not stop in time");
    }

    let observers = broadcaster.connection_count().await;
    tracing::info!(observers, "Closing remaining observer connections");
    broadcaster.shutdown_all().await;

    tracing::info!("Graceful shutdown complete");
    Ok(())
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| DEFAULT_LOG_FILTER.into());
    let registry = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl-C handler");
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
        () = ctrl_c => {
            tracing::info!("Received SIGINT (Ctrl-C), starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        }
    }
}
