//! Server initialization
//!
//! Wires the engine (manager, broadcaster, hub), serves HTTP and WebSocket
//! traffic and runs the shutdown sequence.

use anyhow::{Context, Result};
use axum::{routing::get, Extension, Router};
use marketflow_core::{
    ConnectionHub, EventBus, ExecutorRegistry, OperationManager, SnapshotSource,
    StatusBroadcaster,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};

use super::config::AppConfig;
use super::loader::load_config;
use super::validation::validate;
use crate::api::api_router;
use crate::cli::ServeArgs;
use crate::pipeline::register_stages;
use crate::websocket::websocket_router;

/// Time allowed for running operations to reach a terminal state on shutdown
const OPERATION_STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Run the server until a shutdown signal arrives
pub async fn run(args: ServeArgs) -> Result<()> {
    info!("Starting MarketFlow v{}", env!("CARGO_PKG_VERSION"));

    let mut config: AppConfig = load_config()?;
    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    validate(&config).context("Invalid configuration")?;

    // Engine
    let (bus, events) = EventBus::channel();
    let mut executors = ExecutorRegistry::new();
    register_stages(&mut executors, &config.pipeline);
    info!(step_types = ?executors.step_types(), "Step executors registered");
    let manager = Arc::new(OperationManager::with_config(
        executors,
        bus,
        config.engine.clone(),
    ));

    let (hub, commands) = ConnectionHub::new(config.hub.clone());
    let broadcaster_shutdown = CancellationToken::new();
    let snapshots: Arc<dyn SnapshotSource> = manager.clone();
    let broadcaster = StatusBroadcaster::new(hub.clone(), snapshots);
    let broadcaster_task = tokio::spawn(broadcaster.run(
        events,
        commands,
        broadcaster_shutdown.clone(),
    ));

    let app = Router::new()
        .merge(api_router())
        .merge(websocket_router())
        .route("/", get(|| async { "MarketFlow operation orchestrator" }))
        .layer(Extension(manager.clone()))
        .layer(Extension(hub.clone()))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .context("Invalid server address")?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;
    info!("HTTP server listening on http://{}", addr);
    info!("Operation stream at ws://{}/ws/operations", addr);

    let shutdown = {
        let manager = manager.clone();
        let hub = hub.clone();
        async move {
            wait_for_shutdown_signal().await;
            stop_engine(&manager, &hub, broadcaster_shutdown, broadcaster_task).await;
        }
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .context("HTTP server error")?;

    info!("MarketFlow shutdown complete");
    Ok(())
}

/// Stop operations, flush their final events to clients, then close every
/// connection gracefully.
async fn stop_engine(
    manager: &OperationManager,
    hub: &ConnectionHub,
    broadcaster_shutdown: CancellationToken,
    broadcaster_task: tokio::task::JoinHandle<()>,
) {
    manager.shutdown().await;

    let settled = tokio::time::timeout(OPERATION_STOP_TIMEOUT, async {
        while manager.active_count().await > 0 {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await;
    if settled.is_err() {
        let active = manager.active_count().await;
        warn!(active = active, "Operations still running at shutdown");
    }

    broadcaster_shutdown.cancel();
    match tokio::time::timeout(Duration::from_secs(5), broadcaster_task).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("Status broadcaster task error: {}", e),
        Err(_) => warn!("Status broadcaster shutdown timeout"),
    }

    hub.shutdown().await;
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
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
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
