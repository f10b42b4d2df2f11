//! HTTP surface: the live event stream, history, run control and recovery.

pub mod api;

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};

use crate::config::ResolvedConfig;
use crate::core::{Orchestrator, RecoveryManager, RunRegistry};
use crate::stream::{self, EventGateway, EventPublisher, LagMonitor};

pub use api::{AppState, SharedState};

/// Everything a process needs to drive runs, wired from configuration
pub struct Services {
    pub orchestrator: Orchestrator,
    pub monitor: LagMonitor,
}

/// Connect the log store (when configured) and wire the run services.
pub fn build_services(config: &ResolvedConfig) -> Result<Services> {
    let store = match config.log_url.as_deref() {
        Some(url) => Some(
            stream::connect(url).with_context(|| format!("Failed to open log store '{}'", url))?,
        ),
        None => {
            warn!("No log store configured, event streaming is disabled");
            None
        }
    };

    let publisher = EventPublisher::new(store.clone(), config.publisher);
    let gateway = EventGateway::new(store.clone(), config.gateway);
    let monitor = LagMonitor::new(store, config.monitor);
    let recovery = RecoveryManager::new(config.runs_dir(), config.retention_days);

    let orchestrator = Orchestrator::new(
        config.step_registry(),
        publisher,
        gateway,
        Arc::new(RunRegistry::new()),
        recovery,
    )
    .with_limits(config.limits.clone())
    .with_retry(config.retry.clone());

    Ok(Services {
        orchestrator,
        monitor,
    })
}

/// Build the complete axum router
pub fn build_router(state: SharedState, dev_mode: bool) -> Router {
    let app = Router::new().merge(api::api_router()).with_state(state);

    if dev_mode {
        app.layer(CorsLayer::permissive())
    } else {
        app
    }
}

/// Start the server and block until shutdown
pub async fn start_server(config: &ResolvedConfig) -> Result<()> {
    let Services {
        orchestrator,
        monitor,
    } = build_services(config)?;

    match orchestrator
        .recovery()
        .announce_interrupted(orchestrator.publisher())
        .await
    {
        Ok(found) if !found.is_empty() => {
            info!(count = found.len(), "Announced interrupted runs");
        }
        Ok(_) => {}
        Err(e) => warn!(error = %e, "Failed to scan for interrupted runs"),
    }

    if !config.consumer_groups.is_empty() {
        match monitor.register_groups(&config.consumer_groups).await {
            Ok(()) => info!(groups = ?config.consumer_groups, "Registered consumer groups"),
            Err(e) => warn!(error = %e, "Failed to register consumer groups"),
        }
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let monitor_task = monitor.clone().spawn(shutdown_rx.clone());

    let state = Arc::new(AppState {
        orchestrator: orchestrator.clone(),
        monitor,
        shutdown: shutdown_rx,
    });
    let app = build_router(state, config.server.dev_mode);

    let listener = TcpListener::bind(config.server.bind.as_str())
        .await
        .with_context(|| format!("Failed to bind to {}", config.server.bind))?;

    info!(bind = %config.server.bind, "Chronicle server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown_tx))
        .await
        .context("Server error")?;

    let saved = orchestrator
        .recovery()
        .snapshot_all(orchestrator.registry())
        .await;
    if !saved.is_empty() {
        info!(count = saved.len(), "Saved snapshots for interrupted runs");
    }

    if let Err(e) = monitor_task.await {
        warn!(error = %e, "Lag monitor task ended abnormally");
    }

    info!("Server shut down");
    Ok(())
}

async fn shutdown_signal(shutdown: watch::Sender<bool>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to install Ctrl+C handler");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
    let _ = shutdown.send(true);
}
