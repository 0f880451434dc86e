//! Container Watchdog - container resource and lifecycle monitor
//!
//! This binary polls the Docker Engine API for per-container resource usage,
//! flags readings that stray from each container's baseline, and records
//! container lifecycle events in a durable SQLite log.

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use watchdog_lib::{
    events::{EventRecorder, EventStore},
    health::{components, HealthRegistry},
    observability::{StructuredLogger, WatchdogMetrics},
    poller::PollLoopBuilder,
    runtime::{ContainerRuntime, DockerRuntime},
};

mod api;
mod config;
mod reports;

const WATCHDOG_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting container-watchdog");

    // Load configuration; invalid settings are fatal before anything starts
    let config = config::WatchdogConfig::load()?;
    let poll_config = config.poll_config()?;
    info!(
        node_name = %config.node_name,
        runtime = %config.runtime_endpoint,
        database = %config.database_path,
        "Watchdog configured"
    );

    // Initialize health registry
    let health_registry = HealthRegistry::new();
    health_registry.register(components::POLLER).await;
    health_registry.register(components::RUNTIME).await;
    health_registry.register(components::EVENT_STORE).await;
    health_registry.register(components::EVENT_RECORDER).await;

    let metrics = WatchdogMetrics::new();

    let logger = StructuredLogger::new(&config.node_name);
    logger.log_startup(WATCHDOG_VERSION);

    let store = EventStore::open(&config.database_path)
        .await
        .with_context(|| format!("Failed to open event store {}", config.database_path))?;

    let runtime: Arc<dyn ContainerRuntime> = Arc::new(
        DockerRuntime::new(&config.runtime_endpoint, config.fetch_timeout())
            .context("Failed to create Docker runtime client")?,
    );

    let (poll_loop, report_rx) = PollLoopBuilder::new()
        .runtime(runtime.clone())
        .config(poll_config)
        .metrics(metrics.clone())
        .logger(logger.clone())
        .health(health_registry.clone())
        .build()?;

    let shutdown = CancellationToken::new();

    let latest = api::LatestReports::default();
    let reports_handle = tokio::spawn(reports::track_latest(
        report_rx,
        latest.clone(),
        config.report_max_age(),
    ));

    let poll_handle = tokio::spawn(poll_loop.run(shutdown.clone()));

    let recorder = EventRecorder::new(store.clone(), config.recorder_config())
        .with_metrics(metrics.clone())
        .with_logger(logger.clone())
        .with_health(health_registry.clone());
    let recorder_handle =
        tokio::spawn(recorder.run_with_reconnect(runtime.clone(), shutdown.clone()));

    // Create shared application state
    let app_state = Arc::new(api::AppState::new(
        health_registry.clone(),
        store.clone(),
        latest,
    ));

    // Mark watchdog as ready after initialization
    health_registry.set_ready(true).await;

    // Start health, metrics and events server
    let api_handle = tokio::spawn(api::serve(config.api_port, app_state, shutdown.clone()));

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    logger.log_shutdown("SIGINT received");
    health_registry.set_ready(false).await;
    shutdown.cancel();

    if let Err(e) = poll_handle.await {
        warn!(error = %e, "Poll loop task failed");
    }
    match recorder_handle.await {
        Ok(stats) => info!(
            recorded = stats.recorded,
            filtered = stats.filtered,
            dropped = stats.dropped,
            pending = stats.pending,
            "Lifecycle event recorder stopped"
        ),
        Err(e) => warn!(error = %e, "Event recorder task failed"),
    }
    if let Err(e) = reports_handle.await {
        warn!(error = %e, "Report tracker task failed");
    }
    match api_handle.await {
        Ok(Err(e)) => warn!(error = %e, "API server exited with error"),
        Err(e) => warn!(error = %e, "API server task failed"),
        Ok(Ok(())) => {}
    }

    store.close().await;
    info!("Shutting down");

    Ok(())
}
