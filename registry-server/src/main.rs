use anyhow::{Context, Result};
use hermes::config::HermesConfig;
use hermes::registry::HeartbeatMonitor;
use hermes_registry::{AppState, router};
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    hermes::logging::init(false);

    let config = HermesConfig::load_or_default(None).context("failed to load configuration")?;
    let state = AppState::from_config(&config)?;

    let monitor = HeartbeatMonitor::new(Arc::clone(&state.store), config.sweep_interval()).spawn();

    let addr = config.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(
        %addr,
        environment = %state.discovery.environment(),
        sources = ?state.catalog.source_names(),
        "hermes registry listening"
    );

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    monitor.shutdown().await;
    info!("hermes registry stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "failed to listen for shutdown signal");
    }
}
