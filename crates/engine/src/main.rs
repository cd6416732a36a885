//! Decision engine - carbon-aware traffic scheduling service
//!
//! Serves the scheduling API consumed by the cluster reconciler and the
//! traffic router, and a Prometheus scrape endpoint on a separate port.
//! Sessions are created on the first config push per (namespace, name).

use std::sync::Arc;

use anyhow::{Context, Result};
use scheduler_lib::{EngineMetrics, SchedulerRegistry};
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use url::Url;

mod api;
mod config;

const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    let settings = config::EngineSettings::load()?;

    // RUST_LOG wins over the LOGLEVEL setting.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(settings.loglevel.to_lowercase()));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json())
        .init();

    info!(version = ENGINE_VERSION, "Starting decision-engine");

    let carbon_api_url = match settings.carbon_api_url.as_deref() {
        Some(raw) => Some(Url::parse(raw).context("invalid CARBON_API_URL")?),
        None => None,
    };

    let metrics = EngineMetrics::new();
    let registry = Arc::new(SchedulerRegistry::new(
        settings.scheduler_config(),
        carbon_api_url,
        metrics,
    ));

    let app_state = Arc::new(api::AppState::new(
        registry,
        settings.default_schedule_namespace.clone(),
        settings.default_schedule_name.clone(),
    ));

    // Bind both listeners up front: failing to bind is fatal.
    let api_listener = TcpListener::bind(("0.0.0.0", settings.api_port))
        .await
        .with_context(|| format!("failed to bind API port {}", settings.api_port))?;
    let metrics_listener = TcpListener::bind(("0.0.0.0", settings.metrics_port))
        .await
        .with_context(|| format!("failed to bind metrics port {}", settings.metrics_port))?;

    tokio::spawn(api::serve_metrics(metrics_listener));
    tokio::spawn(api::serve(api_listener, app_state));

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");

    Ok(())
}
