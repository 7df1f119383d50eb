//! lift manager binary.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use lift_manager::{
    api,
    brain::Brain,
    config::Settings,
    registry::Registry,
    state::{AppState, ServiceMetadata},
};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const WORKER_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Parser)]
#[command(name = "lift", version, about = "Fleet manager for lift workers")]
struct Args {
    /// Path to the JSON settings file.
    #[arg(short = 's', long = "settings", env = "LIFT_SETTINGS", default_value = "setting.json")]
    settings: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let settings = Settings::load(&args.settings)
        .with_context(|| format!("loading settings from {}", args.settings.display()))?;

    // Prefer RUST_LOG, fall back to the configured level
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| settings.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        service = %settings.service_name,
        version = %settings.service_version,
        "Starting lift manager"
    );
    info!(
        listen_addr = %settings.listen_addr,
        classes = settings.classes.len(),
        port_start = settings.port_start,
        port_capacity = settings.port_capacity,
        "Configuration loaded"
    );

    let registry = Arc::new(Registry::new());
    let brain = Brain::new(settings.brain_params(), Arc::clone(&registry))?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sweeper_handle = brain.spawn_sweeper(shutdown_rx.clone());

    let state = AppState::new(
        brain.clone(),
        ServiceMetadata {
            name: settings.service_name.clone(),
            version: settings.service_version.clone(),
        },
    );
    let app = api::create_router(state);

    let listener = tokio::net::TcpListener::bind(&settings.listen_addr).await?;
    info!(addr = %settings.listen_addr, "Listening for connections");

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let mut shutdown_rx = shutdown_rx;
                let _ = shutdown_rx.wait_for(|stop| *stop).await;
                info!("HTTP server shutting down");
            })
            .await
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = server_handle => {
            match result {
                Ok(Ok(())) => info!("Server exited normally"),
                Ok(Err(e)) => error!(error = %e, "Server error"),
                Err(e) => error!(error = %e, "Server task panicked"),
            }
        }
    }

    let _ = shutdown_tx.send(true);

    if let Err(e) = tokio::time::timeout(WORKER_DRAIN_TIMEOUT, sweeper_handle).await {
        warn!(error = %e, "Sweeper did not stop in time");
    }

    brain.shutdown_all();
    if brain.wait_until_empty(WORKER_DRAIN_TIMEOUT).await {
        info!("All workers reclaimed");
    }

    info!("lift manager shutdown complete");
    Ok(())
}
