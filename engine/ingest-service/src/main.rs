//! Metric Event Ingestion Service
//!
//! Accepts metric events over HTTP, aggregates them in batches into
//! Postgres, and drains in-flight batches on SIGINT/SIGTERM.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{error, info};

use ingest_service::{
    graceful_shutdown, initialize_logging, load_configuration, routes, setup_signal_handlers,
    ServiceState,
};

#[derive(Parser, Debug)]
#[command(name = "metrics-ingest", version, about = "Batched metric event ingestion service")]
struct Args {
    /// Configuration file (TOML, YAML or JSON)
    #[arg(short, long, env = "INGEST_CONFIG")]
    config: Option<PathBuf>,

    /// Override the HTTP listen port
    #[arg(short, long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let args = Args::parse();

    // Load configuration
    let mut config =
        load_configuration(args.config.as_deref()).context("Failed to load configuration")?;
    if let Some(port) = args.port {
        config.http.port = port;
    }

    // Initialize logging; the guard flushes the log file on drop
    let _log_guard = initialize_logging(&config.logging)?;

    info!("Starting Metric Ingest Service v{}", env!("CARGO_PKG_VERSION"));

    let addr = config.http.socket_addr()?;
    let retry_after_secs = config.http.retry_after_secs;

    // Create service state
    let service_state = Arc::new(ServiceState::connect(config).await?);
    info!("Service state initialized");

    // Setup signal handlers for graceful shutdown
    let mut shutdown_signal = setup_signal_handlers()?;
    info!("Signal handlers configured");

    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let (bound_addr, server) = warp::serve(routes(service_state.batcher.clone(), retry_after_secs))
        .try_bind_with_graceful_shutdown(addr, async move {
            let _ = stop_rx.await;
        })
        .with_context(|| format!("Failed to bind HTTP listener on {}", addr))?;

    let server_handle = tokio::spawn(server);
    info!("Listening on http://{}. Press Ctrl+C to shutdown gracefully.", bound_addr);

    // Wait for shutdown signal
    match shutdown_signal.recv().await {
        Some(signal) => info!("{} received. Initiating graceful shutdown...", signal),
        None => error!("Signal handlers exited unexpectedly. Shutting down..."),
    }

    // Stop accepting connections, then drain the pipeline
    let _ = stop_tx.send(());
    graceful_shutdown(service_state, server_handle).await?;

    info!("Metric Ingest Service shutdown complete");
    Ok(())
}
