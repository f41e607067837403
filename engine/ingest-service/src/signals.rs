//! Signal handling for graceful shutdown

use anyhow::{Context, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{error, info, warn};

use crate::service::ServiceState;

/// Listen for SIGINT and SIGTERM; the receiver yields the name of the first signal
pub fn setup_signal_handlers() -> Result<mpsc::Receiver<&'static str>> {
    let (signal_tx, signal_rx) = mpsc::channel(2);

    let ctrl_c_tx = signal_tx.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C signal: {}", e);
            return;
        }

        info!("Ctrl+C signal received");
        let _ = ctrl_c_tx.send("SIGINT").await;
    });

    #[cfg(unix)]
    {
        use signal_hook::consts::SIGTERM;

        let terminated = Arc::new(AtomicBool::new(false));
        signal_hook::flag::register(SIGTERM, terminated.clone())
            .context("Failed to register SIGTERM handler")?;

        tokio::spawn(async move {
            while !terminated.load(Ordering::Relaxed) {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            info!("SIGTERM signal received");
            let _ = signal_tx.send("SIGTERM").await;
        });
    }

    Ok(signal_rx)
}

/// Wait for the HTTP server to stop, then drain the batch pipeline
pub async fn graceful_shutdown(
    service_state: Arc<ServiceState>,
    server_handle: JoinHandle<()>,
) -> Result<()> {
    info!("Starting graceful shutdown...");

    let shutdown_timeout = service_state.config.service.shutdown_timeout();

    match timeout(shutdown_timeout, server_handle).await {
        Ok(Ok(())) => info!("HTTP server stopped gracefully"),
        Ok(Err(e)) => error!("HTTP server task failed: {}", e),
        Err(_) => warn!("HTTP server did not stop within timeout, continuing shutdown"),
    }

    // In-flight batches still commit; submitters get their results
    if timeout(shutdown_timeout, service_state.shutdown()).await.is_err() {
        warn!("Batch pipeline did not drain within timeout, forcing shutdown");
    }

    info!("Graceful shutdown complete");
    Ok(())
}
