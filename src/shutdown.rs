use std::sync::Arc;
use std::time::Duration;

use tokio::signal;

use crate::server::AppState;

/// How long cancelled runs get to reach their next poll boundary.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Wait for a shutdown signal (SIGINT or SIGTERM).
pub async fn wait_for_shutdown() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
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
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown...");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown...");
        }
    }
}

/// Perform graceful shutdown: cancel in-flight runs and close store pools.
pub async fn graceful_shutdown(state: &Arc<AppState>) {
    tracing::info!("Starting graceful shutdown...");

    let in_flight = state.get_in_flight_entities().await;
    let dropped = state.task_queue.read().await.pending();

    if in_flight.is_empty() {
        tracing::info!(dropped, "No in-flight runs to cancel");
    } else {
        tracing::info!(
            count = in_flight.len(),
            entities = ?in_flight,
            dropped,
            "Cancelling in-flight runs"
        );
    }

    // Child tokens of every run fire with this one.
    state.shutdown.cancel();

    let drained = tokio::time::timeout(DRAIN_TIMEOUT, async {
        while !state.get_in_flight_entities().await.is_empty() {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    })
    .await;
    if drained.is_err() {
        tracing::warn!(
            remaining = ?state.get_in_flight_entities().await,
            "Runs still executing after drain timeout"
        );
    }

    state.engine.close().await;

    tracing::info!("Graceful shutdown complete");
}
