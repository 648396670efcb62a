//! Cancel the run on SIGINT / SIGTERM.

use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Cancel `token` when the process receives Ctrl+C or SIGTERM.
pub fn cancel_on_signal(token: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = async {
            if let Err(e) = signal::ctrl_c().await {
                warn!("Failed to install Ctrl+C handler: {}", e);
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut sig) => {
                    sig.recv().await;
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
                info!("Received SIGINT (Ctrl+C), cancelling run...");
            }
            _ = terminate => {
                info!("Received SIGTERM, cancelling run...");
            }
            _ = token.cancelled() => return,
        }

        eprintln!("Interrupted, waiting for running tasks to stop...");
        token.cancel();
    });
}
