//! Signal handling.
//!
//! A SIGINT or SIGTERM flips a watch flag; `main` selects on it to drop the
//! running batch, which stops its listeners and closes its connection.

use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};

/// Broadcasts a one-way "cancel the batch" flag.
pub struct ShutdownHandler {
    sender: watch::Sender<bool>,
}

impl ShutdownHandler {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(false);
        Self { sender }
    }

    /// Receiver whose `changed()` resolves once cancellation is requested.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.sender.subscribe()
    }

    pub fn trigger(&self) {
        self.sender.send_replace(true);
    }

    /// Wait for SIGINT or SIGTERM, then trigger.
    ///
    /// A handler that fails to install is logged and its signal never fires.
    pub async fn wait_for_signal(&self) {
        let ctrl_c = async {
            if let Err(e) = signal::ctrl_c().await {
                error!(error = %e, "Failed to install Ctrl+C handler");
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut stream) => {
                    stream.recv().await;
                }
                Err(e) => {
                    error!(error = %e, "Failed to install SIGTERM handler");
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        let name = tokio::select! {
            _ = ctrl_c => "SIGINT",
            _ = terminate => "SIGTERM",
        };
        info!(signal = name, "Cancelling batch");

        self.trigger();
    }
}

impl Default for ShutdownHandler {
    fn default() -> Self {
        Self::new()
    }
}
