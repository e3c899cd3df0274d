//! Graceful shutdown handling
//!
//! A [`ShutdownCoordinator`] hands out cloneable [`ShutdownSignal`]s to
//! background loops and flips them once, on SIGINT/SIGTERM or when the
//! daemon decides to stop.

use std::time::Duration;

use tokio::signal;
use tokio::sync::{watch, Mutex};
use tracing::{error, info, warn};

/// Shutdown signal that can be cloned and shared
#[derive(Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    /// Whether shutdown has been initiated
    pub fn is_shutdown(&self) -> bool {
        *self.rx.borrow()
    }

    /// Wait until shutdown is initiated; returns at once if it already was
    pub async fn wait(&self) {
        let mut rx = self.rx.clone();
        // A closed channel means the coordinator is gone; treat that as shutdown
        let _ = rx.wait_for(|stopped| *stopped).await;
    }
}

type Hook = Box<dyn FnOnce() + Send + 'static>;

/// Coordinates shutdown across background tasks
pub struct ShutdownCoordinator {
    tx: watch::Sender<bool>,
    hooks: Mutex<Vec<Hook>>,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self {
            tx,
            hooks: Mutex::new(Vec::new()),
        }
    }

    pub fn signal(&self) -> ShutdownSignal {
        ShutdownSignal {
            rx: self.tx.subscribe(),
        }
    }

    /// Run `hook` once shutdown starts
    pub async fn register_hook<F>(&self, hook: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.hooks.lock().await.push(Box::new(hook));
    }

    /// Initiate shutdown. Later calls are no-ops.
    pub async fn shutdown(&self) {
        if self.tx.send_replace(true) {
            return;
        }

        info!("initiating graceful shutdown");
        for hook in self.hooks.lock().await.drain(..) {
            hook();
        }
    }

    pub fn is_shutdown(&self) -> bool {
        *self.tx.borrow()
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

/// Completes on Ctrl+C or SIGTERM
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl+C");
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
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl+C"),
        _ = terminate => info!("received SIGTERM"),
    }
}

/// Wait for `task` to finish after shutdown, aborting it past `timeout`
pub async fn join_with_timeout(task: tokio::task::JoinHandle<()>, timeout: Duration) {
    let abort = task.abort_handle();
    match tokio::time::timeout(timeout, task).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(error = %e, "background task ended abnormally"),
        Err(_) => {
            warn!(timeout_ms = timeout.as_millis() as u64, "background task did not stop in time");
            abort.abort();
        }
    }
}
