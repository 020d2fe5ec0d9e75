use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{signal, time::Instant};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

/// Process-wide shutdown coordination.
///
/// Background loops select on [`ShutdownHandler::cancelled`] so a pending
/// sleep or long poll is interrupted as soon as shutdown starts. Request
/// handlers register themselves as pending so the binary can drain them
/// before exiting.
#[derive(Clone, Debug)]
pub struct ShutdownHandler {
    token:                         CancellationToken,
    n_requests_pending_completion: Arc<AtomicUsize>,
    drain_timeout:                 Duration,
}

impl ShutdownHandler {
    pub fn new(drain_timeout: Duration) -> Self {
        Self {
            token:                         CancellationToken::new(),
            n_requests_pending_completion: Arc::new(AtomicUsize::new(0)),
            drain_timeout,
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn trigger_manual_shutdown(&self) {
        self.token.cancel();
    }

    /// Resolves once shutdown has been triggered, manually or by a signal.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.token.cancelled()
    }

    pub async fn wait_for_shutdown_signal(&self) {
        let token = self.token.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            token.cancel();
            tracing::info!("Shutdown signal received.");
        });
    }

    pub fn increment_requests_pending_completion(&self) {
        self.n_requests_pending_completion
            .fetch_add(1, Ordering::SeqCst);
    }

    pub fn decrement_requests_pending_completion(&self) {
        self.n_requests_pending_completion
            .fetch_sub(1, Ordering::SeqCst);
    }

    pub fn requests_pending_completion(&self) -> usize {
        self.n_requests_pending_completion.load(Ordering::SeqCst)
    }

    /// Waits until every registered request finished, or the drain timeout
    /// elapsed. Returns whether the drain completed.
    pub async fn wait_for_pending_requests_completion(&self) -> bool {
        let check_interval = Duration::from_millis(100);
        let start = Instant::now();

        while self.requests_pending_completion() > 0 {
            if start.elapsed() >= self.drain_timeout {
                tracing::error!(
                    pending = self.requests_pending_completion(),
                    "Timed out waiting for pending requests to complete."
                );
                return false;
            }
            tokio::time::sleep(check_interval).await;
        }

        tracing::info!("Pending requests count reached zero.");
        true
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
        tracing::info!("Ctrl+C received.");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
        tracing::info!("SIGTERM received.");
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
