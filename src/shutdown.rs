// src/shutdown.rs

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Process-wide stop flag. Set once, never reset.
#[derive(Debug, Clone, Default)]
pub struct Shutdown {
    token: CancellationToken,
    announced: Arc<AtomicBool>,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    /// Flip the stop flag. Safe to call any number of times from any task.
    pub fn request_stop(&self) {
        if !self.announced.swap(true, Ordering::SeqCst) {
            tracing::info!("stop requested, draining in-flight downloads");
        }
        self.token.cancel();
    }

    pub fn should_stop(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once a stop has been requested.
    pub async fn stopped(&self) {
        self.token.cancelled().await
    }
}

/// Listens for Ctrl-C (and SIGTERM on unix) and turns the first one into a stop request.
/// The listener only flips the token; all polling happens in the cooperating loops.
pub fn install_signal_handlers(shutdown: Shutdown) {
    tokio::spawn(async move {
        wait_for_signal().await;
        shutdown.request_stop();
    });
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(e) => {
            tracing::warn!("cannot listen for SIGTERM: {}", e);
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("received SIGINT");
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => tracing::info!("received SIGINT"),
        _ = term.recv() => tracing::info!("received SIGTERM"),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        tracing::info!("received Ctrl-C");
    }
}
