//! Process-level plumbing shared by the server and its signal handler.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::info;

// ============================================================================
// Graceful Shutdown
// ============================================================================

/// Shutdown signal shared by the HTTP server, the signal handler and tests.
pub struct ShutdownCoordinator {
    shutdown_requested: AtomicBool,
    notify: tokio::sync::Notify,
}

impl ShutdownCoordinator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown_requested.load(Ordering::SeqCst)
    }

    pub fn shutdown(&self) {
        if !self.shutdown_requested.swap(true, Ordering::SeqCst) {
            info!("Shutdown requested");
        }
        self.notify.notify_waiters();
    }

    pub async fn wait_for_shutdown(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_shutdown() {
                return;
            }
            notified.await;
        }
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self {
            shutdown_requested: AtomicBool::new(false),
            notify: tokio::sync::Notify::new(),
        }
    }
}
