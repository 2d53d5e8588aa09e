//! Graceful shutdown
//!
//! SIGINT/SIGTERM stop the accept loop, drain open connections for a
//! bounded time, and discard any open batch. Tasks observe shutdown
//! through a cloneable [`ShutdownSignal`].

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{info, warn};

/// Cloneable shutdown observer.
#[derive(Clone)]
pub struct ShutdownSignal {
    flag: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl ShutdownSignal {
    pub fn is_shutdown(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Resolve when shutdown is initiated (immediately if it already was).
    pub async fn wait(&self) {
        if self.is_shutdown() {
            return;
        }
        let notified = self.notify.notified();
        if self.is_shutdown() {
            return;
        }
        notified.await;
    }
}

/// Owns the shutdown state; held by the server bootstrap.
pub struct ShutdownCoordinator {
    flag: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            notify: Arc::new(Notify::new()),
        }
    }

    pub fn signal(&self) -> ShutdownSignal {
        ShutdownSignal {
            flag: self.flag.clone(),
            notify: self.notify.clone(),
        }
    }

    pub fn shutdown(&self) {
        if !self.flag.swap(true, Ordering::SeqCst) {
            info!("shutdown initiated");
            self.notify.notify_waiters();
        }
    }

    /// Trip the coordinator on SIGINT or SIGTERM.
    pub async fn listen_for_signals(&self) {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("failed to install SIGTERM handler");
            tokio::select! {
                _ = ctrl_c => info!("received SIGINT"),
                _ = sigterm.recv() => info!("received SIGTERM"),
            }
        }
        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
            info!("received interrupt");
        }

        self.shutdown();
    }
}

/// Counts live connections so shutdown can drain them.
#[derive(Default)]
pub struct ConnectionTracker {
    active: AtomicU64,
    total: AtomicU64,
}

impl ConnectionTracker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn track(self: &Arc<Self>) -> ConnectionGuard {
        self.active.fetch_add(1, Ordering::SeqCst);
        self.total.fetch_add(1, Ordering::SeqCst);
        ConnectionGuard {
            tracker: self.clone(),
        }
    }

    pub fn active_count(&self) -> u64 {
        self.active.load(Ordering::SeqCst)
    }

    /// Wait until every connection closed or `timeout` elapsed; returns
    /// whether the drain completed.
    pub async fn wait_for_drain(&self, timeout: Duration) -> bool {
        let start = std::time::Instant::now();
        while self.active_count() > 0 {
            if start.elapsed() > timeout {
                warn!(
                    active = self.active_count(),
                    "drain timeout, closing remaining connections"
                );
                return false;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        info!("all connections drained");
        true
    }
}

/// Decrements the active count on drop.
pub struct ConnectionGuard {
    tracker: Arc<ConnectionTracker>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.tracker.active.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn signal_wakes_waiters() {
        let coordinator = ShutdownCoordinator::new();
        let signal = coordinator.signal();

        let waiter = tokio::spawn(async move {
            signal.wait().await;
            true
        });

        coordinator.shutdown();
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn wait_after_shutdown_returns_immediately() {
        let coordinator = ShutdownCoordinator::new();
        coordinator.shutdown();
        coordinator.signal().wait().await;
    }

    #[tokio::test]
    async fn tracker_counts_guards() {
        let tracker = ConnectionTracker::new();
        assert_eq!(tracker.active_count(), 0);
        {
            let _a = tracker.track();
            let _b = tracker.track();
            assert_eq!(tracker.active_count(), 2);
        }
        assert_eq!(tracker.active_count(), 0);
        assert!(tracker.wait_for_drain(Duration::from_millis(10)).await);
    }
}
