//! Coordinated multi-axis operations.
//!
//! Both operations here share a pattern: pause the poller, take ownership of
//! a subset of axes, run a bounded state machine against the controller
//! client, and restart the poller whatever happened. Each observes a cancel
//! token at its natural boundaries (per-position move, dwell, per-leg poll).

pub mod conditioning;
pub mod slit_scan;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;

/// Cooperative cancellation for a running operation.
///
/// Cancelling sets the flag and wakes any dwell or retry sleep, so the
/// operation exits at its next boundary instead of finishing the wait.
#[derive(Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl CancelToken {
    /// A fresh, uncancelled token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation and wake any waiting sleep.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// Whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Sleep that a cancel cuts short. Returns `false` if cancelled either
    /// before or during the sleep.
    pub async fn sleep(&self, duration: Duration) -> bool {
        if self.is_cancelled() {
            return false;
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => !self.is_cancelled(),
            _ = self.notify.notified() => false,
        }
    }
}
