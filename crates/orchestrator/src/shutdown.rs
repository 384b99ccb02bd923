use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

/// Signals graceful shutdown across the orchestrator's main loop. Cloning
/// shares the same underlying flag, so a signal handler task and the main
/// loop both see the same state. Triggering twice is a no-op — SIGINT
/// followed by SIGTERM (or a repeated SIGINT) must not re-run the shutdown
/// sequence.
#[derive(Clone)]
pub struct ShutdownController {
    requested: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl ShutdownController {
    pub fn new() -> Self {
        Self { requested: Arc::new(AtomicBool::new(false)), notify: Arc::new(Notify::new()) }
    }

    /// Request shutdown. Returns `true` if this call is the one that took
    /// effect, `false` if shutdown was already requested.
    pub fn trigger(&self) -> bool {
        let first = self.requested.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst).is_ok();
        if first {
            self.notify.notify_waiters();
        }
        first
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    /// Resolves once `trigger` has been called. Safe to await repeatedly
    /// from a `select!` loop body.
    pub async fn triggered(&self) {
        if self.is_requested() {
            return;
        }
        self.notify.notified().await;
    }
}

impl Default for ShutdownController {
    fn default() -> Self {
        Self::new()
    }
}

/// Waits for SIGINT or SIGTERM and triggers `controller`. Spawn this once
/// at startup; it exits after the first signal.
pub async fn wait_for_signal(controller: ShutdownController) {
    let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
        Ok(s) => s,
        Err(_) => {
            // Platforms without SIGTERM (tests, some sandboxes): fall back
            // to Ctrl-C only.
            let _ = tokio::signal::ctrl_c().await;
            controller.trigger();
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
    controller.trigger();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_trigger_is_a_no_op() {
        let controller = ShutdownController::new();
        assert!(controller.trigger());
        assert!(!controller.trigger());
        assert!(controller.is_requested());
    }

    #[tokio::test]
    async fn triggered_resolves_immediately_once_requested() {
        let controller = ShutdownController::new();
        controller.trigger();
        tokio::time::timeout(std::time::Duration::from_millis(50), controller.triggered())
            .await
            .expect("triggered() should resolve without waiting once already requested");
    }
}
