use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Notify;

/// Shared stop flag handed into the pool and pipeline. Requesting a
/// stop is sticky and wakes every task parked on [`StopHandle::notified`].
///
/// A stop comes in two levels: a graceful stop lets the current work
/// drain and workers quit cleanly, a hard stop makes teardown kill the
/// worker subprocesses outright.
#[derive(Debug, Clone, Default)]
pub struct StopHandle {
    inner: Arc<StopInner>,
}

#[derive(Debug, Default)]
struct StopInner {
    stop_requested: AtomicBool,
    hard_stop_requested: AtomicBool,
    notify: Notify,
}

impl StopHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_stop(&self) {
        if !self.inner.stop_requested.swap(true, Ordering::SeqCst) {
            self.inner.notify.notify_waiters();
        }
    }

    /// Escalate to a hard stop; implies a stop request.
    pub fn request_hard_stop(&self) {
        self.inner.stop_requested.store(true, Ordering::SeqCst);
        if !self.inner.hard_stop_requested.swap(true, Ordering::SeqCst) {
            self.inner.notify.notify_waiters();
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stop_requested.load(Ordering::SeqCst)
    }

    pub fn is_hard_stopped(&self) -> bool {
        self.inner.hard_stop_requested.load(Ordering::SeqCst)
    }

    /// Resolves once a stop has been requested.
    pub async fn notified(&self) {
        let mut notified = std::pin::pin!(self.inner.notify.notified());
        // Register before the flag check so a concurrent request_stop
        // cannot slip between the check and the await.
        notified.as_mut().enable();
        if self.is_stopped() {
            return;
        }
        notified.await;
    }

    /// Resolves once a hard stop has been requested; a plain stop keeps
    /// this pending.
    pub async fn hard_notified(&self) {
        loop {
            let mut notified = std::pin::pin!(self.inner.notify.notified());
            notified.as_mut().enable();
            if self.is_hard_stopped() {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn hard_stop_implies_stop_and_wakes_waiters() {
        let stop = StopHandle::new();
        assert!(!stop.is_stopped());
        assert!(!stop.is_hard_stopped());

        stop.request_hard_stop();
        assert!(stop.is_stopped());
        assert!(stop.is_hard_stopped());
        stop.notified().await;
        stop.hard_notified().await;
    }

    #[tokio::test]
    async fn graceful_stop_keeps_hard_waiters_pending() {
        let stop = StopHandle::new();
        stop.request_stop();
        assert!(stop.is_stopped());
        assert!(!stop.is_hard_stopped());
        stop.notified().await;

        let waited =
            tokio::time::timeout(Duration::from_millis(50), stop.hard_notified()).await;
        assert!(waited.is_err(), "hard waiter must stay pending");
    }
}
