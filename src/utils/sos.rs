//! Signal-of-Stop: cooperative cancellation for the protocol task.
//!
//! A cloneable token; cancelling any clone wakes every waiter. The
//! engine worker races its select loop against `wait()` and runs its
//! shutdown sequence (abort sessions, flush ABT frames) when it fires.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

#[derive(Debug, Clone, Default)]
pub struct SignalOfStop {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    stopped: AtomicBool,
    notify: Notify,
}

impl SignalOfStop {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal cancellation. Idempotent; wakes all current waiters.
    pub fn cancel(&self) {
        self.inner.stopped.store(true, Ordering::Release);
        self.inner.notify.notify_waiters();
    }

    pub fn cancelled(&self) -> bool {
        self.inner.stopped.load(Ordering::Acquire)
    }

    /// Complete once cancellation is signalled. Returns immediately if it
    /// already was.
    pub async fn wait(&self) {
        while !self.cancelled() {
            let notified = self.inner.notify.notified();
            if self.cancelled() {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_cancel_wakes_waiter() {
        let sos = SignalOfStop::new();
        let waiter = sos.clone();
        let handle = tokio::spawn(async move { waiter.wait().await });
        tokio::task::yield_now().await;
        sos.cancel();
        handle.await.unwrap();
        assert!(sos.cancelled());
    }

    #[tokio::test]
    async fn test_wait_after_cancel_returns_immediately() {
        let sos = SignalOfStop::new();
        sos.cancel();
        sos.wait().await;
    }
}
