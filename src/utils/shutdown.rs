//! Cooperative shutdown signal shared by all background tasks.
//!
//! Clones share the same underlying state: cancelling any clone wakes every
//! waiter. Cancellation is one-way and idempotent.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

#[derive(Debug, Clone, Default)]
pub struct Shutdown {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    closing: AtomicBool,
    notify: Notify,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal shutdown to all waiters. Safe to call more than once.
    pub fn cancel(&self) {
        self.inner.closing.store(true, Ordering::Release);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.closing.load(Ordering::Acquire)
    }

    /// Wait until shutdown is signalled. Returns immediately if it already was.
    pub async fn wait(&self) {
        let notified = self.inner.notify.notified();
        tokio::pin!(notified);
        // Register before the flag check, so a cancel() racing in between
        // still wakes this waiter.
        notified.as_mut().enable();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }
}
