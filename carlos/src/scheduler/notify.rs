//! Out-of-band "re-scan candidates" signal.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Notify;

#[derive(Debug, Default)]
struct Inner {
    pending: AtomicBool,
    wake: Notify,
}

/// Single-slot dirty flag shared by producers (the HTTP layer, finished
/// workers) and the scheduler loop. Any number of signals between two polls
/// collapse into one.
#[derive(Debug, Clone, Default)]
pub struct RefreshSignal {
    inner: Arc<Inner>,
}

impl RefreshSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the candidate list stale and wake the loop. Never blocks.
    pub fn notify(&self) {
        self.inner.pending.store(true, Ordering::Release);
        self.inner.wake.notify_one();
    }

    /// Consume the pending signal, if any.
    pub fn take(&self) -> bool {
        self.inner.pending.swap(false, Ordering::AcqRel)
    }

    pub fn is_pending(&self) -> bool {
        self.inner.pending.load(Ordering::Acquire)
    }

    /// Resolve once a signal has been sent since the last wake-up.
    pub async fn notified(&self) {
        self.inner.wake.notified().await;
    }
}
