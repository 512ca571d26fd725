//! The receiver's single-flight flag.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Set while an acquisition owns the receiver.
///
/// Only the scheduler acquires it. Acquisition hands back a [`BusyGuard`] that
/// clears the flag when dropped, so every exit path of a worker releases it.
#[derive(Debug, Clone, Default)]
pub struct BusyFlag {
    flag: Arc<AtomicBool>,
}

impl BusyFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the flag if it is clear. `None` means another acquisition holds it.
    pub fn try_acquire(&self) -> Option<BusyGuard> {
        self.flag
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| BusyGuard {
                flag: self.flag.clone(),
            })
    }

    pub fn is_busy(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    /// Read-only view for code that must never set the flag.
    pub fn observer(&self) -> BusyObserver {
        BusyObserver {
            flag: self.flag.clone(),
        }
    }
}

/// Ownership of the receiver. Dropping it clears the flag.
#[derive(Debug)]
pub struct BusyGuard {
    flag: Arc<AtomicBool>,
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

/// "Is a recording in progress", and nothing else.
#[derive(Debug, Clone)]
pub struct BusyObserver {
    flag: Arc<AtomicBool>,
}

impl BusyObserver {
    pub fn is_busy(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}
