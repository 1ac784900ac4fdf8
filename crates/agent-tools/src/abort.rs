// SPDX-License-Identifier: Apache-2.0
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A one-shot, idempotent, process-shared cancellation flag.
///
/// Cheap to clone (an `Arc` around a single atomic word) and safe to read
/// from any number of concurrent tasks — tool bodies, the turn loop, and the
/// tool-collection ticker all poll the same handle without taking a lock.
#[derive(Debug, Clone)]
pub struct AbortSignal {
    flag: Arc<AtomicBool>,
}

impl AbortSignal {
    /// Create a fresh, non-aborted signal.
    pub fn new() -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Mark the signal as aborted. Idempotent.
    pub fn abort(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Reset the signal to non-aborted.
    pub fn clear(&self) {
        self.flag.store(false, Ordering::SeqCst);
    }

    /// Non-blocking read of the current state.
    pub fn is_aborted(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

impl Default for AbortSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// `Option<&AbortSignal>` reads as `false` when absent — mirrors the source
/// contract's `aborted?(h)` accepting `nil`.
pub fn is_aborted(signal: Option<&AbortSignal>) -> bool {
    signal.map(AbortSignal::is_aborted).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_signal_is_not_aborted() {
        let sig = AbortSignal::new();
        assert!(!sig.is_aborted());
    }

    #[test]
    fn abort_is_observable_through_clones() {
        let sig = AbortSignal::new();
        let clone = sig.clone();
        clone.abort();
        assert!(sig.is_aborted());
    }

    #[test]
    fn abort_is_idempotent() {
        let sig = AbortSignal::new();
        sig.abort();
        sig.abort();
        assert!(sig.is_aborted());
    }

    #[test]
    fn clear_resets_to_non_aborted() {
        let sig = AbortSignal::new();
        sig.abort();
        sig.clear();
        assert!(!sig.is_aborted());
    }

    #[test]
    fn none_reads_as_not_aborted() {
        assert!(!is_aborted(None));
    }

    #[test]
    fn some_delegates_to_signal() {
        let sig = AbortSignal::new();
        sig.abort();
        assert!(is_aborted(Some(&sig)));
    }
}
