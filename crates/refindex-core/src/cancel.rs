//! Cancellation of background index units.
//!
//! Each unit submitted to a backend queue receives its own
//! [`CancellationToken`], issued by the queue's [`CancelScope`]. Indexers poll
//! the token between entities and between documents. [`CancelScope::cancel_all`]
//! stops every unit issued so far and starts a new generation, so units
//! submitted afterwards run normally.
//!
//! Closing the manager does not cancel anything: queued units drain first.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Stop flag observed by one index unit.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// `Err` once cancelled; use with `?` at item boundaries.
    pub fn check(&self) -> Result<(), CancelledError> {
        if self.is_cancelled() {
            Err(CancelledError)
        } else {
            Ok(())
        }
    }
}

/// Issues tokens for one queue.
///
/// Every token handed out by [`issue`](Self::issue) belongs to the current
/// generation. Cancelling the generation flips all of them at once and
/// replaces it with a fresh one.
#[derive(Debug, Default)]
pub struct CancelScope {
    generation: Mutex<CancellationToken>,
}

impl CancelScope {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token for a unit about to be queued.
    pub fn issue(&self) -> CancellationToken {
        self.generation
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Cancel every token issued so far. Later calls to `issue` get a live
    /// token.
    pub fn cancel_all(&self) {
        let mut generation = self
            .generation
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        generation.cancel();
        *generation = CancellationToken::new();
    }
}

/// An index unit observed its token and stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CancelledError;

impl std::fmt::Display for CancelledError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "index unit was cancelled")
    }
}

impl std::error::Error for CancelledError {}

impl From<CancelledError> for crate::error::RefIndexError {
    fn from(_: CancelledError) -> Self {
        crate::error::RefIndexError::Cancelled
    }
}
