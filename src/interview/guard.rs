//! Exactly-once latches for stage transitions and the final archival step.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use super::stage::StageBoundary;

/// Result of a commit attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    Won,
    Lost,
}

impl CommitOutcome {
    pub fn is_won(&self) -> bool {
        matches!(self, Self::Won)
    }
}

/// A single-acquisition latch. The first `try_acquire` wins; every later
/// call loses.
#[derive(Debug, Default)]
pub struct OneShot {
    fired: AtomicBool,
}

impl OneShot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_acquire(&self) -> bool {
        self.fired
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// One latch per stage boundary. A latch is opened when its source stage is
/// entered and consumed by the first successful commit. There is no priority
/// between trigger kinds: the first caller to reach the latch wins.
#[derive(Debug, Default)]
pub struct TransitionGuard {
    latches: Mutex<HashMap<StageBoundary, Arc<OneShot>>>,
}

impl TransitionGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the latch for `boundary`. A consumed latch is never reopened.
    pub fn open(&self, boundary: StageBoundary) {
        let mut latches = self.latches.lock().unwrap_or_else(PoisonError::into_inner);
        latches.entry(boundary).or_default();
    }

    /// Attempt to commit the transition across `boundary`.
    ///
    /// Returns `Lost` if the latch was already consumed or was never opened
    /// (a request for a boundary the session has not reached).
    pub fn try_commit(&self, boundary: StageBoundary) -> CommitOutcome {
        let latch = {
            let latches = self.latches.lock().unwrap_or_else(PoisonError::into_inner);
            latches.get(&boundary).cloned()
        };
        match latch {
            Some(latch) if latch.try_acquire() => CommitOutcome::Won,
            _ => CommitOutcome::Lost,
        }
    }
}
