//! Small synchronization helpers shared by every stage.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Locks a mutex, recovering the guard if a previous holder panicked.
///
/// A subscriber callback that panics must not wedge the whole chain.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Work-in-progress counter used to serialize drain loops.
///
/// The caller that moves the counter from zero owns the drain; everyone else
/// only records that more work is pending. The owner keeps looping until
/// [`Wip::leave`] reports nothing was missed.
#[derive(Debug, Default)]
pub(crate) struct Wip(AtomicUsize);

impl Wip {
    pub(crate) const fn new() -> Self {
        Self(AtomicUsize::new(0))
    }

    /// Registers pending work. Returns true if the caller now owns the drain.
    pub(crate) fn enter(&self) -> bool {
        self.0.fetch_add(1, Ordering::AcqRel) == 0
    }

    /// Acknowledges `missed` units of work; returns how many arrived meanwhile.
    pub(crate) fn leave(&self, missed: usize) -> usize {
        self.0.fetch_sub(missed, Ordering::AcqRel) - missed
    }
}
