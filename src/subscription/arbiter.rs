//! Subscription arbitration.
//!
//! Stages that switch to a new upstream mid-stream (error recovery) hand
//! their downstream a single, stable subscription while the actual upstream
//! changes underneath. The arbiter remembers outstanding demand so a
//! replacement upstream is asked for exactly what the previous one still owed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use crate::demand::{to_request, validate_request, UNBOUNDED};
use crate::sync::lock;

use super::{Subscription, SubscriptionRef};

const UNBOUNDED_U64: u64 = UNBOUNDED as u64;

#[derive(Default)]
struct ArbiterState {
    current: Option<SubscriptionRef>,
    outstanding: u64,
}

/// Stable subscription over a replaceable upstream.
#[derive(Default)]
pub struct SubscriptionArbiter {
    state: Mutex<ArbiterState>,
    cancelled: AtomicBool,
}

impl SubscriptionArbiter {
    /// Creates an arbiter with no upstream and no outstanding demand.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Switches to `upstream` and asks it for whatever demand is still outstanding.
    pub fn set(&self, upstream: SubscriptionRef) {
        if self.is_cancelled() {
            upstream.cancel();
            return;
        }
        let outstanding = {
            let mut state = lock(&self.state);
            state.current = Some(upstream.clone());
            state.outstanding
        };
        if self.is_cancelled() {
            upstream.cancel();
            return;
        }
        if outstanding > 0 {
            upstream.request(to_request(outstanding));
        }
    }

    /// Adds already-validated demand and forwards it to the current upstream.
    pub fn add_request(&self, n: u64) {
        if self.is_cancelled() {
            return;
        }
        let current = {
            let mut state = lock(&self.state);
            if state.outstanding < UNBOUNDED_U64 {
                state.outstanding = state.outstanding.saturating_add(n).min(UNBOUNDED_U64);
            }
            state.current.clone()
        };
        if let Some(upstream) = current {
            upstream.request(to_request(n));
        }
    }

    /// Records one delivered item against outstanding demand.
    pub fn produced_one(&self) {
        let mut state = lock(&self.state);
        if state.outstanding > 0 && state.outstanding < UNBOUNDED_U64 {
            state.outstanding -= 1;
        }
    }

    /// Outstanding demand not yet satisfied by any upstream.
    #[must_use]
    pub fn outstanding(&self) -> u64 {
        lock(&self.state).outstanding
    }

    /// True once cancelled; every upstream set afterwards is cancelled on arrival.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

impl Subscription for SubscriptionArbiter {
    /// Valid demand is recorded and forwarded. Invalid demand is forwarded
    /// as-is so the current upstream fails the sequence with `IllegalDemand`.
    fn request(&self, n: i64) {
        match validate_request(n) {
            Ok(n) => self.add_request(n),
            Err(_) => {
                let current = lock(&self.state).current.clone();
                if let Some(upstream) = current {
                    upstream.request(n);
                }
            }
        }
    }

    /// Cancels the current upstream and every future one.
    fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        let current = lock(&self.state).current.take();
        if let Some(upstream) = current {
            upstream.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicI64;
    use std::sync::Arc;

    #[derive(Default)]
    struct Recording {
        requested: AtomicI64,
        cancelled: AtomicBool,
    }

    impl Subscription for Recording {
        fn request(&self, n: i64) {
            self.requested.fetch_add(n, Ordering::SeqCst);
        }

        fn cancel(&self) {
            self.cancelled.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_replacement_receives_outstanding_demand() {
        let arbiter = SubscriptionArbiter::new();
        let first = Arc::new(Recording::default());
        arbiter.set(first.clone());
        arbiter.add_request(5);
        assert_eq!(first.requested.load(Ordering::SeqCst), 5);

        arbiter.produced_one();
        arbiter.produced_one();

        let second = Arc::new(Recording::default());
        arbiter.set(second.clone());
        assert_eq!(second.requested.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_demand_before_upstream_is_replayed() {
        let arbiter = SubscriptionArbiter::new();
        arbiter.add_request(2);
        let up = Arc::new(Recording::default());
        arbiter.set(up.clone());
        assert_eq!(up.requested.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_cancel_propagates_and_sticks() {
        let arbiter = SubscriptionArbiter::new();
        let first = Arc::new(Recording::default());
        arbiter.set(first.clone());
        arbiter.cancel();
        assert!(first.cancelled.load(Ordering::SeqCst));

        let late = Arc::new(Recording::default());
        arbiter.set(late.clone());
        assert!(late.cancelled.load(Ordering::SeqCst));
        assert_eq!(late.requested.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_invalid_request_is_forwarded_raw() {
        let arbiter = SubscriptionArbiter::new();
        let up = Arc::new(Recording::default());
        arbiter.set(up.clone());
        arbiter.request(-1);
        assert_eq!(up.requested.load(Ordering::SeqCst), -1);
        assert_eq!(arbiter.outstanding(), 0);
    }

    #[test]
    fn test_unbounded_is_not_decremented() {
        let arbiter = SubscriptionArbiter::new();
        arbiter.add_request(u64::MAX);
        arbiter.produced_one();
        assert_eq!(arbiter.outstanding(), UNBOUNDED_U64);
    }
}
