//! Demand accounting (Reactive Streams `request(n)` model).
//!
//! A [`Demand`] is owned by one subscription. The consumer side adds to it via
//! `request(n)`; the producer side consumes one unit per delivered `OnNext`.
//! Demand saturates at [`UNBOUNDED`], after which it is never decremented.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{FluxError, FluxResult};

/// Request value meaning "no limit".
pub const UNBOUNDED: i64 = i64::MAX;

const UNBOUNDED_U64: u64 = UNBOUNDED as u64;

/// Validates a raw `request(n)` argument.
///
/// # Errors
/// `IllegalDemand` when `n <= 0`.
pub fn validate_request(n: i64) -> FluxResult<u64> {
    if n <= 0 {
        return Err(FluxError::IllegalDemand { requested: n });
    }
    Ok(n.unsigned_abs())
}

/// Converts an unsigned amount into a `request` argument, saturating at [`UNBOUNDED`].
#[must_use]
pub fn to_request(n: u64) -> i64 {
    i64::try_from(n).unwrap_or(UNBOUNDED)
}

/// Outstanding demand of a single subscription.
///
/// # Thread Safety
///
/// `add` may be called from any thread; `try_consume` uses a CAS loop so a
/// producer never takes more than was granted.
#[derive(Debug, Default)]
pub struct Demand {
    pending: AtomicU64,
}

impl Demand {
    /// Creates a demand counter starting at zero.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            pending: AtomicU64::new(0),
        }
    }

    /// Adds `n` units, saturating at [`UNBOUNDED`]. Returns the previous value.
    pub fn add(&self, n: u64) -> u64 {
        let mut current = self.pending.load(Ordering::Acquire);
        loop {
            if current >= UNBOUNDED_U64 {
                return current;
            }
            let next = current.saturating_add(n).min(UNBOUNDED_U64);
            match self
                .pending
                .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(prev) => return prev,
                Err(actual) => current = actual,
            }
        }
    }

    /// Attempts to consume one unit of demand.
    ///
    /// Returns `true` if demand was available. Unbounded demand is never decremented.
    #[inline]
    #[must_use]
    pub fn try_consume(&self) -> bool {
        let mut current = self.pending.load(Ordering::Acquire);
        loop {
            if current == 0 {
                return false;
            }
            if current >= UNBOUNDED_U64 {
                return true;
            }
            match self.pending.compare_exchange_weak(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Current outstanding demand.
    #[must_use]
    pub fn get(&self) -> u64 {
        self.pending.load(Ordering::Acquire)
    }

    /// Returns true when nothing is outstanding.
    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.get() == 0
    }

    /// Returns true once demand reached the unbounded sentinel.
    #[must_use]
    pub fn is_unbounded(&self) -> bool {
        self.get() >= UNBOUNDED_U64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_validate_rejects_non_positive() {
        assert_eq!(
            validate_request(0).unwrap_err(),
            FluxError::IllegalDemand { requested: 0 }
        );
        assert_eq!(
            validate_request(-1).unwrap_err(),
            FluxError::IllegalDemand { requested: -1 }
        );
        assert_eq!(validate_request(5).unwrap(), 5);
    }

    #[test]
    fn test_consume_until_empty() {
        let demand = Demand::new();
        assert!(!demand.try_consume());
        demand.add(2);
        assert!(demand.try_consume());
        assert!(demand.try_consume());
        assert!(!demand.try_consume());
        assert!(demand.is_zero());
    }

    #[test]
    fn test_saturates_at_unbounded() {
        let demand = Demand::new();
        demand.add(u64::MAX - 1);
        demand.add(10);
        assert!(demand.is_unbounded());
        for _ in 0..1000 {
            assert!(demand.try_consume());
        }
        assert!(demand.is_unbounded());
    }

    #[test]
    fn test_to_request_saturates() {
        assert_eq!(to_request(3), 3);
        assert_eq!(to_request(u64::MAX), UNBOUNDED);
    }

    #[test]
    fn test_concurrent_add_and_consume_never_over_consumes() {
        let demand = Arc::new(Demand::new());
        let producers: Vec<_> = (0..4)
            .map(|_| {
                let demand = Arc::clone(&demand);
                thread::spawn(move || {
                    for _ in 0..1000 {
                        demand.add(1);
                    }
                })
            })
            .collect();
        for p in producers {
            p.join().unwrap();
        }

        let mut consumed = 0;
        while demand.try_consume() {
            consumed += 1;
        }
        assert_eq!(consumed, 4000);
    }
}
