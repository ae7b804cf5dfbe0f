//! Subscriptions: the demand and cancellation handle between a publisher and
//! one subscriber.
//!
//! A subscription is owned jointly by its producer (which reads demand) and
//! its subscriber (which writes demand and may cancel).

/// Switchable upstream for stages that resubscribe mid-stream.
pub mod arbiter;

pub use arbiter::SubscriptionArbiter;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::sync::lock;

/// Demand and cancellation contract.
///
/// # Contract
/// - `request(n)` with `n <= 0` fails the subscription with `IllegalDemand`
///   delivered through `OnError`; it never panics into the caller.
/// - `request(n)` adds to outstanding demand, saturating at
///   [`UNBOUNDED`](crate::demand::UNBOUNDED), and is safe from any thread,
///   including from inside the subscriber's own signal handlers.
/// - `cancel()` is idempotent; after it is observed no further signals reach
///   the subscriber and further `request` calls are no-ops.
pub trait Subscription: Send + Sync {
    /// Signals demand for `n` more items.
    fn request(&self, n: i64);

    /// Stops the flow of signals.
    fn cancel(&self);
}

/// Shared subscription handle.
pub type SubscriptionRef = Arc<dyn Subscription>;

/// Unique identifier for a subscription.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionId(Uuid);

impl SubscriptionId {
    /// Create a new random subscription id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for SubscriptionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Something that can be released once.
pub trait Disposable: Send + Sync {
    /// Releases the resource. Idempotent.
    fn dispose(&self);

    /// Returns true once `dispose` was called (or the resource ended on its own).
    fn is_disposed(&self) -> bool;
}

/// Subscription that ignores requests; used by sources that terminate immediately.
#[derive(Debug, Default)]
pub(crate) struct NoopSubscription;

impl Subscription for NoopSubscription {
    fn request(&self, _n: i64) {}

    fn cancel(&self) {}
}

/// Disposable view over a subscription that may not have arrived yet.
///
/// Disposing before `OnSubscribe` cancels the subscription as soon as it is set.
#[derive(Clone, Default)]
pub struct SubscriptionDisposable {
    inner: Arc<DisposableInner>,
}

#[derive(Default)]
struct DisposableInner {
    upstream: Mutex<Option<SubscriptionRef>>,
    disposed: AtomicBool,
}

impl SubscriptionDisposable {
    #[must_use]
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Binds the upstream subscription. Returns false (after cancelling it) if already disposed.
    pub(crate) fn set(&self, subscription: SubscriptionRef) -> bool {
        if self.inner.disposed.load(Ordering::Acquire) {
            subscription.cancel();
            return false;
        }
        *lock(&self.inner.upstream) = Some(subscription);
        if self.inner.disposed.load(Ordering::Acquire) {
            let upstream = lock(&self.inner.upstream).take();
            if let Some(s) = upstream {
                s.cancel();
            }
            return false;
        }
        true
    }

    /// Marks the disposable as finished without cancelling (terminal signal received).
    pub(crate) fn finish(&self) {
        self.inner.disposed.store(true, Ordering::Release);
        lock(&self.inner.upstream).take();
    }
}

impl Disposable for SubscriptionDisposable {
    fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        let upstream = lock(&self.inner.upstream).take();
        if let Some(s) = upstream {
            s.cancel();
        }
    }

    fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for SubscriptionDisposable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionDisposable")
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct CountingSubscription {
        cancels: AtomicUsize,
    }

    impl Subscription for CountingSubscription {
        fn request(&self, _n: i64) {}

        fn cancel(&self) {
            self.cancels.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_dispose_cancels_bound_subscription_once() {
        let sub = Arc::new(CountingSubscription::default());
        let d = SubscriptionDisposable::new();
        assert!(d.set(sub.clone()));
        d.dispose();
        d.dispose();
        assert!(d.is_disposed());
        assert_eq!(sub.cancels.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_dispose_before_subscribe_cancels_on_arrival() {
        let sub = Arc::new(CountingSubscription::default());
        let d = SubscriptionDisposable::new();
        d.dispose();
        assert!(!d.set(sub.clone()));
        assert_eq!(sub.cancels.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_finish_does_not_cancel() {
        let sub = Arc::new(CountingSubscription::default());
        let d = SubscriptionDisposable::new();
        d.set(sub.clone());
        d.finish();
        d.dispose();
        assert!(d.is_disposed());
        assert_eq!(sub.cancels.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_subscription_ids_are_unique() {
        assert_ne!(SubscriptionId::new(), SubscriptionId::new());
    }
}
