//! Hook-based subscriber.
//!
//! [`BaseSubscriber`] implements the four [`Subscriber`] entry points itself
//! and only exposes hook callbacks to user code. The subscription is owned by
//! the wrapper and reached through a [`SubscriptionHandle`], whose `request`
//! rejects zero demand without forwarding it and becomes a no-op once the
//! subscription is cancelled or terminated. User code therefore cannot
//! request invalid demand, request after cancellation, or observe a signal
//! after a terminal one.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use tracing::warn;

use crate::demand::{to_request, UNBOUNDED};
use crate::error::{FluxError, FluxResult, ProtocolViolation};
use crate::hooks;
use crate::signal::SignalKind;
use crate::subscription::{Disposable, SubscriptionRef};

use super::Subscriber;

/// User callbacks driven by a [`BaseSubscriber`].
///
/// Only `hook_on_next` is required. The default `hook_on_subscribe` requests
/// unbounded demand; the default `hook_on_error` reports the error to
/// [`crate::hooks`] so it is never swallowed.
pub trait Hooks<T>: Send {
    /// Called once with the handle; request initial demand here.
    fn hook_on_subscribe(&mut self, subscription: &SubscriptionHandle) {
        subscription.request_unbounded();
    }

    /// Called for each item.
    fn hook_on_next(&mut self, item: T, subscription: &SubscriptionHandle);

    /// Called on successful completion.
    fn hook_on_complete(&mut self) {}

    /// Called on failure.
    fn hook_on_error(&mut self, error: FluxError) {
        hooks::on_error_dropped(&error);
    }

    /// Called after completion, error, or a cancel observed by the wrapper.
    fn hook_finally(&mut self, _signal: SignalKind) {}
}

#[derive(Default)]
struct HandleInner {
    upstream: OnceLock<SubscriptionRef>,
    cancelled: AtomicBool,
    terminated: AtomicBool,
}

/// Mediated access to the subscription owned by a [`BaseSubscriber`].
///
/// Cloneable so it can be moved to another thread and used to cancel.
#[derive(Clone, Default)]
pub struct SubscriptionHandle {
    inner: Arc<HandleInner>,
}

impl SubscriptionHandle {
    /// Requests `n` more items.
    ///
    /// # Errors
    /// `IllegalDemand` if `n == 0`; the request is not forwarded and the
    /// subscription stays valid.
    pub fn request(&self, n: u64) -> FluxResult<()> {
        if n == 0 {
            return Err(FluxError::IllegalDemand { requested: 0 });
        }
        if self.is_cancelled() || self.inner.terminated.load(Ordering::Acquire) {
            return Ok(());
        }
        if let Some(upstream) = self.inner.upstream.get() {
            upstream.request(to_request(n));
        }
        Ok(())
    }

    /// Requests unbounded demand.
    pub fn request_unbounded(&self) {
        if self.is_cancelled() || self.inner.terminated.load(Ordering::Acquire) {
            return;
        }
        if let Some(upstream) = self.inner.upstream.get() {
            upstream.request(UNBOUNDED);
        }
    }

    /// Cancels the subscription. Idempotent.
    pub fn cancel(&self) {
        if self.inner.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(upstream) = self.inner.upstream.get() {
            upstream.cancel();
        }
    }

    /// True once `cancel` was called.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    fn bind(&self, upstream: SubscriptionRef) -> bool {
        if self.inner.upstream.set(upstream.clone()).is_err() {
            upstream.cancel();
            return false;
        }
        if self.is_cancelled() {
            upstream.cancel();
        }
        true
    }
}

impl Disposable for SubscriptionHandle {
    fn dispose(&self) {
        self.cancel();
    }

    fn is_disposed(&self) -> bool {
        self.is_cancelled() || self.inner.terminated.load(Ordering::Acquire)
    }
}

/// Subscriber that seals the protocol entry points behind [`Hooks`].
pub struct BaseSubscriber<T, H> {
    hooks: H,
    handle: SubscriptionHandle,
    _item: PhantomData<fn(T)>,
}

impl<T, H: Hooks<T>> BaseSubscriber<T, H> {
    /// Wraps `hooks`.
    pub fn new(hooks: H) -> Self {
        Self {
            hooks,
            handle: SubscriptionHandle::default(),
            _item: PhantomData,
        }
    }

    /// Handle usable from outside the signal callbacks (e.g. to cancel from another thread).
    #[must_use]
    pub fn handle(&self) -> SubscriptionHandle {
        self.handle.clone()
    }

    fn is_terminated(&self) -> bool {
        self.handle.inner.terminated.load(Ordering::Acquire)
    }

    fn terminate(&self) -> bool {
        !self.handle.inner.terminated.swap(true, Ordering::AcqRel)
    }
}

impl<T, H: Hooks<T>> Subscriber<T> for BaseSubscriber<T, H> {
    fn on_subscribe(&mut self, subscription: SubscriptionRef) {
        if !self.handle.bind(subscription) {
            warn!("BaseSubscriber received a second subscription");
            hooks::on_error_dropped(&FluxError::Protocol(
                ProtocolViolation::DuplicateSubscription,
            ));
            return;
        }
        if self.handle.is_cancelled() {
            self.hooks.hook_finally(SignalKind::Cancel);
            return;
        }
        self.hooks.hook_on_subscribe(&self.handle);
    }

    fn on_next(&mut self, item: T) {
        if self.is_terminated() {
            hooks::on_error_dropped(&FluxError::Protocol(
                ProtocolViolation::SignalAfterTerminal {
                    signal: SignalKind::OnNext,
                },
            ));
            return;
        }
        if self.handle.is_cancelled() {
            hooks::on_next_dropped("base_subscriber");
            return;
        }
        self.hooks.hook_on_next(item, &self.handle);
    }

    fn on_error(&mut self, error: FluxError) {
        if !self.terminate() {
            hooks::on_error_dropped(&error);
            return;
        }
        self.hooks.hook_on_error(error);
        self.hooks.hook_finally(SignalKind::OnError);
    }

    fn on_complete(&mut self) {
        if !self.terminate() {
            return;
        }
        self.hooks.hook_on_complete();
        self.hooks.hook_finally(SignalKind::OnComplete);
    }
}
