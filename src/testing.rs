//! Test probe for asserting on the signals a sequence produces.
//!
//! [`TestSubscriber`] records every signal together with the name of the
//! thread that delivered it. It flags any `on_next` that exceeded the demand
//! it requested, and any signal that broke the `onSubscribe`, items, terminal
//! order. Clones share one recording, so a test keeps a clone and
//! subscribes the other.
//!
//! ```
//! use kyroflux::testing::TestSubscriber;
//! use kyroflux::Flux;
//!
//! let probe = TestSubscriber::with_request(2);
//! Flux::range(0, 5).subscribe(probe.clone());
//! assert_eq!(probe.values(), vec![0, 1]);
//! probe.request(3);
//! assert!(probe.is_complete());
//! ```

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use crate::error::FluxError;
use crate::subscriber::Subscriber;
use crate::subscription::SubscriptionRef;
use crate::sync::lock;

struct ProbeState<T> {
    subscription: Option<SubscriptionRef>,
    values: Vec<T>,
    threads: Vec<String>,
    requested: u64,
    overflowed: bool,
    out_of_order: bool,
    completed: bool,
    error: Option<FluxError>,
}

impl<T> ProbeState<T> {
    fn is_terminated(&self) -> bool {
        self.completed || self.error.is_some()
    }

    // Items and terminal signals need a prior onSubscribe and no prior terminal.
    fn check_order(&mut self) {
        if self.subscription.is_none() || self.is_terminated() {
            self.out_of_order = true;
        }
    }
}

struct Probe<T> {
    state: Mutex<ProbeState<T>>,
    changed: Condvar,
    initial_request: Option<i64>,
}

/// Recording subscriber for tests.
pub struct TestSubscriber<T> {
    probe: Arc<Probe<T>>,
}

impl<T> Clone for TestSubscriber<T> {
    fn clone(&self) -> Self {
        Self {
            probe: Arc::clone(&self.probe),
        }
    }
}

impl<T> Default for TestSubscriber<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> TestSubscriber<T> {
    fn with_initial(initial_request: Option<i64>) -> Self {
        Self {
            probe: Arc::new(Probe {
                state: Mutex::new(ProbeState {
                    subscription: None,
                    values: Vec::new(),
                    threads: Vec::new(),
                    requested: 0,
                    overflowed: false,
                    out_of_order: false,
                    completed: false,
                    error: None,
                }),
                changed: Condvar::new(),
                initial_request,
            }),
        }
    }

    /// Requests unbounded demand on subscribe.
    #[must_use]
    pub fn new() -> Self {
        Self::with_initial(Some(crate::demand::UNBOUNDED))
    }

    /// Requests `n` on subscribe. `n` is passed through unchecked, so `0` or a
    /// negative value exercises the illegal-demand path.
    #[must_use]
    pub fn with_request(n: i64) -> Self {
        Self::with_initial(Some(n))
    }

    /// Requests nothing until [`TestSubscriber::request`] is called.
    #[must_use]
    pub fn manual() -> Self {
        Self::with_initial(None)
    }

    fn state(&self) -> MutexGuard<'_, ProbeState<T>> {
        lock(&self.probe.state)
    }

    /// Requests `n` more items through the recorded subscription.
    pub fn request(&self, n: i64) {
        let subscription = {
            let mut state = self.state();
            if let Ok(n) = u64::try_from(n) {
                state.requested = state.requested.saturating_add(n);
            }
            state.subscription.clone()
        };
        if let Some(subscription) = subscription {
            subscription.request(n);
        }
    }

    /// Cancels the recorded subscription.
    pub fn cancel(&self) {
        let subscription = self.state().subscription.clone();
        if let Some(subscription) = subscription {
            subscription.cancel();
        }
    }

    /// Names of the threads that delivered each `on_next`, in order.
    #[must_use]
    pub fn thread_names(&self) -> Vec<String> {
        self.state().threads.clone()
    }

    /// True once `on_complete` arrived.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.state().completed
    }

    /// True once either terminal signal arrived.
    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.state().is_terminated()
    }

    /// The error received, if any.
    #[must_use]
    pub fn error(&self) -> Option<FluxError> {
        self.state().error.clone()
    }

    /// True if any `on_next` arrived without outstanding demand.
    #[must_use]
    pub fn is_overflowed(&self) -> bool {
        self.state().overflowed
    }

    /// True if a signal arrived before `on_subscribe`, after a terminal
    /// signal, or if `on_subscribe` arrived twice.
    #[must_use]
    pub fn is_out_of_order(&self) -> bool {
        self.state().out_of_order
    }

    /// Waits for a terminal signal. Returns false on timeout.
    #[must_use]
    pub fn await_terminal(&self, timeout: Duration) -> bool {
        self.await_until(timeout, ProbeState::is_terminated)
    }

    /// Waits until at least `n` items arrived. Returns false on timeout.
    #[must_use]
    pub fn await_count(&self, n: usize, timeout: Duration) -> bool {
        self.await_until(timeout, |state| state.values.len() >= n)
    }

    /// Waits for `on_subscribe`. Returns false on timeout.
    #[must_use]
    pub fn await_subscribed(&self, timeout: Duration) -> bool {
        self.await_until(timeout, |state| state.subscription.is_some())
    }

    fn await_until<F>(&self, timeout: Duration, done: F) -> bool
    where
        F: Fn(&ProbeState<T>) -> bool,
    {
        let guard = self.state();
        let (guard, _) = self
            .probe
            .changed
            .wait_timeout_while(guard, timeout, |state| !done(state))
            .unwrap_or_else(PoisonError::into_inner);
        done(&guard)
    }

    fn update(&self, f: impl FnOnce(&mut ProbeState<T>)) {
        f(&mut self.state());
        self.probe.changed.notify_all();
    }
}

impl<T: Clone> TestSubscriber<T> {
    /// Items received so far.
    #[must_use]
    pub fn values(&self) -> Vec<T> {
        self.state().values.clone()
    }
}

impl<T: Send + 'static> Subscriber<T> for TestSubscriber<T> {
    fn on_subscribe(&mut self, subscription: SubscriptionRef) {
        self.update(|state| {
            if state.subscription.is_some() {
                state.out_of_order = true;
            }
            state.subscription = Some(subscription);
        });
        if let Some(n) = self.probe.initial_request {
            self.request(n);
        }
    }

    fn on_next(&mut self, item: T) {
        let name = thread::current().name().unwrap_or("<unnamed>").to_string();
        self.update(|state| {
            state.check_order();
            if state.values.len() as u64 >= state.requested {
                state.overflowed = true;
            }
            state.values.push(item);
            state.threads.push(name);
        });
    }

    fn on_error(&mut self, error: FluxError) {
        self.update(|state| {
            state.check_order();
            state.error = Some(error);
        });
    }

    fn on_complete(&mut self) {
        self.update(|state| {
            state.check_order();
            state.completed = true;
        });
    }
}
