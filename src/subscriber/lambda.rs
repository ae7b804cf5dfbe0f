//! Callback-based subscriber.
//!
//! Wraps plain closures into a full [`Subscriber`]. Demand defaults to
//! unbounded; an error with no `on_error` callback goes to
//! [`crate::hooks`] instead of disappearing.

use crate::demand::{to_request, UNBOUNDED};
use crate::error::FluxError;
use crate::hooks;
use crate::subscription::{SubscriptionDisposable, SubscriptionRef};

use super::Subscriber;

type NextFn<T> = Box<dyn FnMut(T) + Send>;
type ErrorFn = Box<dyn FnMut(FluxError) + Send>;
type CompleteFn = Box<dyn FnMut() + Send>;

/// Builder for [`LambdaSubscriber`].
pub struct SubscriberBuilder<T> {
    on_next: NextFn<T>,
    on_error: Option<ErrorFn>,
    on_complete: Option<CompleteFn>,
    initial_request: i64,
}

impl<T> SubscriberBuilder<T> {
    /// Starts a builder around the per-item callback.
    pub fn new<F>(on_next: F) -> Self
    where
        F: FnMut(T) + Send + 'static,
    {
        Self {
            on_next: Box::new(on_next),
            on_error: None,
            on_complete: None,
            initial_request: UNBOUNDED,
        }
    }

    /// Sets the error callback.
    #[must_use]
    pub fn on_error<F>(mut self, f: F) -> Self
    where
        F: FnMut(FluxError) + Send + 'static,
    {
        self.on_error = Some(Box::new(f));
        self
    }

    /// Sets the completion callback.
    #[must_use]
    pub fn on_complete<F>(mut self, f: F) -> Self
    where
        F: FnMut() + Send + 'static,
    {
        self.on_complete = Some(Box::new(f));
        self
    }

    /// Requests only `n` items in total instead of unbounded demand.
    ///
    /// `n` is clamped to at least one.
    #[must_use]
    pub fn initial_request(mut self, n: u64) -> Self {
        self.initial_request = to_request(n.max(1));
        self
    }

    /// Finishes the subscriber.
    #[must_use]
    pub fn build(self) -> LambdaSubscriber<T> {
        LambdaSubscriber {
            on_next: self.on_next,
            on_error: self.on_error,
            on_complete: self.on_complete,
            initial_request: self.initial_request,
            disposable: SubscriptionDisposable::new(),
            done: false,
        }
    }
}

/// Subscriber assembled from callbacks by [`SubscriberBuilder`].
pub struct LambdaSubscriber<T> {
    on_next: NextFn<T>,
    on_error: Option<ErrorFn>,
    on_complete: Option<CompleteFn>,
    initial_request: i64,
    disposable: SubscriptionDisposable,
    done: bool,
}

impl<T> LambdaSubscriber<T> {
    /// Handle that cancels this subscriber's subscription when disposed.
    #[must_use]
    pub fn disposable(&self) -> SubscriptionDisposable {
        self.disposable.clone()
    }
}

impl<T> Subscriber<T> for LambdaSubscriber<T> {
    fn on_subscribe(&mut self, subscription: SubscriptionRef) {
        if self.disposable.set(subscription.clone()) {
            subscription.request(self.initial_request);
        }
    }

    fn on_next(&mut self, item: T) {
        if self.done {
            return;
        }
        (self.on_next)(item);
    }

    fn on_error(&mut self, error: FluxError) {
        if self.done {
            hooks::on_error_dropped(&error);
            return;
        }
        self.done = true;
        self.disposable.finish();
        match self.on_error.as_mut() {
            Some(f) => f(error),
            None => hooks::on_error_dropped(&error),
        }
    }

    fn on_complete(&mut self) {
        if self.done {
            return;
        }
        self.done = true;
        self.disposable.finish();
        if let Some(f) = self.on_complete.as_mut() {
            f();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
    use std::sync::{Arc, Mutex};

    use crate::subscription::{Disposable, Subscription};

    #[derive(Default)]
    struct Upstream {
        requested: AtomicI64,
        cancelled: AtomicBool,
    }

    impl Subscription for Upstream {
        fn request(&self, n: i64) {
            self.requested.fetch_add(n, Ordering::SeqCst);
        }

        fn cancel(&self) {
            self.cancelled.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_defaults_to_unbounded_demand() {
        let up = Arc::new(Upstream::default());
        let mut sub = SubscriberBuilder::<i32>::new(|_| {}).build();
        sub.on_subscribe(up.clone());
        assert_eq!(up.requested.load(Ordering::SeqCst), UNBOUNDED);
    }

    #[test]
    fn test_initial_request_is_respected() {
        let up = Arc::new(Upstream::default());
        let mut sub = SubscriberBuilder::<i32>::new(|_| {}).initial_request(2).build();
        sub.on_subscribe(up.clone());
        assert_eq!(up.requested.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_callbacks_receive_signals() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (a, b) = (Arc::clone(&seen), Arc::clone(&seen));
        let mut sub = SubscriberBuilder::new(move |v: i32| a.lock().unwrap().push(v))
            .on_complete(move || b.lock().unwrap().push(-1))
            .build();
        sub.on_subscribe(Arc::new(Upstream::default()));
        sub.on_next(1);
        sub.on_next(2);
        sub.on_complete();
        sub.on_next(3);
        assert_eq!(*seen.lock().unwrap(), vec![1, 2, -1]);
    }

    #[test]
    fn test_dispose_cancels_upstream() {
        let up = Arc::new(Upstream::default());
        let mut sub = SubscriberBuilder::<i32>::new(|_| {}).build();
        let handle = sub.disposable();
        sub.on_subscribe(up.clone());
        handle.dispose();
        assert!(up.cancelled.load(Ordering::SeqCst));
        assert!(handle.is_disposed());
    }

    #[test]
    fn test_unhandled_error_reaches_hooks() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        hooks::set_on_error_dropped("lambda-test", move |err| {
            if let FluxError::Upstream { message } = err {
                if message == "lambda-unhandled" {
                    sink.lock().unwrap().push(message.clone());
                }
            }
        });
        let mut sub = SubscriberBuilder::<i32>::new(|_| {}).build();
        sub.on_subscribe(Arc::new(Upstream::default()));
        sub.on_error(FluxError::upstream("lambda-unhandled"));
        hooks::reset_on_error_dropped("lambda-test");
        assert_eq!(seen.lock().unwrap().len(), 1);
    }
}
