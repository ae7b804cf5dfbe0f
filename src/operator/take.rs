use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::context::Context;
use crate::demand::to_request;
use crate::error::FluxError;
use crate::hooks;
use crate::publisher::Publisher;
use crate::subscriber::{BoxSubscriber, Subscriber};
use crate::subscription::{NoopSubscription, Subscription, SubscriptionRef};

/// Emits at most `limit` items, then cancels upstream and completes.
///
/// Demand forwarded upstream never exceeds `limit` in total, so an unbounded
/// downstream request reaches the source as `request(limit)`.
pub(crate) struct TakePublisher<T> {
    source: Arc<dyn Publisher<T>>,
    limit: u64,
}

impl<T> TakePublisher<T> {
    pub(crate) fn new(source: Arc<dyn Publisher<T>>, limit: u64) -> Self {
        Self { source, limit }
    }
}

impl<T: Send + 'static> Publisher<T> for TakePublisher<T> {
    fn subscribe_boxed(&self, subscriber: BoxSubscriber<T>, context: Context) {
        let take = TakeSubscriber {
            downstream: subscriber,
            remaining: self.limit,
            upstream: None,
            done: false,
        };
        self.source.subscribe_boxed(Box::new(take), context);
    }
}

struct TakeSubscriber<T> {
    downstream: BoxSubscriber<T>,
    remaining: u64,
    upstream: Option<SubscriptionRef>,
    done: bool,
}

impl<T> Subscriber<T> for TakeSubscriber<T> {
    fn on_subscribe(&mut self, subscription: SubscriptionRef) {
        if self.remaining == 0 {
            subscription.cancel();
            self.done = true;
            self.downstream.on_subscribe(Arc::new(NoopSubscription));
            self.downstream.on_complete();
            return;
        }
        self.upstream = Some(subscription.clone());
        let capped: SubscriptionRef = Arc::new(TakeSubscription {
            upstream: subscription,
            budget: AtomicU64::new(self.remaining),
        });
        self.downstream.on_subscribe(capped);
    }

    fn on_next(&mut self, item: T) {
        if self.done {
            return;
        }
        self.remaining -= 1;
        let last = self.remaining == 0;
        if last {
            self.done = true;
            if let Some(upstream) = self.upstream.take() {
                upstream.cancel();
            }
        }
        self.downstream.on_next(item);
        if last {
            self.downstream.on_complete();
        }
    }

    fn on_error(&mut self, error: FluxError) {
        if self.done {
            hooks::on_error_dropped(&error);
            return;
        }
        self.done = true;
        self.downstream.on_error(error);
    }

    fn on_complete(&mut self) {
        if self.done {
            return;
        }
        self.done = true;
        self.downstream.on_complete();
    }
}

/// Forwards at most `budget` units of demand in total.
struct TakeSubscription {
    upstream: SubscriptionRef,
    budget: AtomicU64,
}

impl Subscription for TakeSubscription {
    fn request(&self, n: i64) {
        if n <= 0 {
            // Upstream reports the violation.
            self.upstream.request(n);
            return;
        }
        let wanted = n.unsigned_abs();
        let mut budget = self.budget.load(Ordering::Acquire);
        loop {
            let granted = wanted.min(budget);
            if granted == 0 {
                return;
            }
            match self.budget.compare_exchange_weak(
                budget,
                budget - granted,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.upstream.request(to_request(granted));
                    return;
                }
                Err(actual) => budget = actual,
            }
        }
    }

    fn cancel(&self) {
        self.upstream.cancel();
    }
}
