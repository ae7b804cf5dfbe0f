use std::fmt::Debug;
use std::sync::Arc;

use tracing::info;

use crate::context::Context;
use crate::error::FluxError;
use crate::publisher::Publisher;
use crate::subscriber::{BoxSubscriber, Subscriber};
use crate::subscription::{Subscription, SubscriptionRef};

/// Pass-through stage logging every signal, request and cancel.
pub(crate) struct LogPublisher<T> {
    source: Arc<dyn Publisher<T>>,
    category: Arc<str>,
}

impl<T> LogPublisher<T> {
    pub(crate) fn new(source: Arc<dyn Publisher<T>>, category: &str) -> Self {
        Self {
            source,
            category: Arc::from(category),
        }
    }
}

impl<T: Debug + Send + 'static> Publisher<T> for LogPublisher<T> {
    fn subscribe_boxed(&self, subscriber: BoxSubscriber<T>, context: Context) {
        let log = LogSubscriber {
            downstream: subscriber,
            category: Arc::clone(&self.category),
        };
        self.source.subscribe_boxed(Box::new(log), context);
    }
}

struct LogSubscriber<T> {
    downstream: BoxSubscriber<T>,
    category: Arc<str>,
}

impl<T: Debug> Subscriber<T> for LogSubscriber<T> {
    fn on_subscribe(&mut self, subscription: SubscriptionRef) {
        info!(category = %self.category, "onSubscribe");
        self.downstream.on_subscribe(Arc::new(LogSubscription {
            upstream: subscription,
            category: Arc::clone(&self.category),
        }));
    }

    fn on_next(&mut self, item: T) {
        info!(category = %self.category, "onNext({item:?})");
        self.downstream.on_next(item);
    }

    fn on_error(&mut self, error: FluxError) {
        info!(category = %self.category, error = %error, "onError");
        self.downstream.on_error(error);
    }

    fn on_complete(&mut self) {
        info!(category = %self.category, "onComplete");
        self.downstream.on_complete();
    }
}

struct LogSubscription {
    upstream: SubscriptionRef,
    category: Arc<str>,
}

impl Subscription for LogSubscription {
    fn request(&self, n: i64) {
        info!(category = %self.category, "request({n})");
        self.upstream.request(n);
    }

    fn cancel(&self) {
        info!(category = %self.category, "cancel");
        self.upstream.cancel();
    }
}

#[cfg(test)]
mod tests {
    use crate::publisher::Flux;
    use crate::testing::TestSubscriber;

    #[test]
    fn test_log_is_transparent() {
        let probe = TestSubscriber::with_request(2);
        Flux::just(vec![1, 2, 3]).log("test.log").subscribe(probe.clone());
        assert_eq!(probe.values(), vec![1, 2]);
        probe.request(1);
        assert_eq!(probe.values(), vec![1, 2, 3]);
        assert!(probe.is_complete());
    }
}
