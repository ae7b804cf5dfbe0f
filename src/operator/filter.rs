use std::sync::Arc;

use crate::context::Context;
use crate::error::FluxError;
use crate::hooks;
use crate::publisher::Publisher;
use crate::subscriber::{BoxSubscriber, Subscriber};
use crate::subscription::SubscriptionRef;

type Predicate<T> = Box<dyn FnMut(&T) -> bool + Send>;
type PredicateFactory<T> = Arc<dyn Fn() -> Predicate<T> + Send + Sync>;

/// Keeps items for which the per-subscription predicate returns true.
///
/// The factory runs once per subscriber, so stateful predicates (`skip`,
/// `distinct`) start fresh for every subscription and their state is dropped
/// with it. Every dropped item is replaced by a `request(1)` upstream.
pub(crate) struct FilterPublisher<T> {
    source: Arc<dyn Publisher<T>>,
    factory: PredicateFactory<T>,
}

impl<T> FilterPublisher<T> {
    pub(crate) fn new<F>(source: Arc<dyn Publisher<T>>, factory: F) -> Self
    where
        F: Fn() -> Predicate<T> + Send + Sync + 'static,
    {
        Self {
            source,
            factory: Arc::new(factory),
        }
    }
}

impl<T: Send + 'static> Publisher<T> for FilterPublisher<T> {
    fn subscribe_boxed(&self, subscriber: BoxSubscriber<T>, context: Context) {
        let filter = FilterSubscriber {
            downstream: subscriber,
            predicate: (self.factory)(),
            upstream: None,
            done: false,
        };
        self.source.subscribe_boxed(Box::new(filter), context);
    }
}

struct FilterSubscriber<T> {
    downstream: BoxSubscriber<T>,
    predicate: Predicate<T>,
    upstream: Option<SubscriptionRef>,
    done: bool,
}

impl<T> Subscriber<T> for FilterSubscriber<T> {
    fn on_subscribe(&mut self, subscription: SubscriptionRef) {
        self.upstream = Some(subscription.clone());
        self.downstream.on_subscribe(subscription);
    }

    fn on_next(&mut self, item: T) {
        if self.done {
            return;
        }
        if (self.predicate)(&item) {
            self.downstream.on_next(item);
        } else if let Some(upstream) = &self.upstream {
            upstream.request(1);
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

#[cfg(test)]
mod tests {
    use crate::publisher::Flux;
    use crate::testing::TestSubscriber;

    #[test]
    fn test_even_filter_satisfies_exact_demand() {
        let probe = TestSubscriber::with_request(3);
        Flux::just(vec![1, 2, 3, 4, 5, 6])
            .filter(|n| n % 2 == 0)
            .subscribe(probe.clone());
        assert_eq!(probe.values(), vec![2, 4, 6]);
        assert!(probe.is_complete());
        assert!(!probe.is_overflowed());
    }

    #[test]
    fn test_skip_state_is_per_subscription() {
        let flux = Flux::range(0, 5).skip(3);
        for _ in 0..2 {
            let probe = TestSubscriber::new();
            flux.subscribe(probe.clone());
            assert_eq!(probe.values(), vec![3, 4]);
        }
    }

    #[test]
    fn test_distinct_drops_repeats() {
        let flux = Flux::just(vec!["a", "b", "a", "c", "b"]).distinct();
        let probe = TestSubscriber::with_request(3);
        flux.subscribe(probe.clone());
        assert_eq!(probe.values(), vec!["a", "b", "c"]);
        assert!(probe.is_complete());

        let again = TestSubscriber::new();
        flux.subscribe(again.clone());
        assert_eq!(again.values(), vec!["a", "b", "c"]);
    }
}
