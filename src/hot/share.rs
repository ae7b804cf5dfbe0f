use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use tracing::debug;

use crate::context::Context;
use crate::demand::{to_request, validate_request, Demand, UNBOUNDED};
use crate::error::FluxError;
use crate::hooks;
use crate::publisher::Publisher;
use crate::subscriber::serialized::SerializedSink;
use crate::subscriber::{BoxSubscriber, Subscriber};
use crate::subscription::{Subscription, SubscriptionId, SubscriptionRef};
use crate::sync::lock;

const UNBOUNDED_U64: u64 = UNBOUNDED as u64;

/// Reference-counted multicast of one upstream subscription.
pub(crate) struct SharePublisher<T> {
    core: Arc<ShareCore<T>>,
}

impl<T> SharePublisher<T> {
    pub(crate) fn new(source: Arc<dyn Publisher<T>>) -> Self {
        Self {
            core: Arc::new(ShareCore {
                source,
                registry: Mutex::new(Registry {
                    members: Vec::new(),
                    connection: None,
                }),
            }),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Publisher<T> for SharePublisher<T> {
    fn subscribe_boxed(&self, subscriber: BoxSubscriber<T>, context: Context) {
        let member = Arc::new(Member {
            id: SubscriptionId::new(),
            sink: SerializedSink::new(subscriber),
            demand: Demand::new(),
            core: Arc::clone(&self.core),
        });
        // Subscribed before it is visible to a terminating upstream.
        member.sink.on_subscribe(member.clone());
        let connect = {
            let mut registry = lock(&self.core.registry);
            // A member that left during `on_subscribe` already ran `remove`.
            if member.sink.is_done() {
                return;
            }
            registry.members.push(Arc::clone(&member));
            if registry.connection.is_none() {
                let connection = Arc::new(Connection::default());
                registry.connection = Some(Arc::clone(&connection));
                Some(connection)
            } else {
                None
            }
        };
        debug!(subscription = %member.id, connect = connect.is_some(), "share member joined");

        match connect {
            Some(connection) => {
                let upstream = ShareSubscriber {
                    core: Arc::clone(&self.core),
                    connection,
                };
                self.core.source.subscribe_boxed(Box::new(upstream), context);
            }
            None => self.core.replenish(),
        }
    }
}

struct Registry<T> {
    members: Vec<Arc<Member<T>>>,
    connection: Option<Arc<Connection>>,
}

/// One upstream subscription, alive from the first member joining until
/// upstream terminates or the last member leaves.
#[derive(Default)]
struct Connection {
    upstream: OnceLock<SubscriptionRef>,
    // Requested from upstream but not yet delivered.
    owed: AtomicU64,
}

impl Connection {
    fn delivered_one(&self) {
        let _ = self
            .owed
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |owed| {
                (owed > 0 && owed < UNBOUNDED_U64).then(|| owed - 1)
            });
    }
}

struct ShareCore<T> {
    source: Arc<dyn Publisher<T>>,
    registry: Mutex<Registry<T>>,
}

impl<T: Send + 'static> ShareCore<T> {
    fn is_current(&self, connection: &Arc<Connection>) -> bool {
        lock(&self.registry)
            .connection
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, connection))
    }

    /// Tops upstream demand up to what the slowest member can take.
    fn replenish(&self) {
        let request = {
            let registry = lock(&self.registry);
            let Some(connection) = registry.connection.as_ref() else {
                return;
            };
            let Some(upstream) = connection.upstream.get() else {
                return;
            };
            let slowest = registry
                .members
                .iter()
                .map(|m| m.demand.get())
                .min()
                .unwrap_or(0);
            let owed = connection.owed.load(Ordering::Acquire);
            if slowest <= owed {
                return;
            }
            let missing = slowest - owed;
            connection
                .owed
                .store(owed.saturating_add(missing).min(UNBOUNDED_U64), Ordering::Release);
            (Arc::clone(upstream), missing)
        };
        request.0.request(to_request(request.1));
    }

    fn remove(&self, id: SubscriptionId) {
        let disconnected = {
            let mut registry = lock(&self.registry);
            registry.members.retain(|m| m.id != id);
            if registry.members.is_empty() {
                registry.connection.take()
            } else {
                None
            }
        };
        match disconnected {
            Some(connection) => {
                debug!("last share member left, cancelling upstream");
                if let Some(upstream) = connection.upstream.get() {
                    upstream.cancel();
                }
            }
            None => self.replenish(),
        }
    }

    /// Detaches every member if `connection` is still the live one.
    fn terminate(&self, connection: &Arc<Connection>) -> Option<Vec<Arc<Member<T>>>> {
        let mut registry = lock(&self.registry);
        let current = registry
            .connection
            .as_ref()
            .is_some_and(|c| Arc::ptr_eq(c, connection));
        if !current {
            return None;
        }
        registry.connection = None;
        Some(std::mem::take(&mut registry.members))
    }
}

struct Member<T> {
    id: SubscriptionId,
    sink: SerializedSink<T>,
    demand: Demand,
    core: Arc<ShareCore<T>>,
}

impl<T: Send + 'static> Subscription for Member<T> {
    fn request(&self, n: i64) {
        if self.sink.is_done() {
            return;
        }
        match validate_request(n) {
            Ok(n) => {
                self.demand.add(n);
                self.core.replenish();
            }
            Err(err) => {
                self.sink.error(err);
                self.core.remove(self.id);
            }
        }
    }

    fn cancel(&self) {
        if self.sink.is_cancelled() {
            return;
        }
        self.sink.cancel();
        self.core.remove(self.id);
    }
}

struct ShareSubscriber<T> {
    core: Arc<ShareCore<T>>,
    connection: Arc<Connection>,
}

impl<T: Clone + Send + 'static> Subscriber<T> for ShareSubscriber<T> {
    fn on_subscribe(&mut self, subscription: SubscriptionRef) {
        if self.connection.upstream.set(subscription.clone()).is_err()
            || !self.core.is_current(&self.connection)
        {
            subscription.cancel();
            return;
        }
        self.core.replenish();
    }

    fn on_next(&mut self, item: T) {
        self.connection.delivered_one();
        let members = {
            let registry = lock(&self.core.registry);
            let current = registry
                .connection
                .as_ref()
                .is_some_and(|c| Arc::ptr_eq(c, &self.connection));
            if !current {
                return;
            }
            registry.members.clone()
        };
        for member in members {
            if member.demand.try_consume() {
                member.sink.next(item.clone());
            } else {
                hooks::on_next_dropped("share");
            }
        }
    }

    fn on_error(&mut self, error: FluxError) {
        match self.core.terminate(&self.connection) {
            Some(members) => {
                for member in members {
                    member.sink.error(error.clone());
                }
            }
            None => hooks::on_error_dropped(&error),
        }
    }

    fn on_complete(&mut self) {
        if let Some(members) = self.core.terminate(&self.connection) {
            for member in members {
                member.sink.complete();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use crate::publisher::Flux;
    use crate::scheduler::{SchedulerConfig, Schedulers};
    use crate::testing::TestSubscriber;

    #[test]
    fn test_single_upstream_for_all_members() {
        let subscriptions = Arc::new(AtomicUsize::new(0));
        let s = Arc::clone(&subscriptions);
        let shared = Flux::defer(move || {
            s.fetch_add(1, Ordering::SeqCst);
            Flux::range(0, 4)
        })
        .share();

        let first = TestSubscriber::manual();
        let second = TestSubscriber::manual();
        shared.subscribe(first.clone());
        shared.subscribe(second.clone());
        first.request(10);
        second.request(10);

        assert_eq!(subscriptions.load(Ordering::SeqCst), 1);
        assert_eq!(first.values(), vec![0, 1, 2, 3]);
        assert_eq!(second.values(), vec![0, 1, 2, 3]);
        assert!(first.is_complete() && second.is_complete());
    }

    #[test]
    fn test_upstream_paced_by_slowest_member() {
        let shared = Flux::range(0, 10).share();
        let fast = TestSubscriber::manual();
        let slow = TestSubscriber::manual();
        shared.subscribe(fast.clone());
        shared.subscribe(slow.clone());
        fast.request(5);
        slow.request(2);
        assert_eq!(fast.values(), vec![0, 1]);
        assert_eq!(slow.values(), vec![0, 1]);
        slow.request(3);
        assert_eq!(fast.values(), vec![0, 1, 2, 3, 4]);
        assert_eq!(slow.values(), vec![0, 1, 2, 3, 4]);
        assert!(!fast.is_overflowed() && !slow.is_overflowed());
    }

    #[test]
    fn test_last_cancel_disconnects_and_resubscribe_reconnects() {
        let subscriptions = Arc::new(AtomicUsize::new(0));
        let s = Arc::clone(&subscriptions);
        let shared = Flux::defer(move || {
            s.fetch_add(1, Ordering::SeqCst);
            Flux::<i64>::never()
        })
        .share();

        let a = TestSubscriber::new();
        let b = TestSubscriber::new();
        shared.subscribe(a.clone());
        shared.subscribe(b.clone());
        a.cancel();
        assert_eq!(subscriptions.load(Ordering::SeqCst), 1);
        b.cancel();

        let c = TestSubscriber::new();
        shared.subscribe(c.clone());
        assert_eq!(subscriptions.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_late_member_misses_earlier_items() {
        let pool = Schedulers::new_parallel(SchedulerConfig {
            name: "share-late".to_string(),
            workers: 1,
            queue_capacity: 64,
        });
        let ticks = Flux::interval(Duration::from_millis(20), Arc::clone(&pool))
            .take(6)
            .share();
        let early = TestSubscriber::new();
        ticks.subscribe(early.clone());
        assert!(early.await_count(3, Duration::from_secs(5)));

        let late = TestSubscriber::new();
        ticks.subscribe(late.clone());
        assert!(early.await_terminal(Duration::from_secs(5)));
        assert!(late.await_terminal(Duration::from_secs(5)));
        assert_eq!(early.values(), vec![0, 1, 2, 3, 4, 5]);
        let late_values = late.values();
        assert!(late_values.len() < 6);
        assert!(late_values.iter().all(|v| *v >= 3));
        pool.dispose();
    }

    #[test]
    fn test_illegal_member_demand_only_fails_that_member() {
        let shared = Flux::<i64>::never().share();
        let good = TestSubscriber::new();
        let bad = TestSubscriber::manual();
        shared.subscribe(good.clone());
        shared.subscribe(bad.clone());
        bad.request(0);
        assert!(bad.error().unwrap().is_illegal_demand());
        assert!(!good.is_terminated());
    }
}
