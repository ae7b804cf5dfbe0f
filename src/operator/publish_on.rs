//! Hand-off of downstream signals to a scheduler.
//!
//! Upstream signals land in a bounded queue on whatever thread produced them;
//! a drain task on a per-subscription [`Worker`] delivers them downstream, so
//! every downstream signal (including `on_subscribe`) runs on the scheduler.
//!
//! Upstream is asked for `prefetch` items up front and replenished in batches
//! of `prefetch - prefetch / 4` as downstream consumes them.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use tracing::warn;

use crate::context::Context;
use crate::demand::{to_request, validate_request, Demand};
use crate::error::{FluxError, ProtocolViolation};
use crate::hooks;
use crate::publisher::Publisher;
use crate::scheduler::{SchedulerRef, Worker};
use crate::subscriber::serialized::Delivering;
use crate::subscriber::{BoxSubscriber, Subscriber};
use crate::subscription::{Subscription, SubscriptionRef};
use crate::sync::{lock, Wip};

pub(crate) struct PublishOnPublisher<T> {
    source: Arc<dyn Publisher<T>>,
    scheduler: SchedulerRef,
    prefetch: usize,
}

impl<T> PublishOnPublisher<T> {
    pub(crate) fn new(source: Arc<dyn Publisher<T>>, scheduler: SchedulerRef, prefetch: usize) -> Self {
        Self {
            source,
            scheduler,
            prefetch,
        }
    }
}

impl<T: Send + 'static> Publisher<T> for PublishOnPublisher<T> {
    fn subscribe_boxed(&self, subscriber: BoxSubscriber<T>, context: Context) {
        let (tx, rx) = bounded(self.prefetch);
        let state = Arc::new_cyclic(|me| PublishOnState {
            me: me.clone(),
            downstream: Mutex::new(Some(subscriber)),
            worker: Worker::new(Arc::clone(&self.scheduler)),
            tx,
            rx,
            requested: Demand::new(),
            wip: Wip::new(),
            upstream: OnceLock::new(),
            subscribe_pending: AtomicBool::new(false),
            done: AtomicBool::new(false),
            delayed_error: Mutex::new(None),
            eager_error: Mutex::new(None),
            cancelled: AtomicBool::new(false),
            produced: AtomicUsize::new(0),
            prefetch: self.prefetch,
            limit: self.prefetch - self.prefetch / 4,
        });
        self.source
            .subscribe_boxed(Box::new(PublishOnSubscriber { state }), context);
    }
}

struct PublishOnState<T> {
    me: Weak<PublishOnState<T>>,
    // Locked only by the drain owner.
    downstream: Mutex<Option<BoxSubscriber<T>>>,
    worker: Arc<Worker>,
    tx: Sender<T>,
    rx: Receiver<T>,
    requested: Demand,
    wip: Wip,
    upstream: OnceLock<SubscriptionRef>,
    subscribe_pending: AtomicBool,
    done: AtomicBool,
    // Upstream failure, delivered after the queued items.
    delayed_error: Mutex<Option<FluxError>>,
    // Local failure (bad demand, overflow, rejection), delivered ahead of queued items.
    eager_error: Mutex<Option<FluxError>>,
    cancelled: AtomicBool,
    produced: AtomicUsize,
    prefetch: usize,
    limit: usize,
}

impl<T: Send + 'static> PublishOnState<T> {
    fn cancel_upstream(&self) {
        if let Some(upstream) = self.upstream.get() {
            upstream.cancel();
        }
    }

    fn fail_eager(&self, err: FluxError) {
        {
            let mut slot = lock(&self.eager_error);
            if slot.is_some() {
                drop(slot);
                hooks::on_error_dropped(&err);
                return;
            }
            *slot = Some(err);
        }
        self.cancel_upstream();
        self.schedule_drain();
    }

    fn schedule_drain(&self) {
        if !self.wip.enter() {
            return;
        }
        let Some(this) = self.me.upgrade() else {
            return;
        };
        let task = Arc::clone(&this);
        if let Err(err) = self.worker.schedule(Box::new(move || task.drain())) {
            warn!(scheduler = self.worker.scheduler_name(), error = %err, "publish_on drain rejected");
            {
                let mut slot = lock(&self.eager_error);
                if slot.is_none() {
                    *slot = Some(err);
                }
            }
            self.cancel_upstream();
            // We own the wip, so draining inline cannot overlap another drain.
            this.drain();
        }
    }

    fn drain(self: &Arc<Self>) {
        let _delivering = Delivering::enter();
        let mut missed = 1;
        loop {
            let mut guard = lock(&self.downstream);
            let Some(downstream) = guard.as_mut() else {
                return;
            };
            if self.cancelled.load(Ordering::Acquire) {
                guard.take();
                while self.rx.try_recv().is_ok() {}
                return;
            }
            if self.subscribe_pending.swap(false, Ordering::AcqRel) {
                downstream.on_subscribe(self.clone());
            }
            let eager = lock(&self.eager_error).take();
            if let Some(err) = eager {
                if let Some(mut downstream) = guard.take() {
                    downstream.on_error(err);
                }
                while self.rx.try_recv().is_ok() {}
                return;
            }

            while !self.requested.is_zero() && !self.cancelled.load(Ordering::Acquire) {
                let Ok(item) = self.rx.try_recv() else {
                    break;
                };
                let _ = self.requested.try_consume();
                downstream.on_next(item);
                let produced = self.produced.fetch_add(1, Ordering::Relaxed) + 1;
                if produced == self.limit {
                    self.produced.store(0, Ordering::Relaxed);
                    if let Some(upstream) = self.upstream.get() {
                        upstream.request(to_request(self.limit as u64));
                    }
                }
            }

            let done = self.done.load(Ordering::Acquire);
            if done && self.rx.is_empty() && !self.cancelled.load(Ordering::Acquire) {
                let error = lock(&self.delayed_error).take();
                if let Some(mut downstream) = guard.take() {
                    match error {
                        Some(err) => downstream.on_error(err),
                        None => downstream.on_complete(),
                    }
                }
                return;
            }
            drop(guard);

            missed = self.wip.leave(missed);
            if missed == 0 {
                break;
            }
        }
    }
}

impl<T: Send + 'static> Subscription for PublishOnState<T> {
    fn request(&self, n: i64) {
        match validate_request(n) {
            Ok(n) => {
                self.requested.add(n);
            }
            Err(err) => {
                let mut slot = lock(&self.eager_error);
                if slot.is_none() {
                    *slot = Some(err);
                }
                drop(slot);
                self.cancel_upstream();
            }
        }
        self.schedule_drain();
    }

    fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cancel_upstream();
        self.schedule_drain();
    }
}

struct PublishOnSubscriber<T> {
    state: Arc<PublishOnState<T>>,
}

impl<T: Send + 'static> Subscriber<T> for PublishOnSubscriber<T> {
    fn on_subscribe(&mut self, subscription: SubscriptionRef) {
        if self.state.upstream.set(subscription.clone()).is_err() {
            subscription.cancel();
            return;
        }
        self.state.subscribe_pending.store(true, Ordering::Release);
        self.state.schedule_drain();
        if !self.state.cancelled.load(Ordering::Acquire) {
            subscription.request(to_request(self.state.prefetch as u64));
        }
    }

    fn on_next(&mut self, item: T) {
        if self.state.done.load(Ordering::Acquire) {
            return;
        }
        match self.state.tx.try_send(item) {
            Ok(()) => self.state.schedule_drain(),
            Err(TrySendError::Full(_)) => {
                self.state.done.store(true, Ordering::Release);
                self.state.fail_eager(
                    ProtocolViolation::QueueOverflow {
                        stage: "publish_on",
                        capacity: self.state.prefetch,
                    }
                    .into(),
                );
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }

    fn on_error(&mut self, error: FluxError) {
        if self.state.done.swap(true, Ordering::AcqRel) {
            hooks::on_error_dropped(&error);
            return;
        }
        *lock(&self.state.delayed_error) = Some(error);
        self.state.schedule_drain();
    }

    fn on_complete(&mut self) {
        if self.state.done.swap(true, Ordering::AcqRel) {
            return;
        }
        self.state.schedule_drain();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use crate::error::FluxError;
    use crate::publisher::Flux;
    use crate::scheduler::{SchedulerConfig, SchedulerRef, Schedulers};
    use crate::testing::TestSubscriber;

    fn pool(name: &str) -> SchedulerRef {
        Schedulers::new_parallel(SchedulerConfig {
            name: name.to_string(),
            workers: 2,
            queue_capacity: 256,
        })
    }

    #[test]
    fn test_signals_arrive_on_scheduler_threads() {
        let scheduler = pool("publish-on-threads");
        let probe = TestSubscriber::new();
        Flux::range(0, 5)
            .publish_on(Arc::clone(&scheduler))
            .subscribe(probe.clone());
        assert!(probe.await_terminal(Duration::from_secs(5)));
        assert_eq!(probe.values(), vec![0, 1, 2, 3, 4]);
        assert!(probe
            .thread_names()
            .iter()
            .all(|name| name.starts_with("kyroflux-publish-on-threads-")));
        scheduler.dispose();
    }

    #[test]
    fn test_upstream_sees_only_prefetch() {
        let scheduler = pool("publish-on-prefetch");
        let produced = Arc::new(AtomicUsize::new(0));
        let p = Arc::clone(&produced);
        let probe = TestSubscriber::<i64>::manual();
        Flux::range(0, 100)
            .do_on_next(move |_| {
                p.fetch_add(1, Ordering::SeqCst);
            })
            .publish_on_prefetch(Arc::clone(&scheduler), 4)
            .subscribe(probe.clone());
        assert_eq!(produced.load(Ordering::SeqCst), 4);
        assert!(probe.values().is_empty());
        scheduler.dispose();
    }

    #[test]
    fn test_replenishes_in_batches_until_complete() {
        let scheduler = pool("publish-on-batches");
        let probe = TestSubscriber::with_request(10);
        Flux::range(0, 100)
            .publish_on_prefetch(Arc::clone(&scheduler), 8)
            .subscribe(probe.clone());
        assert!(probe.await_count(10, Duration::from_secs(5)));
        assert!(!probe.is_terminated());
        probe.request(90);
        assert!(probe.await_terminal(Duration::from_secs(5)));
        assert_eq!(probe.values(), (0..100).collect::<Vec<i64>>());
        assert!(!probe.is_overflowed());
        scheduler.dispose();
    }

    #[test]
    fn test_upstream_error_follows_queued_items() {
        let scheduler = pool("publish-on-error");
        let probe = TestSubscriber::new();
        Flux::range(0, 4)
            .try_map(|n| {
                if n < 3 {
                    Ok(n)
                } else {
                    Err(FluxError::upstream("late"))
                }
            })
            .publish_on(Arc::clone(&scheduler))
            .subscribe(probe.clone());
        assert!(probe.await_terminal(Duration::from_secs(5)));
        assert_eq!(probe.values(), vec![0, 1, 2]);
        assert!(probe.error().unwrap().is_upstream());
        scheduler.dispose();
    }

    #[test]
    fn test_illegal_demand_is_reported() {
        let scheduler = pool("publish-on-demand");
        let probe = TestSubscriber::<i64>::manual();
        Flux::range(0, 4)
            .publish_on(Arc::clone(&scheduler))
            .subscribe(probe.clone());
        assert!(probe.await_subscribed(Duration::from_secs(5)));
        probe.request(0);
        assert!(probe.await_terminal(Duration::from_secs(5)));
        assert!(probe.error().unwrap().is_illegal_demand());
        scheduler.dispose();
    }

    #[test]
    fn test_rejected_scheduler_fails_subscriber() {
        let scheduler = pool("publish-on-rejected");
        scheduler.dispose();
        let probe = TestSubscriber::new();
        Flux::just(vec![1])
            .publish_on(Arc::clone(&scheduler))
            .subscribe(probe.clone());
        assert!(probe.is_terminated());
        assert!(probe.error().unwrap().is_scheduler_rejection());
    }
}
