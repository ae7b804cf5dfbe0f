//! Merging of inner sequences.
//!
//! The coordinator keeps one bounded queue per active inner sequence. Inner
//! subscribers only enqueue and signal; a single drain owner (see
//! [`Wip`]) moves items from the queues to downstream against downstream
//! demand, replenishes inner demand in batches and asks the main upstream for
//! a new item whenever an inner sequence finishes.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use tracing::trace;

use crate::context::Context;
use crate::demand::{to_request, validate_request, Demand};
use crate::error::{FluxError, ProtocolViolation};
use crate::hooks;
use crate::publisher::{Flux, Publisher};
use crate::subscriber::serialized::SerializedSink;
use crate::subscriber::{BoxSubscriber, Subscriber};
use crate::subscription::{Subscription, SubscriptionRef};
use crate::sync::{lock, Wip};

type Mapper<T, U> = Arc<dyn Fn(T) -> Flux<U> + Send + Sync>;

pub(crate) struct FlatMapPublisher<T, U> {
    source: Arc<dyn Publisher<T>>,
    mapper: Mapper<T, U>,
    concurrency: usize,
    prefetch: usize,
}

impl<T, U> FlatMapPublisher<T, U> {
    pub(crate) fn new<F>(
        source: Arc<dyn Publisher<T>>,
        mapper: F,
        concurrency: usize,
        prefetch: usize,
    ) -> Self
    where
        F: Fn(T) -> Flux<U> + Send + Sync + 'static,
    {
        Self {
            source,
            mapper: Arc::new(mapper),
            concurrency,
            prefetch,
        }
    }
}

impl<T: Send + 'static, U: Send + 'static> Publisher<U> for FlatMapPublisher<T, U> {
    fn subscribe_boxed(&self, subscriber: BoxSubscriber<U>, context: Context) {
        let coordinator = Arc::new(Coordinator {
            sink: SerializedSink::new(subscriber),
            requested: Demand::new(),
            wip: Wip::new(),
            upstream: OnceLock::new(),
            inners: Mutex::new(Vec::new()),
            main_done: AtomicBool::new(false),
            error: Mutex::new(None),
            cancelled: AtomicBool::new(false),
            terminated: AtomicBool::new(false),
            prefetch: self.prefetch,
            limit: self.prefetch - self.prefetch / 4,
        });
        let main = MainSubscriber {
            coordinator,
            mapper: Arc::clone(&self.mapper),
            context: context.clone(),
            concurrency: self.concurrency,
        };
        self.source.subscribe_boxed(Box::new(main), context);
    }
}

struct InnerSlot<U> {
    tx: Sender<U>,
    rx: Receiver<U>,
    done: AtomicBool,
    // Items emitted since inner demand was last replenished. Drain-owner only.
    produced: AtomicUsize,
    upstream: OnceLock<SubscriptionRef>,
}

impl<U> InnerSlot<U> {
    fn new(prefetch: usize) -> Self {
        let (tx, rx) = bounded(prefetch);
        Self {
            tx,
            rx,
            done: AtomicBool::new(false),
            produced: AtomicUsize::new(0),
            upstream: OnceLock::new(),
        }
    }

    fn cancel(&self) {
        self.done.store(true, Ordering::Release);
        if let Some(upstream) = self.upstream.get() {
            upstream.cancel();
        }
    }
}

struct Coordinator<U> {
    sink: SerializedSink<U>,
    requested: Demand,
    wip: Wip,
    upstream: OnceLock<SubscriptionRef>,
    inners: Mutex<Vec<Arc<InnerSlot<U>>>>,
    main_done: AtomicBool,
    error: Mutex<Option<FluxError>>,
    cancelled: AtomicBool,
    terminated: AtomicBool,
    prefetch: usize,
    limit: usize,
}

impl<U: Send + 'static> Coordinator<U> {
    fn is_stopped(&self) -> bool {
        self.cancelled.load(Ordering::Acquire) || self.terminated.load(Ordering::Acquire)
    }

    fn request_main(&self, n: u64) {
        if self.is_stopped() || self.main_done.load(Ordering::Acquire) {
            return;
        }
        if let Some(upstream) = self.upstream.get() {
            upstream.request(to_request(n));
        }
    }

    fn cancel_all(&self) {
        if let Some(upstream) = self.upstream.get() {
            upstream.cancel();
        }
        let inners: Vec<_> = lock(&self.inners).drain(..).collect();
        for inner in inners {
            inner.cancel();
        }
    }

    fn fail(&self, err: FluxError) {
        {
            let mut slot = lock(&self.error);
            if slot.is_some() || self.is_stopped() {
                drop(slot);
                hooks::on_error_dropped(&err);
                return;
            }
            *slot = Some(err);
        }
        self.cancel_all();
        self.drain();
    }

    fn drain(&self) {
        if !self.wip.enter() {
            return;
        }
        let mut missed = 1;
        loop {
            if self.cancelled.load(Ordering::Acquire) {
                self.cancel_all();
                return;
            }
            let error = lock(&self.error).take();
            if let Some(err) = error {
                self.terminated.store(true, Ordering::Release);
                self.sink.error(err);
                return;
            }

            let main_done = self.main_done.load(Ordering::Acquire);
            let snapshot: Vec<_> = lock(&self.inners).clone();
            let mut finished = Vec::new();
            for inner in &snapshot {
                self.drain_inner(inner);
                if self.cancelled.load(Ordering::Acquire) {
                    break;
                }
                // Read `done` before the emptiness check: an item enqueued
                // before completion is then always observed.
                let done = inner.done.load(Ordering::Acquire);
                if done && inner.rx.is_empty() {
                    finished.push(Arc::clone(inner));
                }
            }

            if !finished.is_empty() {
                lock(&self.inners).retain(|i| !finished.iter().any(|f| Arc::ptr_eq(i, f)));
                trace!(finished = finished.len(), "flat_map inner sequences finished");
                self.request_main(finished.len() as u64);
            }

            if main_done && lock(&self.inners).is_empty() && lock(&self.error).is_none() {
                if !self.terminated.swap(true, Ordering::AcqRel) {
                    self.sink.complete();
                }
                return;
            }

            missed = self.wip.leave(missed);
            if missed == 0 {
                break;
            }
        }
    }

    fn drain_inner(&self, inner: &InnerSlot<U>) {
        while !self.requested.is_zero() && !self.cancelled.load(Ordering::Acquire) {
            let Ok(item) = inner.rx.try_recv() else {
                break;
            };
            // Only the drain owner consumes, so the demand seen above is still there.
            let _ = self.requested.try_consume();
            self.sink.next(item);
            let produced = inner.produced.fetch_add(1, Ordering::Relaxed) + 1;
            if produced == self.limit {
                inner.produced.store(0, Ordering::Relaxed);
                if !inner.done.load(Ordering::Acquire) {
                    if let Some(upstream) = inner.upstream.get() {
                        upstream.request(to_request(self.limit as u64));
                    }
                }
            }
        }
    }
}

impl<U: Send + 'static> Subscription for Coordinator<U> {
    fn request(&self, n: i64) {
        match validate_request(n) {
            Ok(n) => {
                self.requested.add(n);
                self.drain();
            }
            Err(err) => self.fail(err),
        }
    }

    fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        self.sink.cancel();
        self.drain();
    }
}

struct MainSubscriber<T, U> {
    coordinator: Arc<Coordinator<U>>,
    mapper: Mapper<T, U>,
    context: Context,
    concurrency: usize,
}

impl<T, U: Send + 'static> Subscriber<T> for MainSubscriber<T, U> {
    fn on_subscribe(&mut self, subscription: SubscriptionRef) {
        if self.coordinator.upstream.set(subscription.clone()).is_err() {
            subscription.cancel();
            return;
        }
        self.coordinator.sink.on_subscribe(self.coordinator.clone());
        self.coordinator.request_main(self.concurrency as u64);
    }

    fn on_next(&mut self, item: T) {
        if self.coordinator.is_stopped() {
            return;
        }
        let inner = (self.mapper)(item);
        let slot = Arc::new(InnerSlot::new(self.coordinator.prefetch));
        lock(&self.coordinator.inners).push(Arc::clone(&slot));
        let subscriber = InnerSubscriber {
            slot,
            coordinator: Arc::clone(&self.coordinator),
        };
        inner.subscribe_boxed(Box::new(subscriber), self.context.clone());
    }

    fn on_error(&mut self, error: FluxError) {
        self.coordinator.fail(error);
    }

    fn on_complete(&mut self) {
        self.coordinator.main_done.store(true, Ordering::Release);
        self.coordinator.drain();
    }
}

struct InnerSubscriber<U> {
    slot: Arc<InnerSlot<U>>,
    coordinator: Arc<Coordinator<U>>,
}

impl<U: Send + 'static> Subscriber<U> for InnerSubscriber<U> {
    fn on_subscribe(&mut self, subscription: SubscriptionRef) {
        if self.slot.upstream.set(subscription.clone()).is_err() || self.coordinator.is_stopped() {
            subscription.cancel();
            return;
        }
        subscription.request(to_request(self.coordinator.prefetch as u64));
    }

    fn on_next(&mut self, item: U) {
        if self.slot.done.load(Ordering::Acquire) {
            return;
        }
        match self.slot.tx.try_send(item) {
            Ok(()) => self.coordinator.drain(),
            Err(TrySendError::Full(_)) => {
                self.slot.cancel();
                self.coordinator.fail(
                    ProtocolViolation::QueueOverflow {
                        stage: "flat_map",
                        capacity: self.coordinator.prefetch,
                    }
                    .into(),
                );
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }

    fn on_error(&mut self, error: FluxError) {
        self.slot.done.store(true, Ordering::Release);
        self.coordinator.fail(error);
    }

    fn on_complete(&mut self) {
        self.slot.done.store(true, Ordering::Release);
        self.coordinator.drain();
    }
}
