use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use crate::context::Context;
use crate::demand::{validate_request, UNBOUNDED};
use crate::error::FluxError;
use crate::hooks;
use crate::publisher::Publisher;
use crate::subscriber::serialized::SerializedSink;
use crate::subscriber::{BoxSubscriber, Subscriber};
use crate::subscription::{Subscription, SubscriptionRef};
use crate::sync::lock;

type Init<A> = Arc<dyn Fn() -> A + Send + Sync>;
type Step<A, T> = Arc<dyn Fn(A, T) -> ControlFlow<A, A> + Send + Sync>;

/// Folds upstream into a single value emitted once upstream completes.
///
/// The fold requests unbounded demand upstream; downstream demand only gates
/// the single emission. `Break` ends the fold early and cancels upstream.
pub(crate) struct ReducePublisher<T, A> {
    source: Arc<dyn Publisher<T>>,
    init: Init<A>,
    step: Step<A, T>,
}

impl<T, A> ReducePublisher<T, A> {
    pub(crate) fn new<I, S>(source: Arc<dyn Publisher<T>>, init: I, step: S) -> Self
    where
        I: Fn() -> A + Send + Sync + 'static,
        S: Fn(A, T) -> ControlFlow<A, A> + Send + Sync + 'static,
    {
        Self {
            source,
            init: Arc::new(init),
            step: Arc::new(step),
        }
    }
}

impl<T: Send + 'static, A: Send + 'static> Publisher<A> for ReducePublisher<T, A> {
    fn subscribe_boxed(&self, subscriber: BoxSubscriber<A>, context: Context) {
        let shared = Arc::new(ReduceShared {
            sink: SerializedSink::new(subscriber),
            value: Mutex::new(None),
            ready: AtomicBool::new(false),
            requested: AtomicBool::new(false),
            emitted: AtomicBool::new(false),
            upstream: OnceLock::new(),
        });
        let fold = FoldSubscriber {
            shared,
            acc: Some((self.init)()),
            step: Arc::clone(&self.step),
            done: false,
        };
        self.source.subscribe_boxed(Box::new(fold), context);
    }
}

struct ReduceShared<A> {
    sink: SerializedSink<A>,
    value: Mutex<Option<A>>,
    ready: AtomicBool,
    requested: AtomicBool,
    emitted: AtomicBool,
    upstream: OnceLock<SubscriptionRef>,
}

impl<A: Send + 'static> ReduceShared<A> {
    fn try_emit(&self) {
        if !self.ready.load(Ordering::Acquire) || !self.requested.load(Ordering::Acquire) {
            return;
        }
        if self.emitted.swap(true, Ordering::AcqRel) {
            return;
        }
        let value = lock(&self.value).take();
        if let Some(value) = value {
            self.sink.next(value);
        }
        self.sink.complete();
    }

    fn cancel_upstream(&self) {
        if let Some(upstream) = self.upstream.get() {
            upstream.cancel();
        }
    }
}

impl<A: Send + 'static> Subscription for ReduceShared<A> {
    fn request(&self, n: i64) {
        match validate_request(n) {
            Ok(_) => {
                self.requested.store(true, Ordering::Release);
                self.try_emit();
            }
            Err(err) => {
                self.cancel_upstream();
                if !self.emitted.swap(true, Ordering::AcqRel) {
                    self.sink.error(err);
                }
            }
        }
    }

    fn cancel(&self) {
        self.cancel_upstream();
        self.sink.cancel();
    }
}

struct FoldSubscriber<T, A> {
    shared: Arc<ReduceShared<A>>,
    acc: Option<A>,
    step: Step<A, T>,
    done: bool,
}

impl<T, A> FoldSubscriber<T, A>
where
    A: Send + 'static,
{
    fn finish(&mut self) {
        self.done = true;
        *lock(&self.shared.value) = self.acc.take();
        self.shared.ready.store(true, Ordering::Release);
        self.shared.try_emit();
    }
}

impl<T, A: Send + 'static> Subscriber<T> for FoldSubscriber<T, A> {
    fn on_subscribe(&mut self, subscription: SubscriptionRef) {
        if self.shared.upstream.set(subscription.clone()).is_err() {
            subscription.cancel();
            return;
        }
        self.shared.sink.on_subscribe(self.shared.clone());
        if !self.shared.sink.is_done() {
            subscription.request(UNBOUNDED);
        }
    }

    fn on_next(&mut self, item: T) {
        if self.done {
            return;
        }
        let Some(acc) = self.acc.take() else {
            return;
        };
        match (self.step)(acc, item) {
            ControlFlow::Continue(acc) => self.acc = Some(acc),
            ControlFlow::Break(acc) => {
                self.acc = Some(acc);
                self.shared.cancel_upstream();
                self.finish();
            }
        }
    }

    fn on_error(&mut self, error: FluxError) {
        if self.done {
            hooks::on_error_dropped(&error);
            return;
        }
        self.done = true;
        self.acc = None;
        if self.shared.emitted.swap(true, Ordering::AcqRel) {
            hooks::on_error_dropped(&error);
        } else {
            self.shared.sink.error(error);
        }
    }

    fn on_complete(&mut self) {
        if !self.done {
            self.finish();
        }
    }
}
