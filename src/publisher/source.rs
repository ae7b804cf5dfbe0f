//! Cold sources.
//!
//! Every source here re-runs its generation logic per subscriber. Items are
//! produced only against outstanding demand; an exhausted source completes
//! even when nothing was requested.

use std::iter::Peekable;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::context::Context;
use crate::demand::{validate_request, Demand};
use crate::error::{FluxError, FluxResult};
use crate::subscriber::serialized::SerializedSink;
use crate::subscriber::BoxSubscriber;
use crate::subscription::{NoopSubscription, Subscription};
use crate::sync::{lock, Wip};

use super::{Flux, Publisher};

struct IterPublisher<F> {
    factory: F,
}

impl<T, I, F> Publisher<T> for IterPublisher<F>
where
    T: Send + 'static,
    I: IntoIterator<Item = T>,
    I::IntoIter: Send + 'static,
    F: Fn() -> I + Send + Sync,
{
    fn subscribe_boxed(&self, subscriber: BoxSubscriber<T>, _context: Context) {
        let subscription = Arc::new(IterSubscription {
            iter: Mutex::new((self.factory)().into_iter().peekable()),
            demand: Demand::new(),
            wip: Wip::new(),
            started: AtomicBool::new(false),
            done: AtomicBool::new(false),
            sink: SerializedSink::new(subscriber),
        });
        subscription.sink.on_subscribe(subscription.clone());
        subscription.started.store(true, Ordering::Release);
        subscription.drain();
    }
}

enum Step<T> {
    Emit(T),
    Exhausted,
    Idle,
}

struct IterSubscription<I: Iterator> {
    iter: Mutex<Peekable<I>>,
    demand: Demand,
    wip: Wip,
    // Set once `on_subscribe` returned; demand requested inside it is served afterwards.
    started: AtomicBool,
    done: AtomicBool,
    sink: SerializedSink<I::Item>,
}

impl<I> IterSubscription<I>
where
    I: Iterator + Send,
    I::Item: Send + 'static,
{
    fn drain(&self) {
        if !self.started.load(Ordering::Acquire) || !self.wip.enter() {
            return;
        }
        let mut missed = 1;
        loop {
            while !self.done.load(Ordering::Acquire) && !self.sink.is_cancelled() {
                let step = {
                    let mut iter = lock(&self.iter);
                    if iter.peek().is_none() {
                        Step::Exhausted
                    } else if self.demand.try_consume() {
                        iter.next().map_or(Step::Exhausted, Step::Emit)
                    } else {
                        Step::Idle
                    }
                };
                match step {
                    Step::Emit(item) => self.sink.next(item),
                    Step::Exhausted => {
                        if !self.done.swap(true, Ordering::AcqRel) {
                            self.sink.complete();
                        }
                    }
                    Step::Idle => break,
                }
            }
            missed = self.wip.leave(missed);
            if missed == 0 {
                break;
            }
        }
    }

    fn fail(&self, err: FluxError) {
        if !self.done.swap(true, Ordering::AcqRel) {
            self.sink.error(err);
        }
    }
}

impl<I> Subscription for IterSubscription<I>
where
    I: Iterator + Send,
    I::Item: Send + 'static,
{
    fn request(&self, n: i64) {
        match validate_request(n) {
            Ok(n) => {
                self.demand.add(n);
                self.drain();
            }
            Err(err) => self.fail(err),
        }
    }

    fn cancel(&self) {
        self.done.store(true, Ordering::Release);
        self.sink.cancel();
    }
}

/// Subscription of a source that never emits, only validating demand.
struct IdleSubscription<T> {
    sink: SerializedSink<T>,
}

impl<T: Send + 'static> Subscription for IdleSubscription<T> {
    fn request(&self, n: i64) {
        if let Err(err) = validate_request(n) {
            self.sink.error(err);
        }
    }

    fn cancel(&self) {
        self.sink.cancel();
    }
}

enum Immediate {
    Complete,
    Error(FluxError),
    Never,
}

struct ImmediatePublisher {
    outcome: Immediate,
}

impl<T: Send + 'static> Publisher<T> for ImmediatePublisher {
    fn subscribe_boxed(&self, mut subscriber: BoxSubscriber<T>, _context: Context) {
        match &self.outcome {
            Immediate::Complete => {
                subscriber.on_subscribe(Arc::new(NoopSubscription));
                subscriber.on_complete();
            }
            Immediate::Error(err) => {
                subscriber.on_subscribe(Arc::new(NoopSubscription));
                subscriber.on_error(err.clone());
            }
            Immediate::Never => {
                let subscription = Arc::new(IdleSubscription {
                    sink: SerializedSink::new(subscriber),
                });
                subscription.sink.on_subscribe(subscription.clone());
            }
        }
    }
}

struct DeferPublisher<F> {
    factory: F,
}

impl<T, F> Publisher<T> for DeferPublisher<F>
where
    T: Send + 'static,
    F: Fn(&Context) -> Flux<T> + Send + Sync,
{
    fn subscribe_boxed(&self, subscriber: BoxSubscriber<T>, context: Context) {
        (self.factory)(&context).subscribe_boxed(subscriber, context);
    }
}

impl<T: Send + 'static> Flux<T> {
    /// Emits the items of a fresh iterator built per subscriber.
    pub fn generate<I, F>(factory: F) -> Self
    where
        I: IntoIterator<Item = T>,
        I::IntoIter: Send + 'static,
        F: Fn() -> I + Send + Sync + 'static,
    {
        Self::source(IterPublisher { factory }, "generate")
    }

    /// Emits the items of `iter`, cloned for every subscriber.
    pub fn from_iter<I>(iter: I) -> Self
    where
        I: IntoIterator<Item = T> + Clone + Send + Sync + 'static,
        I::IntoIter: Send + 'static,
    {
        Self::source(
            IterPublisher {
                factory: move || iter.clone(),
            },
            "fromIter",
        )
    }

    /// Completes without emitting.
    #[must_use]
    pub fn empty() -> Self {
        Self::source(
            ImmediatePublisher {
                outcome: Immediate::Complete,
            },
            "empty",
        )
    }

    /// Fails every subscriber with `err`.
    #[must_use]
    pub fn error(err: FluxError) -> Self {
        Self::source(
            ImmediatePublisher {
                outcome: Immediate::Error(err),
            },
            "error",
        )
    }

    /// Never signals anything after `on_subscribe`.
    #[must_use]
    pub fn never() -> Self {
        Self::source(
            ImmediatePublisher {
                outcome: Immediate::Never,
            },
            "never",
        )
    }

    /// Builds the actual sequence lazily, once per subscriber.
    pub fn defer<F>(factory: F) -> Self
    where
        F: Fn() -> Flux<T> + Send + Sync + 'static,
    {
        Self::source(
            DeferPublisher {
                factory: move |_: &Context| factory(),
            },
            "defer",
        )
    }

    /// Builds the actual sequence lazily from the subscriber's context.
    pub fn defer_contextual<F>(factory: F) -> Self
    where
        F: Fn(&Context) -> Flux<T> + Send + Sync + 'static,
    {
        Self::source(DeferPublisher { factory }, "deferContextual")
    }

    /// Calls `f` once per subscriber and emits its value, or fails with its error.
    pub fn from_callable<F>(f: F) -> Self
    where
        F: Fn() -> FluxResult<T> + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        Self::source(
            DeferPublisher {
                factory: move |_: &Context| match f() {
                    Ok(value) => {
                        let slot = Mutex::new(Some(value));
                        Flux::generate(move || lock(&slot).take())
                    }
                    Err(err) => Flux::error(err),
                },
            },
            "fromCallable",
        )
    }
}

impl<T: Clone + Send + Sync + 'static> Flux<T> {
    /// Emits `items` in order.
    #[must_use]
    pub fn just(items: Vec<T>) -> Self {
        Self::source(
            IterPublisher {
                factory: move || items.clone(),
            },
            "just",
        )
    }
}

impl Flux<i64> {
    /// Emits `count` consecutive integers starting at `start`.
    #[must_use]
    pub fn range(start: i64, count: usize) -> Self {
        Self::source(
            IterPublisher {
                factory: move || (start..).take(count),
            },
            "range",
        )
    }
}
