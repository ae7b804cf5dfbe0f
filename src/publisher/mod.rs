//! Publishers and the [`Flux`] assembly API.
//!
//! Assembling a chain only builds publishers; nothing runs until a subscriber
//! subscribes. Subscribe calls travel from the consumer toward the source,
//! carrying the [`Context`] as an explicit parameter; the subscription and the
//! signals travel back from the source toward the consumer.
//!
//! Every stage is one of a closed set of crate-private operator publishers.
//! [`Flux::stages`] exposes the assembled chain as [`StageKind`] values.

pub(crate) mod source;
pub(crate) mod timed;

use std::collections::HashSet;
use std::fmt;
use std::hash::Hash;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::context::Context;
use crate::error::{FluxError, FluxResult};
use crate::hot::{CachePublisher, SharePublisher};
use crate::operator::{
    ContextWritePublisher, FilterPublisher, FlatMapPublisher, LogPublisher, MapPublisher,
    OnErrorResumePublisher, PublishOnPublisher, ReducePublisher, SubscribeOnPublisher,
    TakePublisher,
};
use crate::scheduler::{SchedulerRef, DEFAULT_CONCURRENCY, DEFAULT_PREFETCH, SMALL_PREFETCH};
use crate::subscriber::blocking::{self, BlockingIter};
use crate::subscriber::{BoxSubscriber, Subscriber, SubscriberBuilder};
use crate::subscription::SubscriptionDisposable;

/// Source of a sequence of items.
///
/// `subscribe_boxed` must call the subscriber's `on_subscribe` exactly once
/// before any other signal. Each call yields an independent subscription.
pub trait Publisher<T>: Send + Sync {
    /// Subscribes `subscriber` with the subscription-scoped `context`.
    fn subscribe_boxed(&self, subscriber: BoxSubscriber<T>, context: Context);
}

/// One stage of an assembled chain.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum StageKind {
    Source { name: String },
    Map,
    Filter,
    Take { limit: u64 },
    Skip { count: u64 },
    Distinct,
    FlatMap { concurrency: usize, prefetch: usize },
    SubscribeOn { scheduler: String },
    PublishOn { scheduler: String, prefetch: usize },
    ContextWrite,
    OnErrorResume,
    Reduce { name: String },
    Share,
    Cache,
    Log { category: String },
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Source { name } => write!(f, "{name}"),
            Self::Map => write!(f, "map"),
            Self::Filter => write!(f, "filter"),
            Self::Take { limit } => write!(f, "take({limit})"),
            Self::Skip { count } => write!(f, "skip({count})"),
            Self::Distinct => write!(f, "distinct"),
            Self::FlatMap {
                concurrency,
                prefetch,
            } => write!(f, "flatMap({concurrency}, {prefetch})"),
            Self::SubscribeOn { scheduler } => write!(f, "subscribeOn({scheduler})"),
            Self::PublishOn {
                scheduler,
                prefetch,
            } => write!(f, "publishOn({scheduler}, {prefetch})"),
            Self::ContextWrite => write!(f, "contextWrite"),
            Self::OnErrorResume => write!(f, "onErrorResume"),
            Self::Reduce { name } => write!(f, "{name}"),
            Self::Share => write!(f, "share"),
            Self::Cache => write!(f, "cache"),
            Self::Log { category } => write!(f, "log({category})"),
        }
    }
}

/// A cold (unless shared or cached) sequence of `T`.
///
/// Cloning is cheap: clones share the assembled chain.
pub struct Flux<T> {
    publisher: Arc<dyn Publisher<T>>,
    stages: Arc<Vec<StageKind>>,
}

impl<T> Clone for Flux<T> {
    fn clone(&self) -> Self {
        Self {
            publisher: Arc::clone(&self.publisher),
            stages: Arc::clone(&self.stages),
        }
    }
}

impl<T> fmt::Debug for Flux<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stages: Vec<String> = self.stages.iter().map(ToString::to_string).collect();
        f.debug_struct("Flux").field("stages", &stages).finish()
    }
}

impl<T> Publisher<T> for Flux<T> {
    fn subscribe_boxed(&self, subscriber: BoxSubscriber<T>, context: Context) {
        self.publisher.subscribe_boxed(subscriber, context);
    }
}

impl<T: Send + 'static> Flux<T> {
    pub(crate) fn source(publisher: impl Publisher<T> + 'static, name: &str) -> Self {
        Self {
            publisher: Arc::new(publisher),
            stages: Arc::new(vec![StageKind::Source {
                name: name.to_string(),
            }]),
        }
    }

    fn then<U>(&self, publisher: impl Publisher<U> + 'static, stage: StageKind) -> Flux<U> {
        let mut stages = Vec::with_capacity(self.stages.len() + 1);
        stages.extend(self.stages.iter().cloned());
        stages.push(stage);
        Flux {
            publisher: Arc::new(publisher),
            stages: Arc::new(stages),
        }
    }

    fn upstream(&self) -> Arc<dyn Publisher<T>> {
        Arc::clone(&self.publisher)
    }

    /// The assembled chain, source first.
    #[must_use]
    pub fn stages(&self) -> &[StageKind] {
        &self.stages
    }

    /// Wraps a raw [`Publisher`] implementation.
    pub fn from_publisher(publisher: impl Publisher<T> + 'static) -> Self {
        Self::source(publisher, "fromPublisher")
    }

    // ---------------------------------------------------------------------
    // Subscribing
    // ---------------------------------------------------------------------

    /// Subscribes with an empty context.
    pub fn subscribe<S: Subscriber<T> + 'static>(&self, subscriber: S) {
        self.subscribe_with_context(subscriber, Context::empty());
    }

    /// Subscribes with an initial context, visible to every stage of the chain.
    pub fn subscribe_with_context<S: Subscriber<T> + 'static>(&self, subscriber: S, context: Context) {
        trace!(stages = ?self.stages, "subscribe");
        self.publisher.subscribe_boxed(Box::new(subscriber), context);
    }

    /// Subscribes a per-item callback with unbounded demand.
    ///
    /// Errors go to [`crate::hooks`]; dispose the result to cancel.
    pub fn subscribe_fn<F>(&self, on_next: F) -> SubscriptionDisposable
    where
        F: FnMut(T) + Send + 'static,
    {
        self.subscribe_with(SubscriberBuilder::new(on_next))
    }

    /// Subscribes a subscriber assembled from callbacks.
    pub fn subscribe_with(&self, builder: SubscriberBuilder<T>) -> SubscriptionDisposable {
        let subscriber = builder.build();
        let disposable = subscriber.disposable();
        self.subscribe(subscriber);
        disposable
    }

    // ---------------------------------------------------------------------
    // Blocking edge
    // ---------------------------------------------------------------------

    /// Blocks until the first item (then cancels) or the terminal signal.
    ///
    /// # Errors
    /// The sequence's error, or `BlockingInWorker` on a scheduler thread.
    pub fn block_first(&self) -> FluxResult<Option<T>> {
        blocking::block_first(self, None)
    }

    /// Blocks until the terminal signal and returns the last item.
    ///
    /// # Errors
    /// The sequence's error, or `BlockingInWorker` on a scheduler thread.
    pub fn block_last(&self) -> FluxResult<Option<T>> {
        blocking::block_last(self, None)
    }

    /// Like [`Flux::block_last`], giving up after `timeout`.
    ///
    /// # Errors
    /// `Timeout` if no terminal signal arrived in time; the subscription is cancelled.
    pub fn block_last_timeout(&self, timeout: Duration) -> FluxResult<Option<T>> {
        blocking::block_last(self, Some(timeout))
    }

    /// Iterates the sequence on the calling thread, `prefetch` items at a time.
    ///
    /// # Errors
    /// `BlockingInWorker` on a scheduler thread.
    pub fn to_blocking_iter(&self, prefetch: usize) -> FluxResult<BlockingIter<T>> {
        BlockingIter::new(self, prefetch)
    }

    /// Collects the whole sequence on the calling thread.
    ///
    /// # Errors
    /// The sequence's error, or `BlockingInWorker` on a scheduler thread.
    pub fn block_collect(&self) -> FluxResult<Vec<T>> {
        self.to_blocking_iter(SMALL_PREFETCH)?.collect()
    }

    // ---------------------------------------------------------------------
    // Transform
    // ---------------------------------------------------------------------

    /// Transforms each item.
    pub fn map<U, F>(&self, f: F) -> Flux<U>
    where
        U: Send + 'static,
        F: Fn(T) -> U + Send + Sync + 'static,
    {
        let publisher = MapPublisher::new(self.upstream(), move |item, _: &Context| Ok(f(item)));
        self.then(publisher, StageKind::Map)
    }

    /// Transforms each item; an `Err` cancels upstream and fails the sequence.
    pub fn try_map<U, F>(&self, f: F) -> Flux<U>
    where
        U: Send + 'static,
        F: Fn(T) -> FluxResult<U> + Send + Sync + 'static,
    {
        let publisher = MapPublisher::new(self.upstream(), move |item, _: &Context| f(item));
        self.then(publisher, StageKind::Map)
    }

    /// Transforms each item with read access to the subscription's context.
    pub fn map_with_context<U, F>(&self, f: F) -> Flux<U>
    where
        U: Send + 'static,
        F: Fn(T, &Context) -> U + Send + Sync + 'static,
    {
        let publisher = MapPublisher::new(self.upstream(), move |item, ctx: &Context| Ok(f(item, ctx)));
        self.then(publisher, StageKind::Map)
    }

    /// Runs `f` for each item before passing it on.
    #[must_use]
    pub fn do_on_next<F>(&self, f: F) -> Self
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let publisher = MapPublisher::new(
            self.upstream(),
            move |item, _: &Context| {
                f(&item);
                Ok(item)
            },
        );
        self.then(publisher, StageKind::Map)
    }

    /// Pairs each item with the wall-clock time it passed this stage.
    pub fn timestamp(&self) -> Flux<(DateTime<Utc>, T)> {
        let publisher = MapPublisher::new(self.upstream(), |item, _: &Context| Ok((Utc::now(), item)));
        self.then(publisher, StageKind::Map)
    }

    /// Keeps items matching `predicate`; each dropped item is re-requested upstream.
    #[must_use]
    pub fn filter<F>(&self, predicate: F) -> Self
    where
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        let predicate = Arc::new(predicate);
        let publisher = FilterPublisher::new(
            self.upstream(),
            move || {
                let predicate = Arc::clone(&predicate);
                Box::new(move |item: &T| predicate(item))
            },
        );
        self.then(publisher, StageKind::Filter)
    }

    /// Drops the first `count` items.
    #[must_use]
    pub fn skip(&self, count: u64) -> Self {
        let publisher = FilterPublisher::new(
            self.upstream(),
            move || {
                let mut remaining = count;
                Box::new(move |_: &T| {
                    if remaining == 0 {
                        true
                    } else {
                        remaining -= 1;
                        false
                    }
                })
            },
        );
        self.then(publisher, StageKind::Skip { count })
    }

    /// Emits at most `limit` items, then cancels upstream and completes.
    #[must_use]
    pub fn take(&self, limit: u64) -> Self {
        self.then(TakePublisher::new(self.upstream(), limit), StageKind::Take { limit })
    }

    /// Maps each item to an inner sequence and merges them.
    ///
    /// At most `concurrency` inner sequences are active at once, each with
    /// `prefetch` items buffered ahead of downstream demand. Items of
    /// different inner sequences may interleave; with `concurrency == 1` the
    /// inner sequences follow source order.
    pub fn flat_map<U, F>(&self, f: F, concurrency: usize, prefetch: usize) -> Flux<U>
    where
        U: Send + 'static,
        F: Fn(T) -> Flux<U> + Send + Sync + 'static,
    {
        let concurrency = concurrency.max(1);
        let prefetch = prefetch.max(1);
        let publisher = FlatMapPublisher::new(self.upstream(), f, concurrency, prefetch);
        self.then(
            publisher,
            StageKind::FlatMap {
                concurrency,
                prefetch,
            },
        )
    }

    /// `flat_map` with the default concurrency and prefetch.
    pub fn flat_map_default<U, F>(&self, f: F) -> Flux<U>
    where
        U: Send + 'static,
        F: Fn(T) -> Flux<U> + Send + Sync + 'static,
    {
        self.flat_map(f, DEFAULT_CONCURRENCY, DEFAULT_PREFETCH)
    }

    /// Maps each item to an inner sequence and concatenates them in source order.
    pub fn concat_map<U, F>(&self, f: F) -> Flux<U>
    where
        U: Send + 'static,
        F: Fn(T) -> Flux<U> + Send + Sync + 'static,
    {
        self.flat_map(f, 1, SMALL_PREFETCH)
    }

    // ---------------------------------------------------------------------
    // Combine
    // ---------------------------------------------------------------------

    /// Subscribes to every source at once and interleaves their items.
    #[must_use]
    pub fn merge(sources: Vec<Flux<T>>) -> Self {
        let concurrency = sources.len();
        Flux::just(sources).flat_map(|source| source, concurrency, SMALL_PREFETCH)
    }

    /// Subscribes to each source only after the previous one completed.
    #[must_use]
    pub fn concat(sources: Vec<Flux<T>>) -> Self {
        Flux::just(sources).flat_map(|source| source, 1, SMALL_PREFETCH)
    }

    /// Merges this sequence with `other`.
    #[must_use]
    pub fn merge_with(&self, other: &Flux<T>) -> Self {
        Self::merge(vec![self.clone(), other.clone()])
    }

    // ---------------------------------------------------------------------
    // Scheduling
    // ---------------------------------------------------------------------

    /// Runs the subscription and every upstream `request` on `scheduler`.
    #[must_use]
    pub fn subscribe_on(&self, scheduler: SchedulerRef) -> Self {
        let stage = StageKind::SubscribeOn {
            scheduler: scheduler.name().to_string(),
        };
        self.then(SubscribeOnPublisher::new(self.upstream(), scheduler), stage)
    }

    /// Delivers downstream signals on `scheduler` with the default prefetch.
    #[must_use]
    pub fn publish_on(&self, scheduler: SchedulerRef) -> Self {
        self.publish_on_prefetch(scheduler, DEFAULT_PREFETCH)
    }

    /// Delivers downstream signals on `scheduler`, buffering at most `prefetch` items.
    #[must_use]
    pub fn publish_on_prefetch(&self, scheduler: SchedulerRef, prefetch: usize) -> Self {
        let prefetch = prefetch.max(1);
        let stage = StageKind::PublishOn {
            scheduler: scheduler.name().to_string(),
            prefetch,
        };
        self.then(PublishOnPublisher::new(self.upstream(), scheduler, prefetch), stage)
    }

    // ---------------------------------------------------------------------
    // Context
    // ---------------------------------------------------------------------

    /// Rewrites the context seen by every stage upstream of this one.
    #[must_use]
    pub fn context_write<F>(&self, f: F) -> Self
    where
        F: Fn(Context) -> Context + Send + Sync + 'static,
    {
        self.then(ContextWritePublisher::new(self.upstream(), f), StageKind::ContextWrite)
    }

    // ---------------------------------------------------------------------
    // Recovery
    // ---------------------------------------------------------------------

    /// Replaces an upstream error with the sequence returned by `fallback`.
    ///
    /// Outstanding demand carries over to the fallback. `IllegalDemand`
    /// caused by this chain's own subscriber is not recovered.
    #[must_use]
    pub fn on_error_resume<F>(&self, fallback: F) -> Self
    where
        F: Fn(FluxError) -> Flux<T> + Send + Sync + 'static,
    {
        self.then(
            OnErrorResumePublisher::new(self.upstream(), fallback),
            StageKind::OnErrorResume,
        )
    }

    // ---------------------------------------------------------------------
    // Reduce
    // ---------------------------------------------------------------------

    /// Emits the number of items once upstream completes.
    pub fn count(&self) -> Flux<u64> {
        let publisher = ReducePublisher::new(
            self.upstream(),
            || 0u64,
            |n: u64, _| ControlFlow::Continue(n + 1),
        );
        self.then(publisher, StageKind::Reduce { name: "count".into() })
    }

    /// Emits all items as one `Vec` once upstream completes.
    pub fn collect_list(&self) -> Flux<Vec<T>> {
        let publisher = ReducePublisher::new(
            self.upstream(),
            Vec::new,
            |mut acc: Vec<T>, item| {
                acc.push(item);
                ControlFlow::Continue(acc)
            },
        );
        self.then(publisher, StageKind::Reduce { name: "collectList".into() })
    }

    /// Emits whether every item matches; stops at the first mismatch.
    pub fn all<F>(&self, predicate: F) -> Flux<bool>
    where
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        let publisher = ReducePublisher::new(
            self.upstream(),
            || true,
            move |_, item: T| {
                if predicate(&item) {
                    ControlFlow::Continue(true)
                } else {
                    ControlFlow::Break(false)
                }
            },
        );
        self.then(publisher, StageKind::Reduce { name: "all".into() })
    }

    /// Emits whether any item matches; stops at the first match.
    pub fn any<F>(&self, predicate: F) -> Flux<bool>
    where
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        let publisher = ReducePublisher::new(
            self.upstream(),
            || false,
            move |_, item: T| {
                if predicate(&item) {
                    ControlFlow::Break(true)
                } else {
                    ControlFlow::Continue(false)
                }
            },
        );
        self.then(publisher, StageKind::Reduce { name: "any".into() })
    }

    /// Folds the sequence into one value emitted on completion.
    pub fn reduce<A, F>(&self, initial: A, f: F) -> Flux<A>
    where
        A: Clone + Send + Sync + 'static,
        F: Fn(A, T) -> A + Send + Sync + 'static,
    {
        let publisher = ReducePublisher::new(
            self.upstream(),
            move || initial.clone(),
            move |acc, item| ControlFlow::Continue(f(acc, item)),
        );
        self.then(publisher, StageKind::Reduce { name: "reduce".into() })
    }
}

impl<T: Clone + Send + Sync + 'static> Flux<T> {
    /// Replaces an upstream error with a single `value`, then completes.
    #[must_use]
    pub fn on_error_return(&self, value: T) -> Self {
        self.on_error_resume(move |_| Flux::just(vec![value.clone()]))
    }

    /// Delays each item by `delay` on `scheduler`, one at a time.
    #[must_use]
    pub fn delay_elements(&self, delay: Duration, scheduler: SchedulerRef) -> Self {
        self.flat_map(
            move |item| Flux::timer(delay, Arc::clone(&scheduler)).map(move |_| item.clone()),
            1,
            1,
        )
    }

    /// Multicasts one upstream subscription to every current subscriber.
    ///
    /// The first subscriber connects; late subscribers miss earlier items;
    /// the upstream is cancelled once the last subscriber leaves.
    #[must_use]
    pub fn share(&self) -> Self {
        self.then(SharePublisher::new(self.upstream()), StageKind::Share)
    }

    /// Runs upstream at most once and replays its recorded outcome to every subscriber.
    #[must_use]
    pub fn cache(&self) -> Self {
        self.then(CachePublisher::new(self.upstream()), StageKind::Cache)
    }
}

impl<T: Clone + Eq + Hash + Send + 'static> Flux<T> {
    /// Drops items already seen by this subscription.
    #[must_use]
    pub fn distinct(&self) -> Self {
        let publisher = FilterPublisher::new(
            self.upstream(),
            || {
                let mut seen = HashSet::new();
                Box::new(move |item: &T| seen.insert(item.clone()))
            },
        );
        self.then(publisher, StageKind::Distinct)
    }
}

impl<T: fmt::Debug + Send + 'static> Flux<T> {
    /// Logs every signal, request and cancel at `info` under `category`.
    #[must_use]
    pub fn log(&self, category: &str) -> Self {
        let stage = StageKind::Log {
            category: category.to_string(),
        };
        self.then(LogPublisher::new(self.upstream(), category), stage)
    }
}
