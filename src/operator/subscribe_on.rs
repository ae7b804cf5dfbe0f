use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::context::Context;
use crate::demand::{to_request, validate_request};
use crate::error::FluxError;
use crate::publisher::Publisher;
use crate::scheduler::{SchedulerRef, Worker};
use crate::subscriber::serialized::SerializedSink;
use crate::subscriber::{BoxSubscriber, Subscriber};
use crate::subscription::{Disposable, Subscription, SubscriptionRef};
use crate::sync::lock;

/// Subscribes upstream on a scheduler and relocates every upstream `request` there.
///
/// Downstream receives `on_subscribe` right away; demand requested before the
/// upstream subscription exists is accumulated and forwarded once it does.
pub(crate) struct SubscribeOnPublisher<T> {
    source: Arc<dyn Publisher<T>>,
    scheduler: SchedulerRef,
}

impl<T> SubscribeOnPublisher<T> {
    pub(crate) fn new(source: Arc<dyn Publisher<T>>, scheduler: SchedulerRef) -> Self {
        Self { source, scheduler }
    }
}

impl<T: Send + 'static> Publisher<T> for SubscribeOnPublisher<T> {
    fn subscribe_boxed(&self, subscriber: BoxSubscriber<T>, context: Context) {
        let shared = Arc::new(SubscribeOnShared {
            sink: SerializedSink::new(subscriber),
            worker: Worker::new(Arc::clone(&self.scheduler)),
            state: Mutex::new(UpstreamState::default()),
            cancelled: AtomicBool::new(false),
        });
        shared.sink.on_subscribe(shared.clone());
        if shared.cancelled.load(Ordering::Acquire) {
            return;
        }

        let source = Arc::clone(&self.source);
        let subscriber = SubscribeOnSubscriber {
            shared: Arc::clone(&shared),
        };
        let task = Box::new(move || source.subscribe_boxed(Box::new(subscriber), context));
        if let Err(err) = shared.worker.schedule(task) {
            debug!(scheduler = shared.worker.scheduler_name(), error = %err, "subscribe_on rejected");
            shared.sink.error(err);
        }
    }
}

#[derive(Default)]
struct UpstreamState {
    upstream: Option<SubscriptionRef>,
    pending: u64,
}

struct SubscribeOnShared<T> {
    sink: SerializedSink<T>,
    worker: Arc<Worker>,
    state: Mutex<UpstreamState>,
    cancelled: AtomicBool,
}

impl<T: Send + 'static> SubscribeOnShared<T> {
    fn fail(&self, err: FluxError) {
        self.cancel_upstream();
        self.sink.error(err);
    }

    fn cancel_upstream(&self) {
        self.cancelled.store(true, Ordering::Release);
        let upstream = lock(&self.state).upstream.take();
        if let Some(upstream) = upstream {
            upstream.cancel();
        }
        self.worker.dispose();
    }
}

impl<T: Send + 'static> Subscription for SubscribeOnShared<T> {
    fn request(&self, n: i64) {
        if self.cancelled.load(Ordering::Acquire) {
            return;
        }
        let n = match validate_request(n) {
            Ok(n) => n,
            Err(err) => return self.fail(err),
        };
        let upstream = {
            let mut state = lock(&self.state);
            match &state.upstream {
                Some(upstream) => Arc::clone(upstream),
                None => {
                    state.pending = state.pending.saturating_add(n);
                    return;
                }
            }
        };
        if let Err(err) = self
            .worker
            .schedule(Box::new(move || upstream.request(to_request(n))))
        {
            self.fail(err);
        }
    }

    fn cancel(&self) {
        if self.cancelled.load(Ordering::Acquire) {
            return;
        }
        self.cancel_upstream();
        self.sink.cancel();
    }
}

struct SubscribeOnSubscriber<T> {
    shared: Arc<SubscribeOnShared<T>>,
}

impl<T: Send + 'static> Subscriber<T> for SubscribeOnSubscriber<T> {
    // Runs on the worker, so the initial request is issued there directly.
    fn on_subscribe(&mut self, subscription: SubscriptionRef) {
        let pending = {
            let mut state = lock(&self.shared.state);
            if state.upstream.is_some() {
                None
            } else {
                state.upstream = Some(subscription.clone());
                Some(std::mem::take(&mut state.pending))
            }
        };
        match pending {
            None => subscription.cancel(),
            Some(_) if self.shared.cancelled.load(Ordering::Acquire) => subscription.cancel(),
            Some(0) => {}
            Some(n) => subscription.request(to_request(n)),
        }
    }

    fn on_next(&mut self, item: T) {
        self.shared.sink.next(item);
    }

    fn on_error(&mut self, error: FluxError) {
        self.shared.sink.error(error);
    }

    fn on_complete(&mut self) {
        self.shared.sink.complete();
    }
}
