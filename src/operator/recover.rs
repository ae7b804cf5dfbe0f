use std::sync::Arc;

use tracing::debug;

use crate::context::Context;
use crate::error::FluxError;
use crate::hooks;
use crate::publisher::{Flux, Publisher};
use crate::subscriber::{BoxSubscriber, Subscriber};
use crate::subscription::{SubscriptionArbiter, SubscriptionRef};

type Fallback<T> = Arc<dyn Fn(FluxError) -> Flux<T> + Send + Sync>;

/// Switches to a fallback sequence when upstream fails.
///
/// Downstream keeps one subscription (the arbiter) across the switch, and the
/// fallback is asked for exactly the demand the failed upstream still owed.
pub(crate) struct OnErrorResumePublisher<T> {
    source: Arc<dyn Publisher<T>>,
    fallback: Fallback<T>,
}

impl<T> OnErrorResumePublisher<T> {
    pub(crate) fn new<F>(source: Arc<dyn Publisher<T>>, fallback: F) -> Self
    where
        F: Fn(FluxError) -> Flux<T> + Send + Sync + 'static,
    {
        Self {
            source,
            fallback: Arc::new(fallback),
        }
    }
}

impl<T: Send + 'static> Publisher<T> for OnErrorResumePublisher<T> {
    fn subscribe_boxed(&self, subscriber: BoxSubscriber<T>, context: Context) {
        let resume = ResumeSubscriber {
            downstream: Some(subscriber),
            arbiter: Arc::new(SubscriptionArbiter::new()),
            fallback: Some(Arc::clone(&self.fallback)),
            context: context.clone(),
        };
        self.source.subscribe_boxed(Box::new(resume), context);
    }
}

struct ResumeSubscriber<T> {
    downstream: Option<BoxSubscriber<T>>,
    arbiter: Arc<SubscriptionArbiter>,
    // `None` once this subscriber is attached to the fallback sequence.
    fallback: Option<Fallback<T>>,
    context: Context,
}

impl<T: Send + 'static> Subscriber<T> for ResumeSubscriber<T> {
    fn on_subscribe(&mut self, subscription: SubscriptionRef) {
        self.arbiter.set(subscription);
        if self.fallback.is_some() {
            if let Some(downstream) = self.downstream.as_mut() {
                downstream.on_subscribe(self.arbiter.clone());
            }
        }
    }

    fn on_next(&mut self, item: T) {
        self.arbiter.produced_one();
        if let Some(downstream) = self.downstream.as_mut() {
            downstream.on_next(item);
        }
    }

    fn on_error(&mut self, error: FluxError) {
        let Some(mut downstream) = self.downstream.take() else {
            hooks::on_error_dropped(&error);
            return;
        };
        let fallback = match self.fallback.take() {
            Some(f) if !error.is_illegal_demand() && !self.arbiter.is_cancelled() => f,
            _ => {
                downstream.on_error(error);
                return;
            }
        };
        debug!(error = %error, "resuming with fallback");
        let next = fallback(error);
        let resumed = ResumeSubscriber {
            downstream: Some(downstream),
            arbiter: Arc::clone(&self.arbiter),
            fallback: None,
            context: self.context.clone(),
        };
        next.subscribe_boxed(Box::new(resumed), self.context.clone());
    }

    fn on_complete(&mut self) {
        if let Some(mut downstream) = self.downstream.take() {
            downstream.on_complete();
        }
    }
}
