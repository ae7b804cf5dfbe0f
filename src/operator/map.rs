use std::sync::Arc;

use crate::context::Context;
use crate::error::{FluxError, FluxResult};
use crate::hooks;
use crate::publisher::Publisher;
use crate::subscriber::{BoxSubscriber, Subscriber};
use crate::subscription::SubscriptionRef;

type Mapper<T, U> = Arc<dyn Fn(T, &Context) -> FluxResult<U> + Send + Sync>;

/// 1:1 transform. Also backs `try_map`, `map_with_context`, `do_on_next` and `timestamp`.
pub(crate) struct MapPublisher<T, U> {
    source: Arc<dyn Publisher<T>>,
    mapper: Mapper<T, U>,
}

impl<T, U> MapPublisher<T, U> {
    pub(crate) fn new<F>(source: Arc<dyn Publisher<T>>, mapper: F) -> Self
    where
        F: Fn(T, &Context) -> FluxResult<U> + Send + Sync + 'static,
    {
        Self {
            source,
            mapper: Arc::new(mapper),
        }
    }
}

impl<T: Send + 'static, U: Send + 'static> Publisher<U> for MapPublisher<T, U> {
    fn subscribe_boxed(&self, subscriber: BoxSubscriber<U>, context: Context) {
        let map = MapSubscriber {
            downstream: subscriber,
            mapper: Arc::clone(&self.mapper),
            context: context.clone(),
            upstream: None,
            done: false,
        };
        self.source.subscribe_boxed(Box::new(map), context);
    }
}

struct MapSubscriber<T, U> {
    downstream: BoxSubscriber<U>,
    mapper: Mapper<T, U>,
    context: Context,
    upstream: Option<SubscriptionRef>,
    done: bool,
}

impl<T, U> Subscriber<T> for MapSubscriber<T, U> {
    fn on_subscribe(&mut self, subscription: SubscriptionRef) {
        self.upstream = Some(subscription.clone());
        self.downstream.on_subscribe(subscription);
    }

    fn on_next(&mut self, item: T) {
        if self.done {
            return;
        }
        match (self.mapper)(item, &self.context) {
            Ok(mapped) => self.downstream.on_next(mapped),
            Err(err) => {
                self.done = true;
                if let Some(upstream) = self.upstream.take() {
                    upstream.cancel();
                }
                self.downstream.on_error(err);
            }
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
