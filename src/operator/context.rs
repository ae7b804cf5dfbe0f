use std::sync::Arc;

use crate::context::Context;
use crate::publisher::Publisher;
use crate::subscriber::BoxSubscriber;

type ContextFn = Arc<dyn Fn(Context) -> Context + Send + Sync>;

/// Rewrites the context handed to upstream stages.
///
/// Only stages between this one and the source see the write; the context of
/// the downstream stages is untouched.
pub(crate) struct ContextWritePublisher<T> {
    source: Arc<dyn Publisher<T>>,
    write: ContextFn,
}

impl<T> ContextWritePublisher<T> {
    pub(crate) fn new<F>(source: Arc<dyn Publisher<T>>, write: F) -> Self
    where
        F: Fn(Context) -> Context + Send + Sync + 'static,
    {
        Self {
            source,
            write: Arc::new(write),
        }
    }
}

impl<T: Send + 'static> Publisher<T> for ContextWritePublisher<T> {
    fn subscribe_boxed(&self, subscriber: BoxSubscriber<T>, context: Context) {
        self.source.subscribe_boxed(subscriber, (self.write)(context));
    }
}
