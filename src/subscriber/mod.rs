//! Subscribers: sinks reacting to the four protocol signals.
//!
//! Three ways to consume a [`Flux`](crate::Flux):
//! - implement [`Subscriber`] directly (manual; the implementor owns demand
//!   and state handling),
//! - implement [`Hooks`] and wrap it in a [`BaseSubscriber`], which seals the
//!   signal entry points and mediates every `request`/`cancel`,
//! - build a [`LambdaSubscriber`] from plain callbacks (unbounded demand by default).

/// Hook-based subscriber that owns its subscription.
pub mod base;
/// Blocking edge between reactive and non-reactive callers.
pub mod blocking;
/// Callback-based subscriber and its builder.
pub mod lambda;
pub(crate) mod serialized;

pub use base::{BaseSubscriber, Hooks, SubscriptionHandle};
pub use blocking::BlockingIter;
pub use lambda::{LambdaSubscriber, SubscriberBuilder};

use crate::error::FluxError;
use crate::subscription::SubscriptionRef;

/// Raw Reactive Streams subscriber.
///
/// Implementations receive exactly one `on_subscribe`, then `on_next` calls
/// bounded by the demand they requested, then at most one of `on_error` /
/// `on_complete`. Signals for one subscription are never delivered concurrently.
pub trait Subscriber<T>: Send {
    /// Receives the subscription; request demand here to start the flow.
    fn on_subscribe(&mut self, subscription: SubscriptionRef);

    /// Receives one item.
    fn on_next(&mut self, item: T);

    /// Receives the terminal failure.
    fn on_error(&mut self, error: FluxError);

    /// Receives the terminal success.
    fn on_complete(&mut self);
}

/// Owned, type-erased subscriber as passed between stages.
pub type BoxSubscriber<T> = Box<dyn Subscriber<T>>;

impl<T, S: Subscriber<T> + ?Sized> Subscriber<T> for Box<S> {
    fn on_subscribe(&mut self, subscription: SubscriptionRef) {
        (**self).on_subscribe(subscription);
    }

    fn on_next(&mut self, item: T) {
        (**self).on_next(item);
    }

    fn on_error(&mut self, error: FluxError) {
        (**self).on_error(error);
    }

    fn on_complete(&mut self) {
        (**self).on_complete();
    }
}
