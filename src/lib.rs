//! # KyroFlux - Reactive Streams with Backpressure
//!
//! KyroFlux is an in-process Reactive Streams runtime. A [`Flux`] describes a
//! sequence of items assembled from sources and operators; nothing runs until
//! a [`Subscriber`] subscribes, and items then flow only as fast as the
//! subscriber asks for them.
//!
//! ## Core Concepts
//!
//! - **Publisher / Subscriber / Subscription**: the protocol. A subscriber
//!   receives one `on_subscribe`, then at most as many `on_next` as it
//!   requested, then at most one terminal signal.
//! - **Demand**: `request(n)` adds to outstanding demand, `n <= 0` fails the
//!   subscription with `IllegalDemand`, [`UNBOUNDED`] turns backpressure off.
//! - **Operators**: `map`, `filter`, `take`, `skip`, `distinct`, `flat_map`
//!   and friends, each a stage between upstream and downstream.
//! - **Hot and cold**: every subscription re-runs a cold chain; `share` and
//!   `cache` make it hot.
//! - **Schedulers**: `subscribe_on` moves subscription and requests onto a
//!   [`Scheduler`], `publish_on` moves downstream delivery.
//! - **Context**: an immutable key/value map travelling from the subscriber
//!   toward the source.
//!
//! ## Usage
//!
//! ```rust
//! use kyroflux::{Flux, Schedulers};
//!
//! let evens = Flux::range(1, 10)
//!     .filter(|n| n % 2 == 0)
//!     .map(|n| n * 10)
//!     .publish_on(Schedulers::parallel())
//!     .collect_list()
//!     .block_last()?;
//! assert_eq!(evens, Some(vec![20, 40, 60, 80, 100]));
//! # Ok::<(), kyroflux::FluxError>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

// Protocol
pub mod demand;
pub mod error;
pub mod hooks;
pub mod signal;
pub mod subscriber;
pub mod subscription;

// Assembly
pub mod context;
mod hot;
mod operator;
pub mod publisher;

// Execution
pub mod scheduler;

// Test tooling
pub mod testing;

mod sync;

// Re-export primary types at crate root for convenience
pub use context::{Context, ContextValue};
pub use demand::{Demand, UNBOUNDED};
pub use error::{FluxError, FluxResult, ProtocolViolation, SchedulerRejection};
pub use publisher::{Flux, Publisher, StageKind};
pub use scheduler::{
    RejectionHandler, Scheduler, SchedulerConfig, SchedulerRef, Schedulers, TaskHandle, Worker,
};
pub use signal::{Signal, SignalKind};
pub use subscriber::{
    BaseSubscriber, BlockingIter, Hooks, LambdaSubscriber, Subscriber, SubscriberBuilder,
    SubscriptionHandle,
};
pub use subscription::{
    Disposable, Subscription, SubscriptionDisposable, SubscriptionId, SubscriptionRef,
};
