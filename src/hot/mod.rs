//! Hot publishers: stages that turn a cold upstream into one shared run.
//!
//! - `share` multicasts a single live upstream subscription. Subscribers
//!   only see items emitted while they are attached; the upstream is
//!   connected by the first subscriber and cancelled when the last one leaves.
//! - `cache` runs upstream once, records every item and the terminal
//!   signal, and replays the recording to each subscriber at its own pace.

mod cache;
mod share;

pub(crate) use cache::CachePublisher;
pub(crate) use share::SharePublisher;
