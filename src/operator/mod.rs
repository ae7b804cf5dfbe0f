//! Operator stages.
//!
//! Each stage is a publisher that subscribes to its upstream with a
//! stage-specific subscriber. Two demand policies exist:
//! - relay stages (map, filter, take, context_write, log) hand the upstream
//!   subscription straight to downstream; filtering stages re-request one
//!   item per dropped item,
//! - coordinating stages (flat_map, publish_on, subscribe_on, reduce,
//!   on_error_resume) own a subscription of their own and account demand
//!   explicitly.
//!
//! Only `on_error_resume` turns an upstream `OnError` into something else;
//! every other stage passes it through unchanged.

mod context;
mod filter;
mod flat_map;
mod log;
mod map;
mod publish_on;
mod recover;
mod reduce;
mod subscribe_on;
mod take;

pub(crate) use context::ContextWritePublisher;
pub(crate) use filter::FilterPublisher;
pub(crate) use flat_map::FlatMapPublisher;
pub(crate) use log::LogPublisher;
pub(crate) use map::MapPublisher;
pub(crate) use publish_on::PublishOnPublisher;
pub(crate) use recover::OnErrorResumePublisher;
pub(crate) use reduce::ReducePublisher;
pub(crate) use subscribe_on::SubscribeOnPublisher;
pub(crate) use take::TakePublisher;
