//! Blocking edge between reactive and non-reactive callers.
//!
//! Every entry point refuses to run on a scheduler worker: parking a worker
//! while it waits for signals that may need that same worker is a deadlock.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};

use crate::context::Context;
use crate::demand::to_request;
use crate::error::{FluxError, FluxResult, ProtocolViolation};
use crate::publisher::Publisher;
use crate::scheduler::current_worker;
use crate::subscription::SubscriptionRef;

use super::Subscriber;

/// Fails with `BlockingInWorker` when called from a scheduler worker thread.
pub(crate) fn ensure_blocking_allowed() -> FluxResult<()> {
    match current_worker() {
        Some(scheduler) => Err(FluxError::Protocol(ProtocolViolation::BlockingInWorker {
            scheduler,
        })),
        None => Ok(()),
    }
}

fn duration_ms(timeout: Duration) -> u64 {
    u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX)
}

enum Event<T> {
    Next(T),
    Error(FluxError),
    Complete,
}

type SubscriptionSlot = Arc<OnceLock<SubscriptionRef>>;

fn cancel_slot(slot: &SubscriptionSlot) {
    if let Some(subscription) = slot.get() {
        subscription.cancel();
    }
}

struct ChannelSubscriber<T> {
    tx: Sender<Event<T>>,
    slot: SubscriptionSlot,
    initial: i64,
}

impl<T: Send> Subscriber<T> for ChannelSubscriber<T> {
    fn on_subscribe(&mut self, subscription: SubscriptionRef) {
        if self.slot.set(subscription.clone()).is_err() {
            subscription.cancel();
            return;
        }
        subscription.request(self.initial);
    }

    fn on_next(&mut self, item: T) {
        let _ = self.tx.send(Event::Next(item));
    }

    fn on_error(&mut self, error: FluxError) {
        let _ = self.tx.send(Event::Error(error));
    }

    fn on_complete(&mut self) {
        let _ = self.tx.send(Event::Complete);
    }
}

fn subscribe_channel<T, P>(publisher: &P, initial: i64) -> (Receiver<Event<T>>, SubscriptionSlot)
where
    T: Send + 'static,
    P: Publisher<T> + ?Sized,
{
    let (tx, rx) = unbounded();
    let slot: SubscriptionSlot = Arc::new(OnceLock::new());
    publisher.subscribe_boxed(
        Box::new(ChannelSubscriber {
            tx,
            slot: Arc::clone(&slot),
            initial,
        }),
        Context::empty(),
    );
    (rx, slot)
}

fn recv<T>(rx: &Receiver<Event<T>>, timeout: Option<Duration>) -> FluxResult<Option<Event<T>>> {
    match timeout {
        None => Ok(rx.recv().ok()),
        Some(t) => match rx.recv_timeout(t) {
            Ok(event) => Ok(Some(event)),
            Err(RecvTimeoutError::Timeout) => Err(FluxError::Timeout {
                duration_ms: duration_ms(t),
            }),
            Err(RecvTimeoutError::Disconnected) => Ok(None),
        },
    }
}

/// Waits for the first item, then cancels. `Ok(None)` for an empty sequence.
pub(crate) fn block_first<T, P>(publisher: &P, timeout: Option<Duration>) -> FluxResult<Option<T>>
where
    T: Send + 'static,
    P: Publisher<T> + ?Sized,
{
    ensure_blocking_allowed()?;
    let (rx, slot) = subscribe_channel(publisher, 1);
    let outcome = match recv(&rx, timeout) {
        Ok(Some(Event::Next(item))) => Ok(Some(item)),
        Ok(Some(Event::Error(err))) => Err(err),
        Ok(Some(Event::Complete) | None) => Ok(None),
        Err(err) => Err(err),
    };
    cancel_slot(&slot);
    outcome
}

/// Waits for the terminal signal and returns the last item seen.
pub(crate) fn block_last<T, P>(publisher: &P, timeout: Option<Duration>) -> FluxResult<Option<T>>
where
    T: Send + 'static,
    P: Publisher<T> + ?Sized,
{
    ensure_blocking_allowed()?;
    let (rx, slot) = subscribe_channel(publisher, crate::demand::UNBOUNDED);
    let deadline = timeout.map(|t| (std::time::Instant::now() + t, t));
    let mut last = None;
    loop {
        let remaining = deadline.map(|(at, _)| at.saturating_duration_since(std::time::Instant::now()));
        match recv(&rx, remaining) {
            Ok(Some(Event::Next(item))) => last = Some(item),
            Ok(Some(Event::Complete) | None) => return Ok(last),
            Ok(Some(Event::Error(err))) => return Err(err),
            Err(_) => {
                cancel_slot(&slot);
                let total = deadline.map_or(0, |(_, t)| duration_ms(t));
                return Err(FluxError::Timeout { duration_ms: total });
            }
        }
    }
}

/// Blocking iterator over a sequence, requesting `prefetch` items at a time.
///
/// Yields `Err` once if the sequence fails. Dropping the iterator cancels the
/// subscription.
pub struct BlockingIter<T> {
    rx: Receiver<Event<T>>,
    slot: SubscriptionSlot,
    limit: u64,
    consumed: u64,
    done: bool,
}

impl<T: Send + 'static> BlockingIter<T> {
    pub(crate) fn new<P>(publisher: &P, prefetch: usize) -> FluxResult<Self>
    where
        P: Publisher<T> + ?Sized,
    {
        ensure_blocking_allowed()?;
        let prefetch = u64::try_from(prefetch.max(1)).unwrap_or(u64::MAX);
        let (rx, slot) = subscribe_channel(publisher, to_request(prefetch));
        Ok(Self {
            rx,
            slot,
            limit: (prefetch - prefetch / 4).max(1),
            consumed: 0,
            done: false,
        })
    }
}

impl<T> Iterator for BlockingIter<T> {
    type Item = FluxResult<T>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.rx.recv() {
            Ok(Event::Next(item)) => {
                self.consumed += 1;
                if self.consumed == self.limit {
                    self.consumed = 0;
                    if let Some(subscription) = self.slot.get() {
                        subscription.request(to_request(self.limit));
                    }
                }
                Some(Ok(item))
            }
            Ok(Event::Error(err)) => {
                self.done = true;
                Some(Err(err))
            }
            Ok(Event::Complete) | Err(_) => {
                self.done = true;
                None
            }
        }
    }
}

impl<T> Drop for BlockingIter<T> {
    fn drop(&mut self) {
        if !self.done {
            cancel_slot(&self.slot);
        }
    }
}
