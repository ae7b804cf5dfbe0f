//! Serialized delivery of signals to one downstream subscriber.
//!
//! Producers on any thread push signals; exactly one thread at a time drains
//! them into the subscriber, in push order. A push made from inside a signal
//! handler (re-entrancy) is queued and delivered after the handler returns,
//! so the subscriber lock is never taken twice on one stack.
//!
//! The sink also enforces the signal grammar: `OnSubscribe` first and once,
//! nothing after a terminal signal, nothing after cancellation.
//!
//! A cancel from a thread that is not itself delivering waits for a delivery
//! in flight on another thread, so once `cancel` returns the subscriber sees
//! no further signal.

use std::cell::Cell;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use crossbeam_channel::{unbounded, Receiver, Sender};
use tracing::warn;

use crate::error::{FluxError, ProtocolViolation};
use crate::hooks;
use crate::signal::{Signal, SignalKind};
use crate::subscription::SubscriptionRef;
use crate::sync::{lock, Wip};

use super::BoxSubscriber;

thread_local! {
    // Number of sink drains active on this thread.
    static DELIVERING: Cell<usize> = const { Cell::new(0) };
}

/// Marks the current thread as delivering signals while alive.
pub(crate) struct Delivering;

impl Delivering {
    pub(crate) fn enter() -> Self {
        DELIVERING.with(|d| d.set(d.get() + 1));
        Self
    }

    fn active() -> bool {
        DELIVERING.with(|d| d.get() > 0)
    }
}

impl Drop for Delivering {
    fn drop(&mut self) {
        DELIVERING.with(|d| d.set(d.get().saturating_sub(1)));
    }
}

pub(crate) struct SerializedSink<T> {
    tx: Sender<Signal<T>>,
    rx: Receiver<Signal<T>>,
    wip: Wip,
    downstream: Mutex<Option<BoxSubscriber<T>>>,
    subscribed: AtomicBool,
    terminal_pushed: AtomicBool,
    cancelled: AtomicBool,
    violations: AtomicU64,
}

impl<T: Send + 'static> SerializedSink<T> {
    pub(crate) fn new(downstream: BoxSubscriber<T>) -> Self {
        let (tx, rx) = unbounded();
        Self {
            tx,
            rx,
            wip: Wip::new(),
            downstream: Mutex::new(Some(downstream)),
            subscribed: AtomicBool::new(false),
            terminal_pushed: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            violations: AtomicU64::new(0),
        }
    }

    pub(crate) fn on_subscribe(&self, subscription: SubscriptionRef) {
        self.push(Signal::OnSubscribe(subscription));
    }

    pub(crate) fn next(&self, item: T) {
        self.push(Signal::OnNext(item));
    }

    pub(crate) fn error(&self, error: FluxError) {
        self.push(Signal::OnError(error));
    }

    pub(crate) fn complete(&self) {
        self.push(Signal::OnComplete);
    }

    /// Stops delivery; queued signals are discarded and the subscriber is released.
    pub(crate) fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        if self.wip.enter() {
            self.drain();
        } else if !Delivering::active() {
            // Another thread is draining. A thread that delivers nothing holds
            // no sink lock, so waiting here cannot close a cycle.
            drop(lock(&self.downstream));
        }
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// True once a terminal signal was accepted, or the sink was cancelled.
    pub(crate) fn is_done(&self) -> bool {
        self.terminal_pushed.load(Ordering::Acquire) || self.is_cancelled()
    }

    #[cfg(test)]
    pub(crate) fn violations(&self) -> u64 {
        self.violations.load(Ordering::Relaxed)
    }

    fn push(&self, signal: Signal<T>) {
        if self.is_cancelled() {
            if let Signal::OnError(err) = &signal {
                hooks::on_error_dropped(err);
            }
            return;
        }

        let kind = signal.kind();
        let after_terminal = match kind {
            SignalKind::OnNext => self.terminal_pushed.load(Ordering::Acquire),
            SignalKind::OnError | SignalKind::OnComplete => {
                self.terminal_pushed.swap(true, Ordering::AcqRel)
            }
            SignalKind::OnSubscribe | SignalKind::Cancel => false,
        };
        if after_terminal {
            if let Signal::OnError(err) = &signal {
                hooks::on_error_dropped(err);
            }
            self.report(ProtocolViolation::SignalAfterTerminal { signal: kind });
            return;
        }

        // Unbounded channel; send only fails once the receiver is gone, and we own it.
        let _ = self.tx.send(signal);
        if self.wip.enter() {
            self.drain();
        }
    }

    fn drain(&self) {
        let _delivering = Delivering::enter();
        let mut missed = 1;
        loop {
            {
                let mut guard = lock(&self.downstream);
                while let Ok(signal) = self.rx.try_recv() {
                    if self.is_cancelled() || guard.is_none() {
                        discard(signal);
                        continue;
                    }
                    self.deliver(&mut guard, signal);
                }
                if self.is_cancelled() && guard.is_some() {
                    *guard = None;
                }
            }

            missed = self.wip.leave(missed);
            if missed == 0 {
                break;
            }
        }
    }

    fn deliver(&self, guard: &mut Option<BoxSubscriber<T>>, signal: Signal<T>) {
        match signal {
            Signal::OnSubscribe(subscription) => {
                if self.subscribed.swap(true, Ordering::AcqRel) {
                    subscription.cancel();
                    self.report(ProtocolViolation::DuplicateSubscription);
                    return;
                }
                if let Some(subscriber) = guard.as_mut() {
                    subscriber.on_subscribe(subscription);
                }
            }
            Signal::OnNext(item) => {
                if !self.subscribed.load(Ordering::Acquire) {
                    self.report(ProtocolViolation::SignalBeforeSubscribe {
                        signal: SignalKind::OnNext,
                    });
                    return;
                }
                if let Some(subscriber) = guard.as_mut() {
                    subscriber.on_next(item);
                }
            }
            Signal::OnError(err) => {
                if !self.subscribed.load(Ordering::Acquire) {
                    hooks::on_error_dropped(&err);
                    self.terminal_before_subscribe(guard, SignalKind::OnError);
                    return;
                }
                if let Some(mut subscriber) = guard.take() {
                    subscriber.on_error(err);
                }
            }
            Signal::OnComplete => {
                if !self.subscribed.load(Ordering::Acquire) {
                    self.terminal_before_subscribe(guard, SignalKind::OnComplete);
                    return;
                }
                if let Some(mut subscriber) = guard.take() {
                    subscriber.on_complete();
                }
            }
        }
    }

    // The subscriber is released unsignalled; a late `OnSubscribe` is discarded.
    fn terminal_before_subscribe(&self, guard: &mut Option<BoxSubscriber<T>>, signal: SignalKind) {
        *guard = None;
        self.report(ProtocolViolation::SignalBeforeSubscribe { signal });
    }

    fn report(&self, violation: ProtocolViolation) {
        self.violations.fetch_add(1, Ordering::Relaxed);
        warn!(violation = %violation, "protocol violation");
        hooks::on_error_dropped(&FluxError::Protocol(violation));
    }
}

fn discard<T>(signal: Signal<T>) {
    match signal {
        Signal::OnSubscribe(subscription) => subscription.cancel(),
        Signal::OnError(err) => hooks::on_error_dropped(&err),
        Signal::OnNext(_) | Signal::OnComplete => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::subscriber::Subscriber;
    use crate::subscription::NoopSubscription;

    #[derive(Default)]
    struct Log {
        events: Mutex<Vec<String>>,
    }

    struct Recorder(Arc<Log>);

    impl Subscriber<i32> for Recorder {
        fn on_subscribe(&mut self, _s: SubscriptionRef) {
            self.0.events.lock().unwrap().push("sub".into());
        }

        fn on_next(&mut self, item: i32) {
            self.0.events.lock().unwrap().push(format!("next:{item}"));
        }

        fn on_error(&mut self, error: FluxError) {
            self.0.events.lock().unwrap().push(format!("error:{error}"));
        }

        fn on_complete(&mut self) {
            self.0.events.lock().unwrap().push("complete".into());
        }
    }

    fn sink() -> (SerializedSink<i32>, Arc<Log>) {
        let log = Arc::new(Log::default());
        (SerializedSink::new(Box::new(Recorder(Arc::clone(&log)))), log)
    }

    #[test]
    fn test_delivers_in_order() {
        let (sink, log) = sink();
        sink.on_subscribe(Arc::new(NoopSubscription));
        sink.next(1);
        sink.next(2);
        sink.complete();
        assert_eq!(
            *log.events.lock().unwrap(),
            vec!["sub", "next:1", "next:2", "complete"]
        );
    }

    #[test]
    fn test_signals_after_terminal_are_violations() {
        let (sink, log) = sink();
        sink.on_subscribe(Arc::new(NoopSubscription));
        sink.complete();
        sink.next(3);
        sink.complete();
        assert_eq!(*log.events.lock().unwrap(), vec!["sub", "complete"]);
        assert_eq!(sink.violations(), 2);
        assert!(sink.is_done());
    }

    #[test]
    fn test_double_subscribe_is_violation() {
        let (sink, log) = sink();
        sink.on_subscribe(Arc::new(NoopSubscription));
        sink.on_subscribe(Arc::new(NoopSubscription));
        assert_eq!(*log.events.lock().unwrap(), vec!["sub"]);
        assert_eq!(sink.violations(), 1);
    }

    #[test]
    fn test_next_before_subscribe_is_violation() {
        let (sink, log) = sink();
        sink.next(1);
        assert!(log.events.lock().unwrap().is_empty());
        assert_eq!(sink.violations(), 1);
    }

    #[test]
    fn test_terminal_before_subscribe_is_violation() {
        let (sink, log) = sink();
        sink.complete();
        sink.on_subscribe(Arc::new(NoopSubscription));
        assert!(log.events.lock().unwrap().is_empty());
        assert_eq!(sink.violations(), 1);
        assert!(sink.is_done());
    }

    #[test]
    fn test_cancel_waits_for_delivery_on_other_thread() {
        use std::sync::atomic::AtomicUsize;
        use std::thread;
        use std::time::Duration;

        struct Slow {
            entered: crossbeam_channel::Sender<()>,
            delivered: Arc<AtomicUsize>,
        }

        impl Subscriber<i32> for Slow {
            fn on_subscribe(&mut self, _s: SubscriptionRef) {}

            fn on_next(&mut self, _item: i32) {
                let _ = self.entered.send(());
                thread::sleep(Duration::from_millis(50));
                self.delivered.fetch_add(1, Ordering::SeqCst);
            }

            fn on_error(&mut self, _error: FluxError) {}

            fn on_complete(&mut self) {}
        }

        let (entered_tx, entered_rx) = crossbeam_channel::bounded(1);
        let delivered = Arc::new(AtomicUsize::new(0));
        let sink = Arc::new(SerializedSink::new(Box::new(Slow {
            entered: entered_tx,
            delivered: Arc::clone(&delivered),
        })));
        sink.on_subscribe(Arc::new(NoopSubscription));

        let producer = {
            let sink = Arc::clone(&sink);
            thread::spawn(move || sink.next(1))
        };
        entered_rx.recv_timeout(Duration::from_secs(1)).unwrap();
        sink.cancel();
        assert_eq!(delivered.load(Ordering::SeqCst), 1);
        producer.join().unwrap();
    }

    #[test]
    fn test_cancel_stops_delivery() {
        let (sink, log) = sink();
        sink.on_subscribe(Arc::new(NoopSubscription));
        sink.next(1);
        sink.cancel();
        sink.next(2);
        sink.complete();
        assert_eq!(*log.events.lock().unwrap(), vec!["sub", "next:1"]);
        assert!(sink.is_cancelled());
    }
}
