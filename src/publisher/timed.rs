//! Time-driven sources.
//!
//! Time is represented by scheduling a future task, never by parking a
//! thread. A tick that finds no outstanding demand cannot be postponed
//! without drifting, so it fails the sequence with `Overflow`. A tick the
//! scheduler cannot run fails it with the scheduler's rejection.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::trace;

use crate::context::Context;
use crate::demand::{validate_request, Demand};
use crate::error::FluxError;
use crate::scheduler::{SchedulerRef, TaskHandle};
use crate::subscriber::serialized::SerializedSink;
use crate::subscriber::BoxSubscriber;
use crate::subscription::{Disposable, Subscription};
use crate::sync::lock;

use super::{Flux, Publisher};

struct IntervalPublisher {
    period: Duration,
    scheduler: SchedulerRef,
}

impl Publisher<u64> for IntervalPublisher {
    fn subscribe_boxed(&self, subscriber: BoxSubscriber<u64>, _context: Context) {
        let subscription = Arc::new(IntervalSubscription {
            period: self.period,
            scheduler: Arc::clone(&self.scheduler),
            demand: Demand::new(),
            count: AtomicU64::new(0),
            done: AtomicBool::new(false),
            pending: Mutex::new(None),
            sink: SerializedSink::new(subscriber),
        });
        subscription.sink.on_subscribe(subscription.clone());
        subscription.schedule_tick(Instant::now() + self.period);
    }
}

struct IntervalSubscription {
    period: Duration,
    scheduler: SchedulerRef,
    demand: Demand,
    count: AtomicU64,
    done: AtomicBool,
    pending: Mutex<Option<TaskHandle>>,
    sink: SerializedSink<u64>,
}

impl IntervalSubscription {
    fn schedule_tick(self: &Arc<Self>, at: Instant) {
        if self.done.load(Ordering::Acquire) {
            return;
        }
        let this = Arc::clone(self);
        let rejected = Arc::clone(self);
        let delay = at.saturating_duration_since(Instant::now());
        let scheduled = self.scheduler.schedule_delayed(
            Box::new(move || this.tick(at)),
            delay,
            Box::new(move |err| rejected.fail(err)),
        );
        match scheduled {
            Ok(handle) => *lock(&self.pending) = Some(handle),
            Err(err) => self.fail(err),
        }
    }

    fn tick(self: &Arc<Self>, at: Instant) {
        if self.done.load(Ordering::Acquire) {
            return;
        }
        if !self.demand.try_consume() {
            self.fail(FluxError::Overflow { stage: "interval" });
            return;
        }
        let n = self.count.fetch_add(1, Ordering::Relaxed);
        trace!(tick = n, "interval tick");
        self.sink.next(n);
        // Next deadline is derived from the previous one, not from now.
        self.schedule_tick(at + self.period);
    }

    fn fail(&self, err: FluxError) {
        if !self.done.swap(true, Ordering::AcqRel) {
            self.stop_timer();
            self.sink.error(err);
        }
    }

    fn stop_timer(&self) {
        if let Some(handle) = lock(&self.pending).take() {
            handle.dispose();
        }
    }
}

impl Subscription for IntervalSubscription {
    fn request(&self, n: i64) {
        match validate_request(n) {
            Ok(n) => {
                self.demand.add(n);
            }
            Err(err) => self.fail(err),
        }
    }

    fn cancel(&self) {
        self.done.store(true, Ordering::Release);
        self.stop_timer();
        self.sink.cancel();
    }
}

struct TimerPublisher {
    delay: Duration,
    scheduler: SchedulerRef,
}

impl Publisher<u64> for TimerPublisher {
    fn subscribe_boxed(&self, subscriber: BoxSubscriber<u64>, _context: Context) {
        let subscription = Arc::new(TimerSubscription {
            elapsed: AtomicBool::new(false),
            requested: AtomicBool::new(false),
            done: AtomicBool::new(false),
            pending: Mutex::new(None),
            sink: SerializedSink::new(subscriber),
        });
        subscription.sink.on_subscribe(subscription.clone());

        let this = Arc::clone(&subscription);
        let rejected = Arc::clone(&subscription);
        let scheduled = self.scheduler.schedule_delayed(
            Box::new(move || {
                this.elapsed.store(true, Ordering::Release);
                this.try_emit();
            }),
            self.delay,
            Box::new(move |err| rejected.fail(err)),
        );
        match scheduled {
            Ok(handle) => *lock(&subscription.pending) = Some(handle),
            Err(err) => subscription.fail(err),
        }
    }
}

/// Emits `0` once the delay elapsed and demand arrived, whichever is later.
struct TimerSubscription {
    elapsed: AtomicBool,
    requested: AtomicBool,
    done: AtomicBool,
    pending: Mutex<Option<TaskHandle>>,
    sink: SerializedSink<u64>,
}

impl TimerSubscription {
    fn try_emit(&self) {
        if self.elapsed.load(Ordering::Acquire)
            && self.requested.load(Ordering::Acquire)
            && !self.done.swap(true, Ordering::AcqRel)
        {
            self.sink.next(0);
            self.sink.complete();
        }
    }

    fn fail(&self, err: FluxError) {
        if !self.done.swap(true, Ordering::AcqRel) {
            if let Some(handle) = lock(&self.pending).take() {
                handle.dispose();
            }
            self.sink.error(err);
        }
    }
}

impl Subscription for TimerSubscription {
    fn request(&self, n: i64) {
        match validate_request(n) {
            Ok(_) => {
                self.requested.store(true, Ordering::Release);
                self.try_emit();
            }
            Err(err) => self.fail(err),
        }
    }

    fn cancel(&self) {
        self.done.store(true, Ordering::Release);
        if let Some(handle) = lock(&self.pending).take() {
            handle.dispose();
        }
        self.sink.cancel();
    }
}

impl Flux<u64> {
    /// Emits `0, 1, 2, ...` every `period` on `scheduler`, starting one period after subscribe.
    #[must_use]
    pub fn interval(period: Duration, scheduler: SchedulerRef) -> Self {
        Self::source(IntervalPublisher { period, scheduler }, "interval")
    }

    /// Emits a single `0` after `delay` on `scheduler`, then completes.
    #[must_use]
    pub fn timer(delay: Duration, scheduler: SchedulerRef) -> Self {
        Self::source(TimerPublisher { delay, scheduler }, "timer")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SchedulerRejection;
    use crate::scheduler::{SchedulerConfig, Schedulers};
    use crate::testing::TestSubscriber;

    fn pool(name: &str) -> SchedulerRef {
        Schedulers::new_parallel(SchedulerConfig {
            name: name.to_string(),
            workers: 2,
            queue_capacity: 64,
        })
    }

    #[test]
    fn test_interval_emits_increasing_ticks() {
        let scheduler = pool("interval-ticks");
        let probe = TestSubscriber::with_request(3);
        Flux::interval(Duration::from_millis(10), Arc::clone(&scheduler)).subscribe(probe.clone());
        assert!(probe.await_count(3, Duration::from_secs(2)));
        probe.cancel();
        assert_eq!(probe.values(), vec![0, 1, 2]);
        scheduler.dispose();
    }

    #[test]
    fn test_interval_without_demand_overflows() {
        let scheduler = pool("interval-overflow");
        let probe = TestSubscriber::with_request(1);
        Flux::interval(Duration::from_millis(5), Arc::clone(&scheduler)).subscribe(probe.clone());
        assert!(probe.await_terminal(Duration::from_secs(2)));
        assert_eq!(probe.values(), vec![0]);
        assert_eq!(probe.error(), Some(FluxError::Overflow { stage: "interval" }));
        scheduler.dispose();
    }

    #[test]
    fn test_timer_waits_for_demand() {
        let scheduler = pool("timer-demand");
        let probe = TestSubscriber::manual();
        Flux::timer(Duration::from_millis(5), Arc::clone(&scheduler)).subscribe(probe.clone());
        std::thread::sleep(Duration::from_millis(50));
        assert!(probe.values().is_empty());
        probe.request(1);
        assert!(probe.await_terminal(Duration::from_secs(1)));
        assert_eq!(probe.values(), vec![0]);
        assert!(probe.is_complete());
        scheduler.dispose();
    }

    fn saturated_pool(name: &str) -> (SchedulerRef, crossbeam_channel::Sender<()>) {
        let scheduler = Schedulers::new_parallel(SchedulerConfig {
            name: name.to_string(),
            workers: 1,
            queue_capacity: 1,
        });
        let (release_tx, release_rx) = crossbeam_channel::bounded::<()>(0);
        let (started_tx, started_rx) = crossbeam_channel::bounded::<()>(1);
        scheduler
            .schedule(Box::new(move || {
                started_tx.send(()).unwrap();
                let _ = release_rx.recv();
            }))
            .unwrap();
        started_rx.recv_timeout(Duration::from_secs(1)).unwrap();
        scheduler.schedule(Box::new(|| {})).unwrap();
        (scheduler, release_tx)
    }

    #[test]
    fn test_interval_fails_when_tick_cannot_be_queued() {
        let (scheduler, release) = saturated_pool("interval-saturated");
        let probe = TestSubscriber::new();
        Flux::interval(Duration::from_millis(20), Arc::clone(&scheduler)).subscribe(probe.clone());
        assert!(probe.await_terminal(Duration::from_secs(2)));
        assert!(probe.values().is_empty());
        assert_eq!(
            probe.error(),
            Some(FluxError::Scheduler(SchedulerRejection::QueueFull {
                scheduler: "interval-saturated".to_string(),
                capacity: 1,
            }))
        );
        release.send(()).unwrap();
        scheduler.dispose();
    }

    #[test]
    fn test_timer_fails_when_tick_cannot_be_queued() {
        let (scheduler, release) = saturated_pool("timer-saturated");
        let probe = TestSubscriber::new();
        Flux::timer(Duration::from_millis(10), Arc::clone(&scheduler)).subscribe(probe.clone());
        assert!(probe.await_terminal(Duration::from_secs(2)));
        assert!(probe.error().unwrap().is_scheduler_rejection());
        release.send(()).unwrap();
        scheduler.dispose();
    }

    #[test]
    fn test_dispose_fails_pending_interval() {
        let scheduler = pool("interval-disposed");
        let probe = TestSubscriber::new();
        Flux::interval(Duration::from_secs(60), Arc::clone(&scheduler)).subscribe(probe.clone());
        scheduler.dispose();
        assert!(probe.await_terminal(Duration::from_secs(1)));
        assert_eq!(
            probe.error(),
            Some(FluxError::Scheduler(SchedulerRejection::Shutdown {
                scheduler: "interval-disposed".to_string(),
            }))
        );
    }

    #[test]
    fn test_timer_on_immediate_is_rejected() {
        let probe = TestSubscriber::new();
        Flux::timer(Duration::from_millis(5), Schedulers::immediate()).subscribe(probe.clone());
        assert!(probe.error().unwrap().is_scheduler_rejection());
    }
}
