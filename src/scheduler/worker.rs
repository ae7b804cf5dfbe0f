//! Serial worker over a scheduler.
//!
//! Tasks scheduled through one [`Worker`] run in submission order and never
//! concurrently, even on a multi-threaded pool. Only one drain task is queued
//! on the underlying scheduler at a time; tasks submitted while it runs are
//! picked up by the same drain.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use crossbeam_channel::{unbounded, Receiver, Sender};
use tracing::error;

use crate::error::{FluxError, FluxResult};
use crate::subscription::Disposable;
use crate::sync::Wip;

use super::{SchedulerRef, Task};

/// Ordered, non-overlapping task execution on top of a [`SchedulerRef`].
pub struct Worker {
    scheduler: SchedulerRef,
    tx: Sender<Task>,
    rx: Receiver<Task>,
    wip: Wip,
    disposed: AtomicBool,
    rejected: OnceLock<FluxError>,
}

impl Worker {
    /// Creates a worker bound to `scheduler`.
    #[must_use]
    pub fn new(scheduler: SchedulerRef) -> Arc<Self> {
        let (tx, rx) = unbounded();
        Arc::new(Self {
            scheduler,
            tx,
            rx,
            wip: Wip::new(),
            disposed: AtomicBool::new(false),
            rejected: OnceLock::new(),
        })
    }

    /// Name of the underlying scheduler.
    #[must_use]
    pub fn scheduler_name(&self) -> &str {
        self.scheduler.name()
    }

    /// Queues `task` behind every task previously scheduled on this worker.
    ///
    /// # Errors
    /// The scheduler's rejection, if it refused the drain task. The worker
    /// stays rejected afterwards.
    pub fn schedule(self: &Arc<Self>, task: Task) -> FluxResult<()> {
        if let Some(err) = self.rejected.get() {
            return Err(err.clone());
        }
        if self.is_disposed() {
            return Ok(());
        }
        // Unbounded and we hold the receiver, so send cannot fail.
        let _ = self.tx.send(task);
        if !self.wip.enter() {
            return Ok(());
        }
        let this = Arc::clone(self);
        match self.scheduler.schedule(Box::new(move || this.drain())) {
            Ok(_) => Ok(()),
            Err(err) => {
                let _ = self.rejected.set(err.clone());
                while self.rx.try_recv().is_ok() {}
                Err(err)
            }
        }
    }

    fn drain(&self) {
        let mut missed = 1;
        loop {
            for _ in 0..missed {
                let Ok(task) = self.rx.try_recv() else { break };
                if self.is_disposed() {
                    continue;
                }
                if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(task)) {
                    let message = payload
                        .downcast_ref::<&str>()
                        .map(|s| (*s).to_string())
                        .or_else(|| payload.downcast_ref::<String>().cloned())
                        .unwrap_or_default();
                    error!(scheduler = self.scheduler.name(), panic = %message, "worker task panicked");
                }
            }
            missed = self.wip.leave(missed);
            if missed == 0 {
                break;
            }
        }
    }
}

impl Disposable for Worker {
    fn dispose(&self) {
        self.disposed.store(true, Ordering::Release);
    }

    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    use crate::scheduler::{SchedulerConfig, Schedulers};

    #[test]
    fn test_tasks_run_in_order_without_overlap() {
        let pool = Schedulers::new_parallel(SchedulerConfig {
            name: "worker-order".to_string(),
            workers: 4,
            queue_capacity: 64,
        });
        let worker = Worker::new(Arc::clone(&pool));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (done_tx, done_rx) = crossbeam_channel::bounded(1);
        for i in 0..100 {
            let seen = Arc::clone(&seen);
            let done_tx = done_tx.clone();
            worker
                .schedule(Box::new(move || {
                    seen.lock().unwrap().push(i);
                    if i == 99 {
                        done_tx.send(()).unwrap();
                    }
                }))
                .unwrap();
        }
        done_rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(*seen.lock().unwrap(), (0..100).collect::<Vec<_>>());
        pool.dispose();
    }

    #[test]
    fn test_reentrant_schedule_on_immediate_is_trampolined() {
        let worker = Worker::new(Schedulers::immediate());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (w, s) = (Arc::clone(&worker), Arc::clone(&seen));
        worker
            .schedule(Box::new(move || {
                let inner = Arc::clone(&s);
                w.schedule(Box::new(move || inner.lock().unwrap().push("inner")))
                    .unwrap();
                s.lock().unwrap().push("outer");
            }))
            .unwrap();
        assert_eq!(*seen.lock().unwrap(), vec!["outer", "inner"]);
    }

    #[test]
    fn test_rejection_is_sticky() {
        let pool = Schedulers::new_parallel(SchedulerConfig {
            name: "worker-rejected".to_string(),
            workers: 1,
            queue_capacity: 4,
        });
        pool.dispose();
        let worker = Worker::new(pool);
        assert!(worker.schedule(Box::new(|| {})).unwrap_err().is_scheduler_rejection());
        assert!(worker.schedule(Box::new(|| {})).unwrap_err().is_scheduler_rejection());
    }
}
