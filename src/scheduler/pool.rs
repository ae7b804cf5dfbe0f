//! Fixed-size thread pool scheduler.
//!
//! Workers pull tasks from one bounded `crossbeam` queue. Submissions never
//! block: a full queue is reported as [`SchedulerRejection::QueueFull`] and a
//! disposed pool as [`SchedulerRejection::Shutdown`]. Delayed tasks wait on a
//! per-pool timer thread that is started on first use.

use std::any::Any;
use std::cell::RefCell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use tracing::{debug, error, trace, warn};

use crate::error::{FluxError, FluxResult, SchedulerRejection};
use crate::sync::lock;

use super::timer::{Fire, Timer, TimerTask};
use super::{RejectionHandler, Scheduler, SchedulerConfig, Task, TaskHandle};

thread_local! {
    static CURRENT_WORKER: RefCell<Option<String>> = const { RefCell::new(None) };
}

/// Name of the scheduler owning the current thread, if it is a pool worker.
#[must_use]
pub fn current_worker() -> Option<String> {
    CURRENT_WORKER.with(|current| current.borrow().clone())
}

fn mark_worker(name: &str) {
    CURRENT_WORKER.with(|current| *current.borrow_mut() = Some(name.to_string()));
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}

/// Scheduler backed by a fixed set of named worker threads.
pub struct ThreadPoolScheduler {
    name: String,
    tx: RwLock<Option<Sender<Task>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    timer: Mutex<Option<Timer>>,
    queue_capacity: usize,
    shutdown: AtomicBool,
}

impl ThreadPoolScheduler {
    /// Starts the pool.
    ///
    /// Workers that cannot be spawned are logged and skipped; a pool with no
    /// worker at all starts shut down and rejects every task.
    #[must_use]
    pub fn new(config: SchedulerConfig) -> Self {
        let workers = config.workers.max(1);
        let queue_capacity = config.queue_capacity.max(1);
        let (tx, rx) = bounded::<Task>(queue_capacity);

        let mut handles = Vec::with_capacity(workers);
        for idx in 0..workers {
            let rx: Receiver<Task> = rx.clone();
            let name = config.name.clone();
            let spawned = thread::Builder::new()
                .name(format!("kyroflux-{name}-{idx}"))
                .spawn(move || {
                    mark_worker(&name);
                    while let Ok(task) = rx.recv() {
                        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(task)) {
                            error!(
                                scheduler = %name,
                                panic = panic_message(payload.as_ref()),
                                "scheduled task panicked"
                            );
                        }
                    }
                    trace!(scheduler = %name, "worker exiting");
                });
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(err) => error!(scheduler = %config.name, error = %err, "failed to spawn worker"),
            }
        }

        let started = !handles.is_empty();
        debug!(scheduler = %config.name, workers = handles.len(), queue_capacity, "scheduler started");

        Self {
            name: config.name,
            tx: RwLock::new(started.then_some(tx)),
            workers: Mutex::new(handles),
            timer: Mutex::new(None),
            queue_capacity,
            shutdown: AtomicBool::new(!started),
        }
    }

    fn rejected_shutdown(&self) -> FluxError {
        FluxError::Scheduler(SchedulerRejection::Shutdown {
            scheduler: self.name.clone(),
        })
    }

    fn sender(&self) -> FluxResult<Sender<Task>> {
        self.tx
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| self.rejected_shutdown())
    }

    fn submit(&self, task: Task) -> FluxResult<()> {
        match self.sender()?.try_send(task) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(FluxError::Scheduler(SchedulerRejection::QueueFull {
                scheduler: self.name.clone(),
                capacity: self.queue_capacity,
            })),
            Err(TrySendError::Disconnected(_)) => Err(self.rejected_shutdown()),
        }
    }
}

impl Scheduler for ThreadPoolScheduler {
    fn name(&self) -> &str {
        &self.name
    }

    fn schedule(&self, task: Task) -> FluxResult<TaskHandle> {
        if self.is_shutdown() {
            return Err(self.rejected_shutdown());
        }
        let handle = TaskHandle::new();
        self.submit(handle.guard(task))?;
        Ok(handle)
    }

    fn schedule_delayed(
        &self,
        task: Task,
        delay: Duration,
        on_rejected: RejectionHandler,
    ) -> FluxResult<TaskHandle> {
        if self.is_shutdown() {
            return Err(self.rejected_shutdown());
        }
        if delay.is_zero() {
            return self.schedule(task);
        }
        let handle = TaskHandle::new();
        let guarded = handle.guard(task);
        let on_rejected = handle.guard_rejection(on_rejected);
        let tx = self.sender()?;
        let name = self.name.clone();
        let capacity = self.queue_capacity;
        let fire: TimerTask = Box::new(move |fire| {
            let err = match fire {
                Fire::Due => match tx.try_send(guarded) {
                    Ok(()) => return,
                    Err(TrySendError::Full(_)) => SchedulerRejection::QueueFull {
                        scheduler: name,
                        capacity,
                    },
                    Err(TrySendError::Disconnected(_)) => SchedulerRejection::Shutdown { scheduler: name },
                },
                Fire::Abandoned => SchedulerRejection::Shutdown { scheduler: name },
            };
            warn!(rejection = %err, "delayed task rejected");
            on_rejected(FluxError::Scheduler(err));
        });

        let mut timer = lock(&self.timer);
        // `dispose` may have taken the timer since the check above.
        if self.is_shutdown() {
            return Err(self.rejected_shutdown());
        }
        if timer.is_none() {
            *timer = Some(Timer::start(&self.name)?);
        }
        match timer.as_ref() {
            Some(t) if t.schedule(Instant::now() + delay, fire) => Ok(handle),
            _ => Err(self.rejected_shutdown()),
        }
    }

    fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    fn dispose(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(scheduler = %self.name, "scheduler shutting down");

        // Abandoned timer entries report to their subscribers from here.
        let timer = lock(&self.timer).take();
        if let Some(timer) = timer {
            timer.shutdown();
        }
        // Close the queue: workers drain what is already queued, then exit.
        drop(self.tx.write().unwrap_or_else(PoisonError::into_inner).take());

        let handles = std::mem::take(&mut *lock(&self.workers));
        if current_worker().as_deref() == Some(self.name.as_str()) {
            // A worker cannot join itself; the threads exit on their own.
            return;
        }
        for handle in handles {
            let _ = handle.join();
        }
    }
}

impl std::fmt::Debug for ThreadPoolScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadPoolScheduler")
            .field("name", &self.name)
            .field("queue_capacity", &self.queue_capacity)
            .field("shutdown", &self.is_shutdown())
            .finish_non_exhaustive()
    }
}
