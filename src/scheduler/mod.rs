//! Schedulers: where work runs.
//!
//! A [`Scheduler`] accepts tasks and runs them on some execution context. The
//! reactive stages never own a scheduler; they hold a [`SchedulerRef`] and
//! create a serial [`Worker`] per subscription so that everything one
//! subscription schedules runs in order, one task at a time.
//!
//! Process-wide schedulers are created lazily by [`Schedulers`]; explicit
//! pools come from [`Schedulers::new_parallel`] and are shut down with
//! [`Scheduler::dispose`].

mod immediate;
mod pool;
mod timer;
mod worker;

pub use immediate::ImmediateScheduler;
pub use pool::{current_worker, ThreadPoolScheduler};
pub use worker::Worker;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use crate::error::{FluxError, FluxResult};
use crate::subscription::Disposable;

/// A unit of work.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Callback run when a delayed task came due but could not be executed.
pub type RejectionHandler = Box<dyn FnOnce(FluxError) + Send + 'static>;

/// Shared scheduler handle.
pub type SchedulerRef = Arc<dyn Scheduler>;

/// Execution context for tasks.
pub trait Scheduler: Send + Sync {
    /// Name used in thread names, logs and rejection errors.
    fn name(&self) -> &str;

    /// Submits `task` for execution as soon as possible.
    ///
    /// # Errors
    /// `SchedulerRejection` if the scheduler is shut down or saturated.
    fn schedule(&self, task: Task) -> FluxResult<TaskHandle>;

    /// Submits `task` for execution after `delay`.
    ///
    /// If the task comes due while the scheduler is saturated, or the
    /// scheduler is disposed before it fires, `on_rejected` receives the
    /// rejection instead. Neither runs once the returned handle is disposed.
    ///
    /// # Errors
    /// `SchedulerRejection` if the scheduler is shut down or has no timer.
    fn schedule_delayed(
        &self,
        task: Task,
        delay: Duration,
        on_rejected: RejectionHandler,
    ) -> FluxResult<TaskHandle>;

    /// True once [`Scheduler::dispose`] was called.
    fn is_shutdown(&self) -> bool;

    /// Stops accepting work and releases the execution context.
    fn dispose(&self);
}

/// Cancellation handle for a scheduled task.
///
/// Disposing before the task starts prevents it from running.
#[derive(Debug, Clone, Default)]
pub struct TaskHandle {
    cancelled: Arc<AtomicBool>,
}

impl TaskHandle {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Wraps `task` so that it is skipped once this handle is disposed.
    pub(crate) fn guard(&self, task: Task) -> Task {
        let cancelled = Arc::clone(&self.cancelled);
        Box::new(move || {
            if !cancelled.load(Ordering::Acquire) {
                task();
            }
        })
    }

    /// Like [`TaskHandle::guard`], for a rejection callback.
    pub(crate) fn guard_rejection(&self, on_rejected: RejectionHandler) -> RejectionHandler {
        let cancelled = Arc::clone(&self.cancelled);
        Box::new(move |err| {
            if !cancelled.load(Ordering::Acquire) {
                on_rejected(err);
            }
        })
    }
}

impl Disposable for TaskHandle {
    fn dispose(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    fn is_disposed(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// Scheduler pool configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Pool name; worker threads are named `kyroflux-{name}-{idx}`.
    pub name: String,
    /// Number of worker threads.
    pub workers: usize,
    /// Maximum queued tasks before submissions are rejected.
    pub queue_capacity: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            name: "parallel".to_string(),
            workers: available_cpus(),
            queue_capacity: 1024,
        }
    }
}

/// Default per-inner prefetch for `flat_map` and default `publish_on` buffer.
pub const DEFAULT_PREFETCH: usize = 256;

/// Default maximum of concurrently active inner sequences in `flat_map`.
pub const DEFAULT_CONCURRENCY: usize = 256;

/// Prefetch used by the blocking iterator and other small buffers.
pub const SMALL_PREFETCH: usize = 32;

const BOUNDED_ELASTIC_QUEUE: usize = 100_000;

fn available_cpus() -> usize {
    std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get)
}

static PARALLEL: OnceLock<SchedulerRef> = OnceLock::new();
static SINGLE: OnceLock<SchedulerRef> = OnceLock::new();
static BOUNDED_ELASTIC: OnceLock<SchedulerRef> = OnceLock::new();
static IMMEDIATE: OnceLock<SchedulerRef> = OnceLock::new();

/// Factory for the process-wide schedulers.
pub struct Schedulers;

impl Schedulers {
    /// CPU-bound pool with one worker per available CPU.
    pub fn parallel() -> SchedulerRef {
        Arc::clone(PARALLEL.get_or_init(|| {
            Arc::new(ThreadPoolScheduler::new(SchedulerConfig::default()))
        }))
    }

    /// Single-worker pool.
    pub fn single() -> SchedulerRef {
        Arc::clone(SINGLE.get_or_init(|| {
            Arc::new(ThreadPoolScheduler::new(SchedulerConfig {
                name: "single".to_string(),
                workers: 1,
                ..SchedulerConfig::default()
            }))
        }))
    }

    /// Pool sized for blocking work: ten workers per CPU and a deep queue.
    pub fn bounded_elastic() -> SchedulerRef {
        Arc::clone(BOUNDED_ELASTIC.get_or_init(|| {
            Arc::new(ThreadPoolScheduler::new(SchedulerConfig {
                name: "boundedElastic".to_string(),
                workers: available_cpus() * 10,
                queue_capacity: BOUNDED_ELASTIC_QUEUE,
            }))
        }))
    }

    /// Runs tasks inline on the calling thread.
    pub fn immediate() -> SchedulerRef {
        Arc::clone(IMMEDIATE.get_or_init(|| Arc::new(ImmediateScheduler::new())))
    }

    /// Creates a new, independently owned pool.
    pub fn new_parallel(config: SchedulerConfig) -> SchedulerRef {
        Arc::new(ThreadPoolScheduler::new(config))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_disposed_handle_skips_task() {
        let ran = Arc::new(AtomicUsize::new(0));
        let handle = TaskHandle::new();
        let r = Arc::clone(&ran);
        let task = handle.guard(Box::new(move || {
            r.fetch_add(1, Ordering::SeqCst);
        }));
        handle.dispose();
        task();
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert!(handle.is_disposed());
    }

    #[test]
    fn test_global_schedulers_are_shared() {
        let a = Schedulers::single();
        let b = Schedulers::single();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.name(), "single");
        assert_eq!(Schedulers::immediate().name(), "immediate");
    }

    #[test]
    fn test_config_defaults() {
        let cfg = SchedulerConfig::default();
        assert!(cfg.workers >= 1);
        assert_eq!(cfg.queue_capacity, 1024);
    }
}
