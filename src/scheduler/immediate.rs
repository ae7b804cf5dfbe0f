use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::error::{FluxError, FluxResult, SchedulerRejection};

use super::{RejectionHandler, Scheduler, Task, TaskHandle};

/// Scheduler that runs every task inline, on the submitting thread.
///
/// Delayed tasks are not supported: blocking the caller would defeat the
/// point of a timer-driven source.
#[derive(Debug, Default)]
pub struct ImmediateScheduler {
    shutdown: AtomicBool,
}

impl ImmediateScheduler {
    /// Creates the scheduler.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl Scheduler for ImmediateScheduler {
    fn name(&self) -> &str {
        "immediate"
    }

    fn schedule(&self, task: Task) -> FluxResult<TaskHandle> {
        if self.is_shutdown() {
            return Err(FluxError::Scheduler(SchedulerRejection::Shutdown {
                scheduler: self.name().to_string(),
            }));
        }
        task();
        Ok(TaskHandle::new())
    }

    fn schedule_delayed(
        &self,
        _task: Task,
        _delay: Duration,
        _on_rejected: RejectionHandler,
    ) -> FluxResult<TaskHandle> {
        Err(FluxError::Scheduler(SchedulerRejection::DelayUnsupported {
            scheduler: self.name().to_string(),
        }))
    }

    fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    fn dispose(&self) {
        self.shutdown.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[test]
    fn test_runs_inline() {
        let scheduler = ImmediateScheduler::new();
        let caller = std::thread::current().id();
        let ran_on = Arc::new(std::sync::Mutex::new(None));
        let slot = Arc::clone(&ran_on);
        scheduler
            .schedule(Box::new(move || {
                *slot.lock().unwrap() = Some(std::thread::current().id());
            }))
            .unwrap();
        assert_eq!(*ran_on.lock().unwrap(), Some(caller));
    }

    #[test]
    fn test_delay_is_rejected() {
        let scheduler = ImmediateScheduler::new();
        let ran = Arc::new(AtomicUsize::new(0));
        let r = Arc::clone(&ran);
        let err = scheduler
            .schedule_delayed(
                Box::new(move || {
                    r.fetch_add(1, Ordering::SeqCst);
                }),
                Duration::from_millis(1),
                Box::new(|_| {}),
            )
            .unwrap_err();
        assert!(err.is_scheduler_rejection());
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }
}
