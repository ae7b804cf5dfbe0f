//! Error types for KyroFlux.
//!
//! All errors in KyroFlux are strongly typed using thiserror.
//! Errors travel through a chain as `OnError` signals, so every variant is
//! cloneable: a cached sequence replays one recorded error to many subscribers.

use thiserror::Error;

use crate::signal::SignalKind;

/// Violations of the Reactive Streams signalling protocol.
///
/// These are fatal for the subscription they occur on and are always reported
/// (see [`crate::hooks`]) rather than silently tolerated.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolViolation {
    /// `on_subscribe` arrived twice.
    #[error("Subscriber received a second onSubscribe")]
    DuplicateSubscription,

    /// A data or terminal signal preceded `on_subscribe`.
    #[error("Signal {signal} arrived before onSubscribe")]
    SignalBeforeSubscribe {
        /// The early signal.
        signal: SignalKind,
    },

    /// A signal followed `on_error` or `on_complete`.
    #[error("Signal {signal} arrived after a terminal signal")]
    SignalAfterTerminal {
        /// The late signal.
        signal: SignalKind,
    },

    /// A prefetching stage got more items than its queue was sized for.
    #[error("Stage '{stage}' received more items than it requested (capacity {capacity})")]
    QueueOverflow {
        /// Stage name, e.g. `publishOn`.
        stage: &'static str,
        /// Queue capacity of the stage.
        capacity: usize,
    },

    /// A blocking call was made from a scheduler worker thread.
    #[error("Blocking is not allowed on a worker of scheduler '{scheduler}'")]
    BlockingInWorker {
        /// Name of the scheduler owning the thread.
        scheduler: String,
    },
}

/// Reasons a scheduler refused a task.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchedulerRejection {
    /// The scheduler was disposed.
    #[error("Scheduler '{scheduler}' is shut down")]
    Shutdown {
        /// Scheduler name.
        scheduler: String,
    },

    /// The bounded task queue had no room.
    #[error("Scheduler '{scheduler}' queue is full (capacity {capacity})")]
    QueueFull {
        /// Scheduler name.
        scheduler: String,
        /// Configured queue capacity.
        capacity: usize,
    },

    /// The scheduler cannot run tasks after a delay.
    #[error("Scheduler '{scheduler}' does not support delayed tasks")]
    DelayUnsupported {
        /// Scheduler name.
        scheduler: String,
    },
}

/// Top-level error type for KyroFlux.
///
/// This enum encompasses every error a subscriber can observe through
/// `OnError`, plus the failures of the blocking edge.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FluxError {
    /// The signal protocol was broken.
    #[error("Protocol violation: {0}")]
    Protocol(#[from] ProtocolViolation),

    /// `request(n)` was called with `n <= 0`.
    #[error("Illegal demand: request({requested}) must be positive")]
    IllegalDemand {
        /// The rejected amount.
        requested: i64,
    },

    /// A source or user callback failed.
    #[error("Upstream failure: {message}")]
    Upstream {
        /// Failure description.
        message: String,
    },

    /// A scheduler refused work the chain depends on.
    #[error("Scheduler rejected task: {0}")]
    Scheduler(#[from] SchedulerRejection),

    /// A stage had an item to emit but no outstanding demand.
    #[error("Could not emit {stage} item: no outstanding demand")]
    Overflow {
        /// Stage name.
        stage: &'static str,
    },

    /// A blocking wait ran out of time.
    #[error("Operation timed out after {duration_ms}ms")]
    Timeout {
        /// The timeout that elapsed.
        duration_ms: u64,
    },

    /// A bug inside the runtime.
    #[error("Internal error: {message}")]
    Internal {
        /// Failure description.
        message: String,
    },
}

impl FluxError {
    /// Creates an upstream failure (an error raised while producing or transforming an item).
    #[must_use]
    pub fn upstream(message: impl Into<String>) -> Self {
        Self::Upstream {
            message: message.into(),
        }
    }

    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns true if this is a protocol violation.
    #[must_use]
    pub const fn is_protocol(&self) -> bool {
        matches!(self, Self::Protocol(_))
    }

    /// Returns true if this is an illegal demand error.
    #[must_use]
    pub const fn is_illegal_demand(&self) -> bool {
        matches!(self, Self::IllegalDemand { .. })
    }

    /// Returns true if this is an upstream failure.
    #[must_use]
    pub const fn is_upstream(&self) -> bool {
        matches!(self, Self::Upstream { .. })
    }

    /// Returns true if a scheduler refused work.
    #[must_use]
    pub const fn is_scheduler_rejection(&self) -> bool {
        matches!(self, Self::Scheduler(_))
    }

    /// Returns true if this is a timeout.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Result type alias for KyroFlux operations.
pub type FluxResult<T> = Result<T, FluxError>;
