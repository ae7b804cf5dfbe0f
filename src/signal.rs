//! Reactive Streams signals.
//!
//! A subscription sees exactly one `OnSubscribe`, any number of `OnNext`
//! (bounded by demand), then at most one terminal signal.

use std::fmt;

use crate::error::FluxError;
use crate::subscription::SubscriptionRef;

/// A signal travelling from a publisher to its subscriber.
pub enum Signal<T> {
    /// Subscription handshake; always first.
    OnSubscribe(SubscriptionRef),
    /// One item.
    OnNext(T),
    /// Terminal failure.
    OnError(FluxError),
    /// Terminal success.
    OnComplete,
}

impl<T> Signal<T> {
    /// The kind of this signal, without its payload.
    #[must_use]
    pub const fn kind(&self) -> SignalKind {
        match self {
            Self::OnSubscribe(_) => SignalKind::OnSubscribe,
            Self::OnNext(_) => SignalKind::OnNext,
            Self::OnError(_) => SignalKind::OnError,
            Self::OnComplete => SignalKind::OnComplete,
        }
    }

    /// Returns true for `OnError` and `OnComplete`.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        self.kind().is_terminal()
    }
}

impl<T: fmt::Debug> fmt::Debug for Signal<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OnSubscribe(_) => f.write_str("OnSubscribe"),
            Self::OnNext(item) => f.debug_tuple("OnNext").field(item).finish(),
            Self::OnError(err) => f.debug_tuple("OnError").field(err).finish(),
            Self::OnComplete => f.write_str("OnComplete"),
        }
    }
}

/// Payload-free signal discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalKind {
    /// Subscription handed to the subscriber.
    OnSubscribe,
    /// One item.
    OnNext,
    /// Failure terminal.
    OnError,
    /// Success terminal.
    OnComplete,
    /// Not a protocol signal; reported to `hook_finally` when the subscriber cancelled.
    Cancel,
}

impl SignalKind {
    /// Returns true for `OnError` and `OnComplete`.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::OnError | Self::OnComplete)
    }
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::OnSubscribe => "onSubscribe",
            Self::OnNext => "onNext",
            Self::OnError => "onError",
            Self::OnComplete => "onComplete",
            Self::Cancel => "cancel",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_kinds() {
        assert!(Signal::<i32>::OnComplete.is_terminal());
        assert!(Signal::<i32>::OnError(FluxError::upstream("x")).is_terminal());
        assert!(!Signal::OnNext(1).is_terminal());
        assert!(!SignalKind::Cancel.is_terminal());
    }

    #[test]
    fn test_signal_debug() {
        assert_eq!(format!("{:?}", Signal::OnNext(7)), "OnNext(7)");
        assert_eq!(format!("{:?}", Signal::<u8>::OnComplete), "OnComplete");
        assert_eq!(SignalKind::OnNext.to_string(), "onNext");
    }
}
