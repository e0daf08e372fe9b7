//! Error taxonomy for dispatched requests.

use std::time::Duration;

use thiserror::Error;

use crate::MessageKind;

/// Failure reported by the send primitive, or carried in the response.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The receiving context does not exist (never started, or evicted).
    #[error("receiving context unreachable: {0}")]
    Unreachable(String),
    /// The completion callback was dropped without being invoked.
    #[error("receiving context went away before answering")]
    CompletionDropped,
    /// The message was delivered but the handler answered with an error.
    #[error("remote error: {0}")]
    Remote(String),
}

/// Why a call was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// `cancel()` was called on the dispatcher or the token.
    Explicit,
    /// A newer `send()` on the same dispatcher took over.
    Superseded,
}

impl CancelReason {
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Explicit => "explicit",
            Self::Superseded => "superseded",
        }
    }
}

/// The three base kinds every dispatch failure falls into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Timeout,
    Cancelled,
    TransportFailure,
}

/// Terminal error of one dispatcher call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("'{kind}' timed out after {}ms", timeout.as_millis())]
    Timeout {
        kind: MessageKind,
        timeout: Duration,
    },

    #[error("'{kind}' was cancelled ({})", reason.label())]
    Cancelled {
        kind: MessageKind,
        reason: CancelReason,
    },

    #[error("'{kind}' failed: {source}")]
    TransportFailure {
        kind: MessageKind,
        #[source]
        source: TransportError,
    },

    /// Every attempt failed; `last` is the error of the final attempt.
    #[error("{last} (after {attempts} attempts)")]
    RetriesExhausted {
        attempts: u32,
        last: Box<DispatchError>,
    },
}

impl DispatchError {
    /// Classify into a base kind, looking through `RetriesExhausted`.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Cancelled { .. } => ErrorKind::Cancelled,
            Self::TransportFailure { .. } => ErrorKind::TransportFailure,
            Self::RetriesExhausted { last, .. } => last.kind(),
        }
    }

    #[must_use]
    pub fn is_timeout(&self) -> bool {
        self.kind() == ErrorKind::Timeout
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.kind() == ErrorKind::Cancelled
    }

    #[must_use]
    pub fn is_transport_failure(&self) -> bool {
        self.kind() == ErrorKind::TransportFailure
    }

    /// Total attempts made before this error surfaced, when known.
    #[must_use]
    pub fn attempts(&self) -> Option<u32> {
        match self {
            Self::RetriesExhausted { attempts, .. } => Some(*attempts),
            _ => None,
        }
    }

    /// Wrap a final attempt error when more than one attempt ran.
    #[must_use]
    pub fn exhausted(self, attempts: u32) -> Self {
        if attempts > 1 {
            Self::RetriesExhausted {
                attempts,
                last: Box::new(self),
            }
        } else {
            self
        }
    }
}
