//! One attempt: the send primitive raced against a deadline and cancellation.
//!
//! Whichever of delivery, timer, or cancellation settles first decides the
//! attempt. The losers are torn down before the result is acted on: the timer
//! future is dropped with the `select!`, and the attempt's child token is
//! cancelled so a late completion is discarded inside the callback instead of
//! reaching the caller.

use std::fmt;
use std::future;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::oneshot;
use tokio::time::{Instant, sleep_until};

use tether_types::{AttemptOutcome, Request, Response, TransportError};

use crate::cancel::CancellationToken;
use crate::transport::SendPrimitive;

/// Why an attempt did not produce a payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptError {
    Timeout,
    Cancelled,
    Transport(TransportError),
}

impl AttemptError {
    #[must_use]
    pub const fn outcome(&self) -> AttemptOutcome {
        match self {
            Self::Timeout => AttemptOutcome::TimedOut,
            Self::Cancelled => AttemptOutcome::Cancelled,
            Self::Transport(_) => AttemptOutcome::Failed,
        }
    }
}

impl fmt::Display for AttemptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => f.write_str("attempt timed out"),
            Self::Cancelled => f.write_str("attempt cancelled"),
            Self::Transport(err) => err.fmt(f),
        }
    }
}

/// Bookkeeping for one send primitive invocation.
#[derive(Debug, Clone)]
pub struct Attempt {
    index: u32,
    deadline: Option<Instant>,
    outcome: AttemptOutcome,
}

impl Attempt {
    /// Start attempt `index` now.
    ///
    /// A zero `timeout`, or one too large to represent as an instant, means no
    /// deadline.
    #[must_use]
    pub fn new(index: u32, timeout: Duration) -> Self {
        let deadline = if timeout.is_zero() {
            None
        } else {
            Instant::now().checked_add(timeout)
        };
        Self {
            index,
            deadline,
            outcome: AttemptOutcome::Pending,
        }
    }

    #[must_use]
    pub fn index(&self) -> u32 {
        self.index
    }

    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    #[must_use]
    pub fn outcome(&self) -> AttemptOutcome {
        self.outcome
    }

    /// Record the outcome. Only the first terminal outcome sticks.
    pub fn record(&mut self, outcome: AttemptOutcome) -> bool {
        if self.outcome.is_terminal() || !outcome.is_terminal() {
            return false;
        }
        self.outcome = outcome;
        true
    }
}

/// Run one attempt of `request` through `transport`.
///
/// Returns immediately with [`AttemptError::Cancelled`], without touching the
/// transport, if `token` is already aborted.
pub async fn race<S>(
    transport: &S,
    request: &Request,
    attempt: &mut Attempt,
    token: &CancellationToken,
) -> Result<Value, AttemptError>
where
    S: SendPrimitive + ?Sized,
{
    if token.is_aborted() {
        attempt.record(AttemptOutcome::Cancelled);
        return Err(AttemptError::Cancelled);
    }

    let attempt_token = token.child();
    let (tx, rx) = oneshot::channel();
    {
        let abandoned = attempt_token.clone();
        let kind = request.kind().clone();
        let index = attempt.index();
        transport.send(
            request.clone(),
            Box::new(move |result| {
                if abandoned.is_aborted() {
                    tracing::trace!(%kind, attempt = index, "Discarding completion for abandoned attempt");
                    return;
                }
                if tx.send(result).is_err() {
                    tracing::trace!(%kind, attempt = index, "Discarding completion after race resolved");
                }
            }),
        );
    }

    let deadline = attempt.deadline();
    let timer = async move {
        match deadline {
            Some(deadline) => sleep_until(deadline).await,
            None => future::pending::<()>().await,
        }
    };

    let result = tokio::select! {
        biased;
        () = token.cancelled() => Err(AttemptError::Cancelled),
        delivered = rx => match delivered {
            Ok(Ok(response)) => Response::into_result(response).map_err(AttemptError::Transport),
            Ok(Err(err)) => Err(AttemptError::Transport(err)),
            Err(_) => Err(AttemptError::Transport(TransportError::CompletionDropped)),
        },
        () = timer => Err(AttemptError::Timeout),
    };

    match &result {
        Ok(_) => {
            attempt.record(AttemptOutcome::Succeeded);
        }
        Err(err) => {
            attempt_token.cancel();
            attempt.record(err.outcome());
        }
    }
    result
}
