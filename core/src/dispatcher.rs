//! Message dispatcher: cancellable, timeout-bounded, retrying request/response.
//!
//! # Call lifecycle
//!
//! ```text
//! send() -> supersede prior call -> Racing(0) -> BackingOff(0) -> Racing(1) -> ... -> Terminal
//! ```
//!
//! One [`CancellationToken`] spans every attempt of a call, so `cancel()` during
//! a race or during a backoff sleep ends the whole call. A dispatcher tracks one
//! active call: starting a new `send()` cancels the previous one (last call
//! wins) and waits for it to resolve before the first attempt goes out. That
//! wait is bounded by [`SUPERSEDE_GRACE`]: a prior future nobody polls any more
//! can only ever resolve `Cancelled`, so the new call does not block on it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::oneshot;

use tether_config::DispatchConfig;
use tether_types::{CancelReason, DispatchError, MessageKind, Request};

use crate::cancel::CancellationToken;
use crate::race::{Attempt, AttemptError, race};
use crate::retry::{RetryDecision, RetryPolicy, RetryState};
use crate::transport::SendPrimitive;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Longest a superseding call waits for the prior call to observe its cancel.
pub const SUPERSEDE_GRACE: Duration = Duration::from_millis(100);

/// Per-call options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendOptions {
    /// Deadline for each attempt. Zero disables the deadline.
    pub timeout: Duration,
    /// Retries after the first attempt.
    pub retries: u32,
}

impl Default for SendOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            retries: 0,
        }
    }
}

impl SendOptions {
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }
}

impl From<&DispatchConfig> for SendOptions {
    fn from(config: &DispatchConfig) -> Self {
        Self {
            timeout: config.timeout(),
            retries: config.retries,
        }
    }
}

/// Where a call is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Pending,
    Racing(u32),
    BackingOff(u32),
    Terminal,
}

impl Phase {
    fn can_advance_to(self, next: Phase) -> bool {
        match (self, next) {
            (_, Phase::Terminal) => self != Phase::Terminal,
            (Phase::Pending, Phase::Racing(0)) => true,
            (Phase::Racing(a), Phase::BackingOff(b)) => a == b,
            (Phase::BackingOff(a), Phase::Racing(b)) => b == a + 1,
            _ => false,
        }
    }
}

struct ActiveCall {
    id: u64,
    token: CancellationToken,
    reason: Arc<OnceLock<CancelReason>>,
    finished: oneshot::Receiver<()>,
}

struct Shared<S> {
    transport: Arc<S>,
    policy: RetryPolicy,
    defaults: SendOptions,
    active: Mutex<Option<ActiveCall>>,
    next_call: AtomicU64,
}

/// Dispatches requests through a [`SendPrimitive`].
///
/// Cloning yields another handle to the same dispatcher: `cancel()` on any
/// clone affects the call started through any other.
pub struct Dispatcher<S> {
    shared: Arc<Shared<S>>,
}

impl<S> Clone for Dispatcher<S> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Held for the duration of one `send()`.
///
/// Dropping it clears the active slot (if this call still owns it) and then
/// signals anyone waiting for this call to finish.
struct CallGuard<'a, S> {
    shared: &'a Shared<S>,
    id: u64,
    token: CancellationToken,
    reason: Arc<OnceLock<CancelReason>>,
    _finished: oneshot::Sender<()>,
}

impl<S> CallGuard<'_, S> {
    fn cancelled(&self, kind: &MessageKind) -> DispatchError {
        DispatchError::Cancelled {
            kind: kind.clone(),
            reason: self.reason.get().copied().unwrap_or(CancelReason::Explicit),
        }
    }
}

impl<S> Drop for CallGuard<'_, S> {
    fn drop(&mut self) {
        let mut slot = lock(&self.shared.active);
        if slot.as_ref().is_some_and(|call| call.id == self.id) {
            *slot = None;
        }
    }
}

impl<S: SendPrimitive> Dispatcher<S> {
    #[must_use]
    pub fn new(transport: Arc<S>) -> Self {
        Self::with_policy(transport, RetryPolicy::default(), SendOptions::default())
    }

    #[must_use]
    pub fn with_policy(transport: Arc<S>, policy: RetryPolicy, defaults: SendOptions) -> Self {
        Self {
            shared: Arc::new(Shared {
                transport,
                policy,
                defaults,
                active: Mutex::new(None),
                next_call: AtomicU64::new(0),
            }),
        }
    }

    #[must_use]
    pub fn from_config(transport: Arc<S>, config: &DispatchConfig) -> Self {
        Self::with_policy(transport, RetryPolicy::from(config), SendOptions::from(config))
    }

    #[must_use]
    pub fn defaults(&self) -> SendOptions {
        self.shared.defaults
    }

    /// True while a `send()` is between its start and its terminal result.
    #[must_use]
    pub fn is_loading(&self) -> bool {
        lock(&self.shared.active).is_some()
    }

    /// Cancel the active call, if any. Returns whether there was one.
    pub fn cancel(&self) -> bool {
        let token = lock(&self.shared.active).as_ref().map(|call| {
            let _ = call.reason.set(CancelReason::Explicit);
            call.token.clone()
        });
        match token {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Handle to the active call's token, for callers that cancel through it.
    #[must_use]
    pub fn current_token(&self) -> Option<CancellationToken> {
        lock(&self.shared.active)
            .as_ref()
            .map(|call| call.token.clone())
    }

    /// Send with the dispatcher's default options.
    pub async fn request(&self, request: Request) -> Result<Value, DispatchError> {
        self.send(request, self.shared.defaults).await
    }

    /// Send `request`, retrying per `options`, and return the success payload.
    ///
    /// A call already in flight on this dispatcher is cancelled with
    /// [`CancelReason::Superseded`]. This call waits up to [`SUPERSEDE_GRACE`]
    /// for it to finish before issuing its first attempt.
    pub async fn send(&self, request: Request, options: SendOptions) -> Result<Value, DispatchError> {
        let (call, prior) = self.begin();

        if let Some(prior) = prior {
            tokio::select! {
                biased;
                () = call.token.cancelled() => return Err(call.cancelled(request.kind())),
                _ = prior => {}
                () = tokio::time::sleep(SUPERSEDE_GRACE) => {
                    tracing::debug!(
                        kind = %request.kind(),
                        request_id = %request.id(),
                        "Superseded call still pending; starting anyway"
                    );
                }
            }
        }

        self.run(&request, options, &call).await
    }

    /// Install a new active call, superseding the previous one.
    fn begin(&self) -> (CallGuard<'_, S>, Option<oneshot::Receiver<()>>) {
        let id = self.shared.next_call.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        let reason = Arc::new(OnceLock::new());
        let (finished_tx, finished_rx) = oneshot::channel();

        let prior = lock(&self.shared.active).replace(ActiveCall {
            id,
            token: token.clone(),
            reason: reason.clone(),
            finished: finished_rx,
        });

        // Cancel outside the lock: listeners may call back into the dispatcher.
        let prior_finished = prior.map(|prior| {
            let _ = prior.reason.set(CancelReason::Superseded);
            tracing::debug!(call = prior.id, by = id, "Superseding in-flight call");
            prior.token.cancel();
            prior.finished
        });

        let guard = CallGuard {
            shared: &self.shared,
            id,
            token,
            reason,
            _finished: finished_tx,
        };
        (guard, prior_finished)
    }

    async fn run(
        &self,
        request: &Request,
        options: SendOptions,
        call: &CallGuard<'_, S>,
    ) -> Result<Value, DispatchError> {
        let kind = request.kind();
        let mut retry = RetryState::new(options.retries);
        let mut phase = Phase::Pending;
        let mut index = 0;

        loop {
            advance(&mut phase, Phase::Racing(index), request);
            let mut attempt = Attempt::new(index, options.timeout);
            tracing::debug!(
                kind = %kind,
                request_id = %request.id(),
                attempt = index,
                timeout_ms = options.timeout.as_millis() as u64,
                "Dispatching attempt"
            );

            let error = match race(self.shared.transport.as_ref(), request, &mut attempt, &call.token)
                .await
            {
                Ok(payload) => {
                    advance(&mut phase, Phase::Terminal, request);
                    return Ok(payload);
                }
                Err(error) => error,
            };

            match self.shared.policy.decide(&mut retry, &error) {
                RetryDecision::Retry { delay } => {
                    advance(&mut phase, Phase::BackingOff(index), request);
                    tracing::warn!(
                        kind = %kind,
                        request_id = %request.id(),
                        remaining = retry.remaining(),
                        error = %error,
                        delay_ms = delay.as_millis() as u64,
                        "Retrying request"
                    );
                    tokio::select! {
                        biased;
                        () = call.token.cancelled() => {
                            advance(&mut phase, Phase::Terminal, request);
                            tracing::debug!(kind = %kind, request_id = %request.id(), "Cancelled during backoff");
                            return Err(call.cancelled(kind));
                        }
                        () = tokio::time::sleep(delay) => {}
                    }
                    index += 1;
                }
                RetryDecision::Stop => {
                    advance(&mut phase, Phase::Terminal, request);
                    return Err(Self::terminal_error(error, request, options, call, index + 1));
                }
            }
        }
    }

    fn terminal_error(
        error: AttemptError,
        request: &Request,
        options: SendOptions,
        call: &CallGuard<'_, S>,
        attempts: u32,
    ) -> DispatchError {
        let kind = request.kind();
        let err = match error {
            AttemptError::Cancelled => {
                let err = call.cancelled(kind);
                tracing::debug!(kind = %kind, request_id = %request.id(), error = %err, "Request cancelled");
                return err;
            }
            AttemptError::Timeout => DispatchError::Timeout {
                kind: kind.clone(),
                timeout: options.timeout,
            },
            AttemptError::Transport(source) => DispatchError::TransportFailure {
                kind: kind.clone(),
                source,
            },
        }
        .exhausted(attempts);

        tracing::error!(
            kind = %kind,
            request_id = %request.id(),
            timeout_ms = options.timeout.as_millis() as u64,
            retries = options.retries,
            error = %err,
            "Request failed"
        );
        err
    }
}

fn advance(phase: &mut Phase, next: Phase, request: &Request) {
    debug_assert!(
        phase.can_advance_to(next),
        "illegal call transition {phase:?} -> {next:?}"
    );
    tracing::trace!(request_id = %request.id(), from = ?phase, to = ?next, "Call phase");
    *phase = next;
}
