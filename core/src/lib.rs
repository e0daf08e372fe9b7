//! Reliable request/response between a UI context and an evictable worker.
//!
//! The host's send primitive delivers a message and calls back once, with no
//! timeout and no cancel. This crate layers on top of it:
//!
//! - [`CancellationToken`]: shared abort flag with listener fan-out.
//! - [`race`]: one attempt raced against a deadline and cancellation.
//! - [`RetryPolicy`]: exponential backoff between attempts.
//! - [`Dispatcher`]: cancellable, retrying `send()` with last-call-wins.
//! - [`KeepAlive`] / [`WorkerContext`]: periodic touches that keep the worker
//!   from being evicted while requests are in flight.

pub mod cancel;
pub mod dispatcher;
pub mod keepalive;
pub mod race;
pub mod retry;
pub mod transport;
pub mod worker;

#[cfg(test)]
pub(crate) mod test_support;

pub use cancel::{CancellationToken, ListenerId};
pub use dispatcher::{DEFAULT_TIMEOUT, Dispatcher, SUPERSEDE_GRACE, SendOptions};
pub use keepalive::{KeepAlive, ScopedLease};
pub use race::{Attempt, AttemptError, race};
pub use retry::{RetryDecision, RetryPolicy, RetryState};
pub use transport::{Completion, SendPrimitive};
pub use worker::WorkerContext;
