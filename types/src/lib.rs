//! Core domain types for tether.
//!
//! This crate contains the request/response vocabulary shared by the dispatcher,
//! the keep-alive scheduler, and the simulated host. No IO, no async.

// Pedantic lint configuration - these are intentional design choices
#![allow(clippy::missing_errors_doc)] // Result-returning functions are self-explanatory

mod error;
pub use error::{CancelReason, DispatchError, ErrorKind, TransportError};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

// ============================================================================
// Message Kind
// ============================================================================

/// Type discriminator carried by every request, used for logging and routing.
///
/// Guaranteed non-empty after trimming.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MessageKind(String);

#[derive(Debug, Error)]
#[error("message kind must not be empty")]
pub struct EmptyKindError;

impl MessageKind {
    /// Kind used by keep-alive touches. Hosts answer it without running a handler.
    pub const KEEPALIVE: &'static str = "keepalive";

    pub fn new(value: impl Into<String>) -> Result<Self, EmptyKindError> {
        let value = value.into();
        if value.trim().is_empty() {
            Err(EmptyKindError)
        } else {
            Ok(Self(value))
        }
    }

    #[must_use]
    pub fn keepalive() -> Self {
        Self(Self::KEEPALIVE.to_string())
    }

    #[must_use]
    pub fn is_keepalive(&self) -> bool {
        self.0 == Self::KEEPALIVE
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for MessageKind {
    type Error = EmptyKindError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl TryFrom<&str> for MessageKind {
    type Error = EmptyKindError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<MessageKind> for String {
    fn from(value: MessageKind) -> Self {
        value.0
    }
}

impl AsRef<str> for MessageKind {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// Request
// ============================================================================

/// Correlation id shared by every attempt of one logical request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId(Uuid);

impl RequestId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A message bound for the opposite context.
///
/// Fields are private so a request cannot change after it is submitted;
/// retries resend a clone of the same value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    id: RequestId,
    #[serde(rename = "type")]
    kind: MessageKind,
    #[serde(default)]
    payload: Value,
}

impl Request {
    #[must_use]
    pub fn new(kind: MessageKind, payload: Value) -> Self {
        Self {
            id: RequestId::new(),
            kind,
            payload,
        }
    }

    /// Build a request from a raw kind string.
    pub fn parse(kind: &str, payload: Value) -> Result<Self, EmptyKindError> {
        Ok(Self::new(MessageKind::new(kind)?, payload))
    }

    #[must_use]
    pub fn keepalive() -> Self {
        Self::new(MessageKind::keepalive(), Value::Null)
    }

    #[must_use]
    pub fn id(&self) -> RequestId {
        self.id
    }

    #[must_use]
    pub fn kind(&self) -> &MessageKind {
        &self.kind
    }

    #[must_use]
    pub fn payload(&self) -> &Value {
        &self.payload
    }
}

// ============================================================================
// Response
// ============================================================================

/// What the receiving context answered.
///
/// `Error` is the application-level error marker: the message was delivered
/// but the handler reported a failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Response {
    Success { payload: Value },
    Error { error: String },
}

impl Response {
    #[must_use]
    pub fn success(payload: Value) -> Self {
        Self::Success { payload }
    }

    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            error: message.into(),
        }
    }

    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    /// Split into the payload or the remote error descriptor.
    pub fn into_result(self) -> Result<Value, TransportError> {
        match self {
            Self::Success { payload } => Ok(payload),
            Self::Error { error } => Err(TransportError::Remote(error)),
        }
    }
}

// ============================================================================
// Attempt Outcome
// ============================================================================

/// Terminal state of one attempt. `Pending` until the race resolves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AttemptOutcome {
    #[default]
    Pending,
    Succeeded,
    TimedOut,
    Failed,
    Cancelled,
}

impl AttemptOutcome {
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }

    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Succeeded => "succeeded",
            Self::TimedOut => "timed-out",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}
