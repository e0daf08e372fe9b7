use std::sync::Arc;

use tokio::sync::mpsc;

use tether_core::{Completion, SendPrimitive};
use tether_types::{Request, TransportError};

use crate::worker::{Envelope, HostState};

/// Mirrors the platform's message when no worker is listening.
pub(crate) const NO_RECEIVER: &str = "Could not establish connection. Receiving end does not exist.";

/// UI-side send primitive into a [`crate::WorkerHost`].
#[derive(Clone)]
pub struct HostPort {
    inbox: mpsc::UnboundedSender<Envelope>,
    state: Arc<HostState>,
}

impl HostPort {
    pub(crate) fn new(inbox: mpsc::UnboundedSender<Envelope>, state: Arc<HostState>) -> Self {
        Self { inbox, state }
    }

    /// Whether the worker behind this port is still running.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state.is_alive() && !self.inbox.is_closed()
    }
}

impl SendPrimitive for HostPort {
    fn send(&self, request: Request, completion: Completion) {
        let envelope = Envelope {
            request,
            completion,
        };
        if let Err(mpsc::error::SendError(envelope)) = self.inbox.send(envelope) {
            tracing::debug!(kind = %envelope.request.kind(), "Worker gone; failing send");
            (envelope.completion)(Err(TransportError::Unreachable(NO_RECEIVER.to_string())));
        }
    }
}
