use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::sleep;

use tether_core::{CancellationToken, Completion};
use tether_types::{Request, Response};

use crate::handler::Handler;
use crate::port::HostPort;

/// Why the worker task ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// No inbound message for a full eviction window.
    Evicted,
    /// [`WorkerHost::shutdown`] was called or the host was dropped.
    Shutdown,
    /// Every port was dropped.
    Disconnected,
}

impl StopReason {
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Evicted => "evicted",
            Self::Shutdown => "shutdown",
            Self::Disconnected => "disconnected",
        }
    }
}

pub(crate) struct Envelope {
    pub(crate) request: Request,
    pub(crate) completion: Completion,
}

pub(crate) struct HostState {
    stop: watch::Sender<Option<StopReason>>,
    touches: AtomicU64,
    handled: AtomicU64,
}

impl HostState {
    pub(crate) fn is_alive(&self) -> bool {
        self.stop.borrow().is_none()
    }
}

/// A running worker plus its inactivity-eviction clock.
pub struct WorkerHost {
    port: Arc<HostPort>,
    state: Arc<HostState>,
    shutdown: CancellationToken,
    eviction_window: Duration,
}

impl WorkerHost {
    /// Start a worker that answers requests with `handler`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn<H: Handler>(handler: H, eviction_window: Duration) -> Self {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let state = Arc::new(HostState {
            stop: watch::Sender::new(None),
            touches: AtomicU64::new(0),
            handled: AtomicU64::new(0),
        });
        let shutdown = CancellationToken::new();

        tokio::spawn(run_worker(
            Arc::new(handler),
            inbox_rx,
            eviction_window,
            Arc::clone(&state),
            shutdown.clone(),
        ));
        tracing::info!(
            eviction_window_ms = eviction_window.as_millis(),
            "Worker started"
        );

        Self {
            port: Arc::new(HostPort::new(inbox_tx, Arc::clone(&state))),
            state,
            shutdown,
            eviction_window,
        }
    }

    /// Send primitive for the UI side.
    #[must_use]
    pub fn port(&self) -> Arc<HostPort> {
        Arc::clone(&self.port)
    }

    #[must_use]
    pub fn eviction_window(&self) -> Duration {
        self.eviction_window
    }

    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.state.is_alive()
    }

    #[must_use]
    pub fn stop_reason(&self) -> Option<StopReason> {
        *self.state.stop.borrow()
    }

    /// Wait until the worker task has ended.
    pub async fn stopped(&self) -> StopReason {
        let mut rx = self.state.stop.subscribe();
        match rx.wait_for(Option::is_some).await {
            Ok(reason) => (*reason).unwrap_or(StopReason::Disconnected),
            Err(_) => StopReason::Disconnected,
        }
    }

    /// Keep-alive requests answered by the worker.
    #[must_use]
    pub fn touches(&self) -> u64 {
        self.state.touches.load(Ordering::Relaxed)
    }

    /// Application requests handed to the handler.
    #[must_use]
    pub fn handled(&self) -> u64 {
        self.state.handled.load(Ordering::Relaxed)
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

impl Drop for WorkerHost {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn run_worker<H: Handler>(
    handler: Arc<H>,
    mut inbox: mpsc::UnboundedReceiver<Envelope>,
    eviction_window: Duration,
    state: Arc<HostState>,
    shutdown: CancellationToken,
) {
    let mut in_flight = JoinSet::new();
    let idle = sleep(eviction_window);
    tokio::pin!(idle);

    let reason = loop {
        tokio::select! {
            biased;
            () = shutdown.cancelled() => break StopReason::Shutdown,
            envelope = inbox.recv() => {
                let Some(Envelope { request, completion }) = envelope else {
                    break StopReason::Disconnected;
                };
                idle.set(sleep(eviction_window));

                if request.kind().is_keepalive() {
                    state.touches.fetch_add(1, Ordering::Relaxed);
                    completion(Ok(Response::success(Value::Null)));
                    continue;
                }

                state.handled.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(kind = %request.kind(), request_id = %request.id(), "Handling request");
                let handler = Arc::clone(&handler);
                in_flight.spawn(async move {
                    let response = handler.handle(request).await;
                    completion(Ok(response));
                });
            }
            Some(_) = in_flight.join_next(), if !in_flight.is_empty() => {}
            () = &mut idle => break StopReason::Evicted,
        }
    };

    inbox.close();
    let mut dropped = 0usize;
    while inbox.try_recv().is_ok() {
        dropped += 1;
    }
    let abandoned = in_flight.len();
    in_flight.abort_all();
    state.stop.send_replace(Some(reason));

    tracing::info!(
        reason = reason.label(),
        dropped,
        abandoned,
        "Worker stopped"
    );
}
