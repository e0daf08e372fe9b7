//! Shared test utilities and fixtures
//!
//! A scripted send primitive plus a tracing layer that records events, so
//! suites can assert on both results and log output.

#![allow(dead_code)]

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tracing::field::{Field, Visit};
use tracing::subscriber::DefaultGuard;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer};
use tracing_subscriber::prelude::*;

use tether_core::{Completion, SendPrimitive};
use tether_types::{Request, Response};

// ============================================================================
// Transport
// ============================================================================

/// Send primitive that either never answers or answers after a delay.
///
/// Unanswered completions are held, not dropped, so the dispatcher sees
/// silence rather than a vanished receiver.
pub struct FakeTransport {
    reply: Option<(Duration, Value)>,
    calls: AtomicUsize,
    held: Mutex<Vec<Completion>>,
}

impl FakeTransport {
    pub fn silent() -> Arc<Self> {
        Arc::new(Self {
            reply: None,
            calls: AtomicUsize::new(0),
            held: Mutex::new(Vec::new()),
        })
    }

    pub fn replying_after(delay: Duration, payload: Value) -> Arc<Self> {
        Arc::new(Self {
            reply: Some((delay, payload)),
            calls: AtomicUsize::new(0),
            held: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl SendPrimitive for FakeTransport {
    fn send(&self, _request: Request, completion: Completion) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.reply {
            Some((delay, payload)) => {
                let delay = *delay;
                let response = Response::success(payload.clone());
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    completion(Ok(response));
                });
            }
            None => self
                .held
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(completion),
        }
    }
}

// ============================================================================
// Log capture
// ============================================================================

#[derive(Debug, Clone)]
pub struct CapturedEvent {
    pub level: Level,
    pub target: String,
    pub message: String,
    pub lease: Option<String>,
}

/// Records every event emitted while its guard is installed.
#[derive(Clone, Default)]
pub struct LogCapture {
    events: Arc<Mutex<Vec<CapturedEvent>>>,
}

impl LogCapture {
    /// Install as the thread's default subscriber until the guard drops.
    ///
    /// Tests using this must run on the current-thread runtime.
    pub fn install() -> (Self, DefaultGuard) {
        let capture = Self::default();
        let subscriber = tracing_subscriber::registry().with(capture.clone());
        let guard = tracing::subscriber::set_default(subscriber);
        (capture, guard)
    }

    pub fn events(&self) -> Vec<CapturedEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Events at `level` from the dispatcher crate.
    pub fn count(&self, level: Level) -> usize {
        self.events()
            .iter()
            .filter(|event| event.level == level && event.target.starts_with("tether_core"))
            .count()
    }
}

#[derive(Default)]
struct EventVisitor {
    message: String,
    lease: Option<String>,
}

impl Visit for EventVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        match field.name() {
            "message" => self.message = format!("{value:?}"),
            "lease" => self.lease = Some(format!("{value:?}")),
            _ => {}
        }
    }
}

impl<S: Subscriber> Layer<S> for LogCapture {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = EventVisitor::default();
        event.record(&mut visitor);
        let metadata = event.metadata();
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(CapturedEvent {
                level: *metadata.level(),
                target: metadata.target().to_string(),
                message: visitor.message,
                lease: visitor.lease,
            });
    }
}
