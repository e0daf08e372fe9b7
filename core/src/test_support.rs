//! Scripted send primitive for unit tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::time::Instant;

use tether_types::{Request, Response, TransportError};

use crate::transport::{Completion, SendPrimitive};

#[derive(Debug, Clone)]
pub(crate) enum Behavior {
    /// Complete synchronously inside `send`.
    Respond(Response),
    /// Complete from a spawned task after a delay.
    RespondAfter(Duration, Response),
    Fail(TransportError),
    /// Keep the completion forever without calling it.
    Hang,
    /// Drop the completion without calling it.
    Drop,
}

impl Behavior {
    pub(crate) fn reply(payload: Value) -> Self {
        Self::Respond(Response::success(payload))
    }

    pub(crate) fn reply_after(delay: Duration, payload: Value) -> Self {
        Self::RespondAfter(delay, Response::success(payload))
    }
}

pub(crate) struct Scripted {
    script: Mutex<VecDeque<Behavior>>,
    fallback: Behavior,
    sent: Mutex<Vec<(Instant, Request)>>,
    held: Mutex<Vec<Completion>>,
    delivered: Arc<AtomicUsize>,
}

impl Scripted {
    /// Play `script` in order, then hang on every later call.
    pub(crate) fn new(script: impl IntoIterator<Item = Behavior>) -> Arc<Self> {
        Self::with_fallback(script, Behavior::Hang)
    }

    pub(crate) fn always(behavior: Behavior) -> Arc<Self> {
        Self::with_fallback([], behavior)
    }

    pub(crate) fn with_fallback(
        script: impl IntoIterator<Item = Behavior>,
        fallback: Behavior,
    ) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into_iter().collect()),
            fallback,
            sent: Mutex::new(Vec::new()),
            held: Mutex::new(Vec::new()),
            delivered: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub(crate) fn calls(&self) -> usize {
        self.sent.lock().expect("sent lock").len()
    }

    pub(crate) fn sent_at(&self) -> Vec<Instant> {
        self.sent
            .lock()
            .expect("sent lock")
            .iter()
            .map(|(at, _)| *at)
            .collect()
    }

    pub(crate) fn requests(&self) -> Vec<Request> {
        self.sent
            .lock()
            .expect("sent lock")
            .iter()
            .map(|(_, request)| request.clone())
            .collect()
    }

    pub(crate) fn completions_delivered(&self) -> usize {
        self.delivered.load(Ordering::SeqCst)
    }

    /// Complete every held completion with `payload`.
    pub(crate) fn release_held(&self, payload: &Value) {
        let held: Vec<_> = self.held.lock().expect("held lock").drain(..).collect();
        for completion in held {
            self.delivered.fetch_add(1, Ordering::SeqCst);
            completion(Ok(Response::success(payload.clone())));
        }
    }
}

impl SendPrimitive for Scripted {
    fn send(&self, request: Request, completion: Completion) {
        self.sent
            .lock()
            .expect("sent lock")
            .push((Instant::now(), request));
        let behavior = self
            .script
            .lock()
            .expect("script lock")
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());

        match behavior {
            Behavior::Respond(response) => {
                self.delivered.fetch_add(1, Ordering::SeqCst);
                completion(Ok(response));
            }
            Behavior::RespondAfter(delay, response) => {
                let delivered = self.delivered.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    delivered.fetch_add(1, Ordering::SeqCst);
                    completion(Ok(response));
                });
            }
            Behavior::Fail(err) => {
                self.delivered.fetch_add(1, Ordering::SeqCst);
                completion(Err(err));
            }
            Behavior::Hang => self.held.lock().expect("held lock").push(completion),
            Behavior::Drop => drop(completion),
        }
    }
}
