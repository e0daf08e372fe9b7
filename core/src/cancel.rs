//! Cancellation token shared by every attempt of one logical request.
//!
//! The token is a monotonic `aborted` flag plus an ordered list of listeners.
//! `cancel()` flips the flag, runs the listeners synchronously in registration
//! order, then drops them. Async code waits on [`CancellationToken::cancelled`].
//!
//! Child tokens follow their parent: cancelling the parent cancels every live
//! child, while cancelling a child leaves the parent untouched. The dispatcher
//! hands each attempt a child so a timed-out attempt can be abandoned without
//! aborting the whole call.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tokio::sync::watch;

type Listener = Box<dyn FnOnce() + Send + 'static>;

/// Handle returned by [`CancellationToken::on_abort`], used to deregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

#[derive(Clone)]
pub struct CancellationToken {
    inner: Arc<Inner>,
}

struct Inner {
    aborted: AtomicBool,
    /// `None` once cancelled; registrations after that run immediately.
    listeners: Mutex<Option<Vec<(ListenerId, Listener)>>>,
    next_listener: AtomicU64,
    signal: watch::Sender<bool>,
    /// Registration on the parent token, removed when this token is dropped.
    parent: Mutex<Option<(Weak<Inner>, ListenerId)>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl CancellationToken {
    #[must_use]
    pub fn new() -> Self {
        let (signal, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                aborted: AtomicBool::new(false),
                listeners: Mutex::new(Some(Vec::new())),
                next_listener: AtomicU64::new(0),
                signal,
                parent: Mutex::new(None),
            }),
        }
    }

    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.inner.aborted.load(Ordering::Acquire)
    }

    /// Abort the token. Only the first call has any effect.
    pub fn cancel(&self) {
        if self.inner.aborted.swap(true, Ordering::AcqRel) {
            return;
        }
        // Take the listeners out before running them so a listener may touch
        // this token (or drop a child of it) without deadlocking.
        let listeners = lock(&self.inner.listeners).take().unwrap_or_default();
        for (_, listener) in listeners {
            listener();
        }
        self.inner.signal.send_replace(true);
    }

    /// Run `listener` once when the token is cancelled.
    ///
    /// If the token is already cancelled the listener runs immediately, on the
    /// caller's stack, before this returns.
    pub fn on_abort<F>(&self, listener: F) -> ListenerId
    where
        F: FnOnce() + Send + 'static,
    {
        let id = ListenerId(self.inner.next_listener.fetch_add(1, Ordering::Relaxed));
        let mut guard = lock(&self.inner.listeners);
        match guard.as_mut() {
            Some(listeners) => listeners.push((id, Box::new(listener))),
            None => {
                drop(guard);
                listener();
            }
        }
        id
    }

    /// Deregister a listener. Returns `false` if it already ran or was removed.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.inner.remove_listener(id)
    }

    #[must_use]
    pub fn listener_count(&self) -> usize {
        lock(&self.inner.listeners).as_ref().map_or(0, Vec::len)
    }

    /// Completes once the token is cancelled (immediately if it already is).
    pub async fn cancelled(&self) {
        let mut rx = self.inner.signal.subscribe();
        // The sender lives inside `self`, so this only returns once aborted.
        let _ = rx.wait_for(|aborted| *aborted).await;
    }

    /// Derive a token that is cancelled together with `self`.
    #[must_use]
    pub fn child(&self) -> Self {
        let child = Self::new();
        let weak_child = Arc::downgrade(&child.inner);
        let id = self.on_abort(move || {
            if let Some(inner) = weak_child.upgrade() {
                CancellationToken { inner }.cancel();
            }
        });
        *lock(&child.inner.parent) = Some((Arc::downgrade(&self.inner), id));
        child
    }
}

impl Inner {
    fn remove_listener(&self, id: ListenerId) -> bool {
        lock(&self.listeners).as_mut().is_some_and(|listeners| {
            let before = listeners.len();
            listeners.retain(|(registered, _)| *registered != id);
            listeners.len() != before
        })
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let parent = self
            .parent
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some((parent, id)) = parent
            && let Some(parent) = parent.upgrade()
        {
            parent.remove_listener(id);
        }
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancellationToken")
            .field("aborted", &self.is_aborted())
            .field("listeners", &self.listener_count())
            .finish()
    }
}
