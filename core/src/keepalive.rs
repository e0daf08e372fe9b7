//! Keep-alive scheduler for the evictable worker context.
//!
//! The host evicts the worker after a window of inactivity. A lease is a
//! background task that periodically sends a `keepalive` request through the
//! send primitive, which resets that inactivity clock.
//!
//! - The ambient lease runs at `ambient_period` for as long as the worker
//!   lives. There is at most one per worker in the process: starting it twice,
//!   or from a second scheduler on the same transport, is a no-op.
//! - Scoped leases run at the shorter `scoped_period` and stop on their own
//!   after a fixed duration, or when the operation they guard completes.
//!
//! Leases are independent; overlapping touches are harmless. Lease tasks are
//! spawned on the ambient tokio runtime, so every method that starts one must
//! be called from within a runtime.

use std::collections::BTreeMap;
use std::collections::btree_map::Entry;
use std::future::Future;
use std::mem;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::future::{AbortHandle, Abortable};
use tokio::time::{Instant, MissedTickBehavior, interval_at, sleep_until};

use tether_config::KeepAliveConfig;
use tether_types::{Request, Response};

use crate::transport::SendPrimitive;

const AMBIENT_LEASE: &str = "ambient";

/// Ambient lease owner per worker, keyed by the address of the transport into it.
static AMBIENT_OWNERS: Mutex<BTreeMap<usize, u64>> = Mutex::new(BTreeMap::new());
static NEXT_SCHEDULER: AtomicU64 = AtomicU64::new(0);

fn claim_ambient(worker: usize, owner: u64) -> bool {
    match lock(&AMBIENT_OWNERS).entry(worker) {
        Entry::Vacant(slot) => {
            slot.insert(owner);
            true
        }
        Entry::Occupied(slot) => *slot.get() == owner,
    }
}

fn release_ambient(worker: usize, owner: u64) {
    let mut owners = lock(&AMBIENT_OWNERS);
    if owners.get(&worker) == Some(&owner) {
        owners.remove(&worker);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A running lease task.
#[derive(Debug)]
struct Lease {
    name: String,
    abort: AbortHandle,
    running: Arc<AtomicBool>,
}

impl Lease {
    fn is_active(&self) -> bool {
        self.running.load(Ordering::Acquire) && !self.abort.is_aborted()
    }

    fn stop(&self) {
        if !self.abort.is_aborted() {
            tracing::debug!(lease = %self.name, "Stopping keep-alive lease");
        }
        self.abort.abort();
    }
}

/// Handle to a scoped lease.
///
/// Dropping the handle does not stop the lease; it runs until it expires,
/// [`ScopedLease::cancel`] is called, or the scheduler shuts down.
#[derive(Debug, Clone)]
pub struct ScopedLease {
    name: String,
    abort: AbortHandle,
    running: Arc<AtomicBool>,
    expires_at: Option<Instant>,
}

impl ScopedLease {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn expires_at(&self) -> Option<Instant> {
        self.expires_at
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.running.load(Ordering::Acquire) && !self.abort.is_aborted()
    }

    pub fn cancel(&self) {
        self.abort.abort();
    }
}

/// Stops a lease when dropped. Used by [`KeepAlive::hold`].
struct StopOnDrop(AbortHandle);

impl Drop for StopOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

struct Leases {
    ambient: Option<Lease>,
    scoped: Vec<Lease>,
}

pub struct KeepAlive<S> {
    id: u64,
    transport: Arc<S>,
    config: KeepAliveConfig,
    leases: Mutex<Leases>,
    next_scoped: AtomicU64,
}

impl<S: SendPrimitive> KeepAlive<S> {
    #[must_use]
    pub fn new(transport: Arc<S>, config: KeepAliveConfig) -> Self {
        Self {
            id: NEXT_SCHEDULER.fetch_add(1, Ordering::Relaxed),
            transport,
            config,
            leases: Mutex::new(Leases {
                ambient: None,
                scoped: Vec::new(),
            }),
            next_scoped: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn config(&self) -> &KeepAliveConfig {
        &self.config
    }

    /// Start the ambient lease.
    ///
    /// Returns `false` if it was already running, here or on another scheduler
    /// for the same worker.
    pub fn start_ambient(&self) -> bool {
        let mut leases = lock(&self.leases);
        if leases.ambient.as_ref().is_some_and(Lease::is_active) {
            return false;
        }
        if !claim_ambient(self.worker_key(), self.id) {
            tracing::debug!("Ambient keep-alive already owned by another scheduler");
            return false;
        }
        let period = self.config.ambient_period();
        leases.ambient = Some(self.spawn_lease(AMBIENT_LEASE.to_string(), period, None));
        tracing::info!(period_ms = period.as_millis() as u64, "Ambient keep-alive started");
        true
    }

    /// Stop the ambient lease. Returns `false` if it was not running.
    pub fn stop_ambient(&self) -> bool {
        let Some(lease) = lock(&self.leases).ambient.take() else {
            return false;
        };
        let was_active = lease.is_active();
        lease.stop();
        release_ambient(self.worker_key(), self.id);
        if was_active {
            tracing::info!("Ambient keep-alive stopped");
        }
        was_active
    }

    #[must_use]
    pub fn is_ambient_active(&self) -> bool {
        lock(&self.leases)
            .ambient
            .as_ref()
            .is_some_and(Lease::is_active)
    }

    /// Touch at the scoped period until `duration` has elapsed.
    ///
    /// A duration past the clock's range never expires.
    pub fn lease_for(&self, duration: Duration) -> ScopedLease {
        let expires_at = Instant::now().checked_add(duration);
        let lease = self.start_scoped(expires_at);
        tracing::debug!(
            lease = %lease.name,
            duration_ms = duration.as_millis() as u64,
            "Scoped keep-alive started"
        );
        lease
    }

    /// Keep the worker alive while `operation` runs.
    pub async fn hold<F>(&self, operation: F) -> F::Output
    where
        F: Future,
    {
        let lease = self.start_scoped(None);
        tracing::debug!(lease = %lease.name, "Scoped keep-alive held for operation");
        let _stop = StopOnDrop(lease.abort.clone());
        operation.await
    }

    /// Number of scoped leases still running.
    #[must_use]
    pub fn active_scoped(&self) -> usize {
        let mut leases = lock(&self.leases);
        leases.scoped.retain(Lease::is_active);
        leases.scoped.len()
    }

    /// Stop the ambient lease and every scoped lease.
    pub fn shutdown(&self) {
        let (ambient, scoped) = {
            let mut leases = lock(&self.leases);
            (leases.ambient.take(), mem::take(&mut leases.scoped))
        };
        let stopped = ambient
            .iter()
            .chain(scoped.iter())
            .filter(|lease| lease.is_active())
            .count();
        for lease in ambient.iter().chain(scoped.iter()) {
            lease.stop();
        }
        release_ambient(self.worker_key(), self.id);
        tracing::info!(stopped, "Keep-alive scheduler shut down");
    }

    fn worker_key(&self) -> usize {
        Arc::as_ptr(&self.transport).addr()
    }

    fn start_scoped(&self, expires_at: Option<Instant>) -> ScopedLease {
        let n = self.next_scoped.fetch_add(1, Ordering::Relaxed);
        let name = format!("scoped-{n}");
        let lease = self.spawn_lease(name.clone(), self.config.scoped_period(), expires_at);
        let handle = ScopedLease {
            name,
            abort: lease.abort.clone(),
            running: lease.running.clone(),
            expires_at,
        };

        let mut leases = lock(&self.leases);
        leases.scoped.retain(Lease::is_active);
        leases.scoped.push(lease);
        handle
    }

    fn spawn_lease(&self, name: String, period: Duration, expires_at: Option<Instant>) -> Lease {
        let (abort, registration) = AbortHandle::new_pair();
        let running = Arc::new(AtomicBool::new(true));

        let task = Abortable::new(
            run_lease(self.transport.clone(), name.clone(), period, expires_at),
            registration,
        );
        let running_for_task = running.clone();
        let name_for_task = name.clone();
        tokio::spawn(async move {
            if task.await.is_err() {
                tracing::debug!(lease = %name_for_task, "Keep-alive lease stopped");
            }
            running_for_task.store(false, Ordering::Release);
        });

        Lease {
            name,
            abort,
            running,
        }
    }
}

impl<S> Drop for KeepAlive<S> {
    fn drop(&mut self) {
        let leases = self
            .leases
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        for lease in leases.ambient.iter().chain(leases.scoped.iter()) {
            lease.abort.abort();
        }
        release_ambient(Arc::as_ptr(&self.transport).addr(), self.id);
    }
}

async fn run_lease<S>(
    transport: Arc<S>,
    name: String,
    period: Duration,
    expires_at: Option<Instant>,
) where
    S: SendPrimitive,
{
    // First touch one period from now, like a plain interval timer.
    let mut ticks = interval_at(Instant::now() + period, period);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        match expires_at {
            Some(deadline) => {
                tokio::select! {
                    biased;
                    () = sleep_until(deadline) => break,
                    _ = ticks.tick() => {}
                }
            }
            None => {
                ticks.tick().await;
            }
        }
        touch(transport.as_ref(), &name);
    }

    tracing::debug!(lease = %name, "Scoped keep-alive expired");
}

/// Fire-and-forget round-trip into the worker.
fn touch<S>(transport: &S, lease: &str)
where
    S: SendPrimitive + ?Sized,
{
    let lease = lease.to_string();
    tracing::trace!(lease = %lease, "Keep-alive touch");
    transport.send(
        Request::keepalive(),
        Box::new(move |result| match result.and_then(Response::into_result) {
            Ok(_) => tracing::trace!(lease = %lease, "Keep-alive acknowledged"),
            Err(err) => tracing::debug!(lease = %lease, error = %err, "Keep-alive touch failed"),
        }),
    );
}
