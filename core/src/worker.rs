//! Worker-context lifecycle: owns the keep-alive scheduler.
//!
//! `init` starts the ambient lease; `shutdown` (or dropping the context) stops
//! every lease. Nothing starts at load time.

use std::sync::Arc;

use tether_config::KeepAliveConfig;

use crate::keepalive::KeepAlive;
use crate::transport::SendPrimitive;

pub struct WorkerContext<S> {
    keepalive: KeepAlive<S>,
}

impl<S: SendPrimitive> WorkerContext<S> {
    /// Initialize the worker context and start the ambient lease.
    ///
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn init(transport: Arc<S>, config: KeepAliveConfig) -> Self {
        let keepalive = KeepAlive::new(transport, config);
        keepalive.start_ambient();
        tracing::info!(
            eviction_window_ms = keepalive.config().eviction_window_ms,
            "Worker context initialized"
        );
        Self { keepalive }
    }

    /// Re-arm the ambient lease. Safe to call from any init path.
    pub fn ensure_started(&self) -> bool {
        self.keepalive.start_ambient()
    }

    #[must_use]
    pub fn keepalive(&self) -> &KeepAlive<S> {
        &self.keepalive
    }

    pub fn shutdown(self) {
        self.keepalive.shutdown();
        tracing::info!("Worker context shut down");
    }
}
