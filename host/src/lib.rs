//! In-process model of the host platform.
//!
//! A [`WorkerHost`] runs a worker task that answers requests with a
//! [`Handler`]. Like a real extension service worker, it is evicted after a
//! window with no inbound messages: queued and in-flight requests lose their
//! completions, and later sends fail with "receiving end does not exist".
//! [`HostPort`] is the UI-side send primitive into that worker.

mod handler;
mod port;
mod worker;

pub use handler::{EchoHandler, Handler};
pub use port::HostPort;
pub use worker::{StopReason, WorkerHost};
