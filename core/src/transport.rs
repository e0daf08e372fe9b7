//! The host's send primitive, modelled as a narrow trait.
//!
//! The platform delivers a message to the opposite context and calls the
//! completion once. It has no timeout and no cancel; both are layered on top
//! by [`crate::race`]. A completion that is dropped without being called means
//! the receiving context is gone.

use tether_types::{Request, Response, TransportError};

/// Single-shot completion callback. `FnOnce` makes double delivery impossible.
pub type Completion = Box<dyn FnOnce(Result<Response, TransportError>) + Send + 'static>;

pub trait SendPrimitive: Send + Sync + 'static {
    /// Deliver `request` and eventually call `completion`, at most once.
    ///
    /// Must not block. The completion may be invoked synchronously, from
    /// another task, or never.
    fn send(&self, request: Request, completion: Completion);
}

impl<F> SendPrimitive for F
where
    F: Fn(Request, Completion) + Send + Sync + 'static,
{
    fn send(&self, request: Request, completion: Completion) {
        self(request, completion);
    }
}
