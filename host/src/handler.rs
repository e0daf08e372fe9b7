use std::future::Future;
use std::time::Duration;

use serde_json::json;

use tether_types::{Request, Response};

/// Worker-side request handler.
pub trait Handler: Send + Sync + 'static {
    fn handle(&self, request: Request) -> impl Future<Output = Response> + Send;
}

/// Echoes the request back after an optional delay.
///
/// Requests of kind `error` are answered with the error marker, carrying the
/// payload's `message` field when present.
#[derive(Debug, Clone, Default)]
pub struct EchoHandler {
    delay: Duration,
}

impl EchoHandler {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_delay(delay: Duration) -> Self {
        Self { delay }
    }
}

impl Handler for EchoHandler {
    async fn handle(&self, request: Request) -> Response {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if request.kind().as_str() == "error" {
            let message = request
                .payload()
                .get("message")
                .and_then(|value| value.as_str())
                .unwrap_or("handler error");
            return Response::error(message);
        }
        Response::success(json!({
            "type": request.kind().as_str(),
            "echo": request.payload(),
        }))
    }
}
