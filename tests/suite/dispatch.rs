//! Dispatcher behavior end to end: deadlines, retries and what gets logged.

use std::time::Duration;

use serde_json::json;
use tokio::time::Instant;
use tracing::Level;

use tether_core::{Dispatcher, SendOptions};
use tether_types::{ErrorKind, Request};

use crate::common::{FakeTransport, LogCapture};

fn request(kind: &str) -> Request {
    Request::parse(kind, json!({})).unwrap()
}

#[tokio::test(start_paused = true)]
async fn silent_receiver_times_out_after_every_retry() {
    let (logs, _guard) = LogCapture::install();
    let transport = FakeTransport::silent();
    let dispatcher = Dispatcher::new(transport.clone());
    let started = Instant::now();

    let err = dispatcher
        .send(
            request("ping"),
            SendOptions::default()
                .with_timeout(Duration::from_millis(100))
                .with_retries(2),
        )
        .await
        .unwrap_err();

    // 100 + 1000 + 100 + 2000 + 100
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(3300), "{elapsed:?}");
    assert!(elapsed < Duration::from_millis(3350), "{elapsed:?}");

    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert_eq!(err.attempts(), Some(3));
    assert_eq!(transport.calls(), 3);
    assert_eq!(logs.count(Level::WARN), 2);
    assert_eq!(logs.count(Level::ERROR), 1);
    assert!(!dispatcher.is_loading());
}

#[tokio::test(start_paused = true)]
async fn prompt_reply_returns_payload_without_retry_noise() {
    let (logs, _guard) = LogCapture::install();
    let transport = FakeTransport::replying_after(Duration::from_millis(10), json!({"items": [1, 2]}));
    let dispatcher = Dispatcher::new(transport.clone());

    let payload = dispatcher
        .send(
            request("fetch"),
            SendOptions::default().with_timeout(Duration::from_millis(5000)),
        )
        .await
        .unwrap();

    assert_eq!(payload, json!({"items": [1, 2]}));
    assert_eq!(transport.calls(), 1);
    assert_eq!(logs.count(Level::WARN), 0);
    assert_eq!(logs.count(Level::ERROR), 0);
}

#[tokio::test(start_paused = true)]
async fn zero_timeout_waits_for_a_slow_reply() {
    let transport = FakeTransport::replying_after(Duration::from_secs(120), json!("late"));
    let dispatcher = Dispatcher::new(transport.clone());

    let payload = dispatcher
        .send(
            request("export"),
            SendOptions::default().with_timeout(Duration::ZERO).with_retries(3),
        )
        .await
        .unwrap();

    assert_eq!(payload, json!("late"));
    assert_eq!(transport.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn cancel_mid_attempt_stops_retrying() {
    let transport = FakeTransport::silent();
    let dispatcher = Dispatcher::new(transport.clone());

    let canceller = dispatcher.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(canceller.cancel());
    });

    let err = dispatcher
        .send(
            request("ping"),
            SendOptions::default()
                .with_timeout(Duration::from_millis(100))
                .with_retries(5),
        )
        .await
        .unwrap_err();

    assert!(err.is_cancelled());
    assert_eq!(err.attempts(), None);
    assert_eq!(transport.calls(), 1);

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(transport.calls(), 1);
}
