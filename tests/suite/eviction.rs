//! Worker eviction against the keep-alive scheduler.

use std::time::Duration;

use serde_json::json;
use tokio::time::Instant;

use tether_config::KeepAliveConfig;
use tether_core::{Dispatcher, KeepAlive, SendOptions, WorkerContext};
use tether_host::{EchoHandler, StopReason, WorkerHost};
use tether_types::{DispatchError, Request, TransportError};

use crate::common::LogCapture;

const WINDOW: Duration = Duration::from_secs(30);

fn ping() -> Request {
    Request::parse("ping", json!({})).unwrap()
}

#[tokio::test(start_paused = true)]
async fn ambient_keepalive_outlives_the_eviction_window() {
    let host = WorkerHost::spawn(EchoHandler::new(), WINDOW);
    let _context = WorkerContext::init(host.port(), KeepAliveConfig::default());

    tokio::time::sleep(Duration::from_secs(95)).await;
    assert!(host.is_alive());
    assert_eq!(host.touches(), 4);
    assert_eq!(host.handled(), 0);

    let payload = Dispatcher::new(host.port())
        .send(ping(), SendOptions::default())
        .await
        .unwrap();
    assert_eq!(payload, json!({"type": "ping", "echo": {}}));
}

#[tokio::test(start_paused = true)]
async fn idle_worker_is_evicted_and_sends_fail() {
    let host = WorkerHost::spawn(EchoHandler::new(), WINDOW);
    assert_eq!(host.stopped().await, StopReason::Evicted);

    let err = Dispatcher::new(host.port())
        .send(ping(), SendOptions::default().with_retries(2))
        .await
        .unwrap_err();

    assert!(err.is_transport_failure());
    let DispatchError::RetriesExhausted { attempts, last } = err else {
        panic!("expected retries to be exhausted");
    };
    assert_eq!(attempts, 3);
    assert!(matches!(
        *last,
        DispatchError::TransportFailure {
            source: TransportError::Unreachable(_),
            ..
        }
    ));
}

#[tokio::test(start_paused = true)]
async fn scoped_lease_covers_a_request_longer_than_the_window() {
    let host = WorkerHost::spawn(EchoHandler::with_delay(Duration::from_secs(45)), WINDOW);
    let keepalive = KeepAlive::new(host.port(), KeepAliveConfig::default());
    let dispatcher = Dispatcher::new(host.port());

    let payload = keepalive
        .hold(dispatcher.send(ping(), SendOptions::default().with_timeout(Duration::from_secs(60))))
        .await
        .unwrap();

    assert_eq!(payload["type"], "ping");
    assert!(host.is_alive());
    assert!(host.touches() >= 8);
    assert_eq!(keepalive.active_scoped(), 0);
}

#[tokio::test(start_paused = true)]
async fn unleased_long_request_loses_its_completion_on_eviction() {
    let host = WorkerHost::spawn(EchoHandler::with_delay(Duration::from_secs(45)), WINDOW);
    let dispatcher = Dispatcher::new(host.port());
    let started = Instant::now();

    let err = dispatcher
        .send(ping(), SendOptions::default().with_timeout(Duration::from_secs(60)))
        .await
        .unwrap_err();

    assert!(started.elapsed() < Duration::from_secs(31));
    assert!(matches!(
        err,
        DispatchError::TransportFailure {
            source: TransportError::CompletionDropped,
            ..
        }
    ));
    assert_eq!(host.stop_reason(), Some(StopReason::Evicted));
}

#[tokio::test(start_paused = true)]
async fn bounded_lease_expires_and_lets_the_worker_go() {
    let host = WorkerHost::spawn(EchoHandler::new(), WINDOW);
    let keepalive = KeepAlive::new(host.port(), KeepAliveConfig::default());
    let started = Instant::now();
    let lease = keepalive.lease_for(Duration::from_secs(50));

    tokio::time::sleep(Duration::from_millis(50_500)).await;
    assert!(host.is_alive());
    assert!(!lease.is_active());

    // Last touch at 45s; no touch at the 50s expiry itself.
    assert_eq!(host.stopped().await, StopReason::Evicted);
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(75), "{elapsed:?}");
    assert!(elapsed < Duration::from_secs(76), "{elapsed:?}");
}

#[tokio::test(start_paused = true)]
async fn stopped_leases_are_logged_by_name() {
    let (logs, _guard) = LogCapture::install();
    let host = WorkerHost::spawn(EchoHandler::new(), WINDOW);
    let keepalive = KeepAlive::new(host.port(), KeepAliveConfig::default());

    assert!(keepalive.start_ambient());
    let lease = keepalive.lease_for(Duration::from_secs(60));
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(keepalive.stop_ambient());
    keepalive.shutdown();

    let stopped: Vec<String> = logs
        .events()
        .into_iter()
        .filter(|event| event.message == "Stopping keep-alive lease")
        .filter_map(|event| event.lease)
        .collect();
    assert_eq!(stopped, vec!["ambient".to_string(), lease.name().to_string()]);
}
