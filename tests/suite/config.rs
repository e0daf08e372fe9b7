//! Config file values flowing into the dispatcher and keep-alive scheduler.

use std::fs;
use std::time::Duration;

use serde_json::json;
use tempfile::tempdir;
use tokio::time::Instant;

use tether_config::{ConfigError, TIMEOUT_ENV, TetherConfig};
use tether_core::{Dispatcher, WorkerContext};
use tether_host::{EchoHandler, WorkerHost};
use tether_types::Request;

use crate::common::FakeTransport;

fn write_config(content: &str) -> (tempfile::TempDir, TetherConfig) {
    let dir = tempdir().unwrap();
    let path = dir.path().join("config.toml");
    fs::write(&path, content).unwrap();
    let config = TetherConfig::load_from_with(&path, |_| None).unwrap();
    (dir, config)
}

#[tokio::test(start_paused = true)]
async fn dispatch_section_sets_default_options_and_backoff() {
    let (_dir, config) = write_config(
        r#"
[dispatch]
timeout_ms = 100
retries = 1
backoff_base_ms = 250
"#,
    );
    let transport = FakeTransport::silent();
    let dispatcher = Dispatcher::from_config(transport.clone(), &config.dispatch);
    let started = Instant::now();

    let err = dispatcher
        .request(Request::parse("ping", json!({})).unwrap())
        .await
        .unwrap_err();

    // 100 + 250 + 100
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(450), "{elapsed:?}");
    assert!(elapsed < Duration::from_millis(500), "{elapsed:?}");
    assert!(err.is_timeout());
    assert_eq!(err.attempts(), Some(2));
    assert_eq!(transport.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn keepalive_section_drives_the_ambient_period() {
    let (_dir, config) = write_config(
        r#"
[keepalive]
eviction_window_ms = 9000
ambient_period_ms = 6000
scoped_period_ms = 1000
"#,
    );
    let host = WorkerHost::spawn(EchoHandler::new(), config.keepalive.eviction_window());
    let context = WorkerContext::init(host.port(), config.keepalive.clone());

    tokio::time::sleep(Duration::from_millis(30_500)).await;
    assert!(host.is_alive());
    assert_eq!(host.touches(), 5);

    context.shutdown();
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert!(!host.is_alive());
}

#[test]
fn ambient_period_too_close_to_the_window_is_rejected() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("config.toml");
    fs::write(
        &path,
        "[keepalive]\neviction_window_ms = 30000\nambient_period_ms = 25000\n",
    )
    .unwrap();

    let err = TetherConfig::load_from_with(&path, |_| None).unwrap_err();
    assert!(matches!(
        err,
        ConfigError::AmbientTooSlow {
            period_ms: 25_000,
            window_ms: 30_000
        }
    ));
}

#[test]
fn timeout_lookup_overrides_the_file() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("config.toml");
    fs::write(&path, "[dispatch]\ntimeout_ms = 100\n").unwrap();

    let config = TetherConfig::load_from_with(&path, |var| {
        (var == TIMEOUT_ENV).then(|| "2500".to_string())
    })
    .unwrap();
    assert_eq!(config.dispatch.timeout(), Duration::from_millis(2_500));
}
