//! Tether CLI - drives the dispatcher against an in-process worker.
//!
//! ```text
//! main() -> WorkerHost::spawn(EchoHandler) -> WorkerContext::init (ambient keep-alive)
//!                 |
//!                 v
//!        Dispatcher::from_config -> send | soak -> JSON on stdout
//! ```
//!
//! `send` issues a single request inside a scoped keep-alive and prints the
//! payload. `soak` pings the worker on an interval for a fixed time and prints
//! a summary. Ctrl-C cancels the in-flight request in either mode. Any failure
//! exits non-zero.

mod args;
mod soak;

use anyhow::{Context, Result, bail};
use serde_json::json;
use std::{
    env,
    fs::{self, OpenOptions},
    io,
    path::PathBuf,
    process::ExitCode,
    sync::Mutex,
};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use tether_config::TetherConfig;
use tether_core::{CancellationToken, Dispatcher, WorkerContext};
use tether_host::{EchoHandler, WorkerHost};
use tether_types::Request;

use args::{Command, SendArgs, SoakArgs, USAGE};
use soak::soak;

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    let (log_file, init_warnings) = open_log_file();

    if let Some((log_path, file)) = log_file {
        tracing_subscriber::registry()
            .with(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
            .with(env_filter)
            .init();

        tracing::info!(path = %log_path.display(), "Logging initialized");
        for warning in init_warnings {
            tracing::warn!("{warning}");
        }
        return;
    }

    // stdout carries the JSON result, so logs fall back to stderr.
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(env_filter)
        .init();
    for warning in init_warnings {
        tracing::warn!("{warning}");
    }
}

fn open_log_file() -> (Option<(PathBuf, fs::File)>, Vec<String>) {
    let mut warnings = Vec::new();

    for candidate in log_file_candidates() {
        if let Some(parent) = candidate.parent()
            && let Err(e) = fs::create_dir_all(parent)
        {
            warnings.push(format!(
                "Failed to create log dir {}: {e}",
                parent.display()
            ));
            continue;
        }

        match OpenOptions::new()
            .create(true)
            .append(true)
            .open(&candidate)
        {
            Ok(file) => return (Some((candidate, file)), warnings),
            Err(e) => warnings.push(format!(
                "Failed to open log file {}: {e}",
                candidate.display()
            )),
        }
    }

    (None, warnings)
}

fn log_file_candidates() -> Vec<PathBuf> {
    let mut candidates = Vec::new();

    // Primary: ~/.tether/logs/tether.log
    if let Some(config_path) = TetherConfig::path()
        && let Some(config_dir) = config_path.parent()
    {
        candidates.push(config_dir.join("logs").join("tether.log"));
    }

    candidates.push(PathBuf::from(".tether").join("logs").join("tether.log"));

    candidates
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(error = %format!("{err:#}"), "Command failed");
            eprintln!("Error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<()> {
    let command = args::parse(env::args().skip(1))?;
    if command == Command::Help {
        println!("{USAGE}");
        return Ok(());
    }

    let config = TetherConfig::load_or_default().context("Failed to load config")?;
    match command {
        Command::Help => Ok(()),
        Command::Send(send) => run_send(&config, send).await,
        Command::Soak(soak) => run_soak(&config, soak).await,
    }
}

async fn run_send(config: &TetherConfig, args: SendArgs) -> Result<()> {
    let request = Request::parse(&args.kind, args.payload.clone())?;
    let host = WorkerHost::spawn(
        EchoHandler::with_delay(args.handler_delay),
        config.keepalive.eviction_window(),
    );
    let context = WorkerContext::init(host.port(), config.keepalive.clone());
    let dispatcher = Dispatcher::from_config(host.port(), &config.dispatch);
    let options = args.options(dispatcher.defaults());

    let interrupt = dispatcher.clone();
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupted; cancelling request");
            interrupt.cancel();
        }
    });

    let result = context
        .keepalive()
        .hold(dispatcher.send(request, options))
        .await;

    ctrl_c.abort();
    context.shutdown();
    host.shutdown();

    let payload = result?;
    println!("{}", serde_json::to_string_pretty(&payload)?);
    Ok(())
}

async fn run_soak(config: &TetherConfig, args: SoakArgs) -> Result<()> {
    let host = WorkerHost::spawn(
        EchoHandler::with_delay(args.handler_delay),
        config.keepalive.eviction_window(),
    );
    let context = WorkerContext::init(host.port(), config.keepalive.clone());
    let dispatcher = Dispatcher::from_config(host.port(), &config.dispatch);

    let stop = CancellationToken::new();
    let ctrl_c = {
        let stop = stop.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Interrupted; stopping soak");
                stop.cancel();
            }
        })
    };

    let tally = soak(&dispatcher, args.duration, args.interval, &stop).await;
    ctrl_c.abort();

    let alive = host.is_alive();
    let touches = host.touches();
    context.shutdown();
    host.shutdown();

    let tally = tally?;
    let mut summary = tally.to_json();
    summary["touches"] = json!(touches);
    summary["worker_alive"] = json!(alive);
    println!("{}", serde_json::to_string_pretty(&summary)?);

    if tally.failed > 0 {
        bail!("{} of {} requests failed", tally.failed, tally.sent);
    }
    if !alive {
        bail!("worker was evicted during the soak");
    }
    Ok(())
}
