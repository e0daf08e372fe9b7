use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde_json::Value;

use tether_core::SendOptions;

pub(crate) const USAGE: &str = "\
Usage:
  tether send <kind> [json-payload] [--timeout MS] [--retries N] [--handler-delay MS]
  tether soak <seconds> [--interval MS] [--handler-delay MS]

Config is read from ~/.tether/config.toml. TETHER_TIMEOUT_MS and TETHER_RETRIES
override the dispatch defaults; RUST_LOG sets the log filter.";

const DEFAULT_SOAK_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, PartialEq)]
pub(crate) enum Command {
    Help,
    Send(SendArgs),
    Soak(SoakArgs),
}

#[derive(Debug, PartialEq)]
pub(crate) struct SendArgs {
    pub(crate) kind: String,
    pub(crate) payload: Value,
    pub(crate) timeout: Option<Duration>,
    pub(crate) retries: Option<u32>,
    pub(crate) handler_delay: Duration,
}

impl SendArgs {
    /// Flags win over the configured defaults.
    pub(crate) fn options(&self, defaults: SendOptions) -> SendOptions {
        let mut options = defaults;
        if let Some(timeout) = self.timeout {
            options = options.with_timeout(timeout);
        }
        if let Some(retries) = self.retries {
            options = options.with_retries(retries);
        }
        options
    }
}

#[derive(Debug, PartialEq)]
pub(crate) struct SoakArgs {
    pub(crate) duration: Duration,
    pub(crate) interval: Duration,
    pub(crate) handler_delay: Duration,
}

pub(crate) fn parse<I>(args: I) -> Result<Command>
where
    I: IntoIterator<Item = String>,
{
    let mut args = args.into_iter();
    let Some(command) = args.next() else {
        return Ok(Command::Help);
    };
    match command.as_str() {
        "help" | "-h" | "--help" => Ok(Command::Help),
        "send" => parse_send(args).map(Command::Send),
        "soak" => parse_soak(args).map(Command::Soak),
        other => bail!("unknown command '{other}'\n\n{USAGE}"),
    }
}

fn parse_send(mut args: impl Iterator<Item = String>) -> Result<SendArgs> {
    let mut positional = Vec::new();
    let mut timeout = None;
    let mut retries = None;
    let mut handler_delay = Duration::ZERO;

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--timeout" => timeout = Some(millis(&mut args, "--timeout")?),
            "--retries" => retries = Some(flag_value(&mut args, "--retries")?),
            "--handler-delay" => handler_delay = millis(&mut args, "--handler-delay")?,
            flag if flag.starts_with("--") => bail!("unknown flag '{flag}'\n\n{USAGE}"),
            _ => positional.push(arg),
        }
    }

    let mut positional = positional.into_iter();
    let kind = positional
        .next()
        .with_context(|| format!("send needs a message kind\n\n{USAGE}"))?;
    let payload = match positional.next() {
        Some(raw) => serde_json::from_str(&raw)
            .with_context(|| format!("payload is not valid JSON: {raw}"))?,
        None => Value::Null,
    };
    if let Some(extra) = positional.next() {
        bail!("unexpected argument '{extra}'");
    }

    Ok(SendArgs {
        kind,
        payload,
        timeout,
        retries,
        handler_delay,
    })
}

fn parse_soak(mut args: impl Iterator<Item = String>) -> Result<SoakArgs> {
    let mut seconds = None;
    let mut interval = DEFAULT_SOAK_INTERVAL;
    let mut handler_delay = Duration::ZERO;

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--interval" => interval = millis(&mut args, "--interval")?,
            "--handler-delay" => handler_delay = millis(&mut args, "--handler-delay")?,
            flag if flag.starts_with("--") => bail!("unknown flag '{flag}'\n\n{USAGE}"),
            raw if seconds.is_none() => {
                seconds = Some(
                    raw.parse::<u64>()
                        .with_context(|| format!("invalid soak duration: {raw}"))?,
                );
            }
            extra => bail!("unexpected argument '{extra}'"),
        }
    }

    let seconds = seconds.with_context(|| format!("soak needs a duration in seconds\n\n{USAGE}"))?;
    if interval.is_zero() {
        bail!("--interval must be greater than zero");
    }

    Ok(SoakArgs {
        duration: Duration::from_secs(seconds),
        interval,
        handler_delay,
    })
}

fn millis(args: &mut impl Iterator<Item = String>, flag: &str) -> Result<Duration> {
    flag_value(args, flag).map(Duration::from_millis)
}

fn flag_value<T>(args: &mut impl Iterator<Item = String>, flag: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw = args
        .next()
        .with_context(|| format!("{flag} needs a value"))?;
    raw.parse()
        .with_context(|| format!("invalid value for {flag}: {raw}"))
}
