use std::time::Duration;

use anyhow::Result;
use serde_json::{Value, json};
use tokio::time::{MissedTickBehavior, interval, sleep};

use tether_core::{CancellationToken, Dispatcher, SendPrimitive};
use tether_types::Request;

#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct SoakTally {
    pub(crate) sent: u64,
    pub(crate) succeeded: u64,
    pub(crate) failed: u64,
    pub(crate) interrupted: bool,
}

impl SoakTally {
    pub(crate) fn to_json(&self) -> Value {
        json!({
            "sent": self.sent,
            "succeeded": self.succeeded,
            "failed": self.failed,
            "interrupted": self.interrupted,
        })
    }
}

/// Ping through `dispatcher` every `period` until `duration` elapses or `stop`
/// is cancelled. A request in flight when `stop` fires is abandoned.
pub(crate) async fn soak<S: SendPrimitive>(
    dispatcher: &Dispatcher<S>,
    duration: Duration,
    period: Duration,
    stop: &CancellationToken,
) -> Result<SoakTally> {
    let deadline = sleep(duration);
    tokio::pin!(deadline);
    let mut ticks = interval(period);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut tally = SoakTally::default();

    loop {
        tokio::select! {
            biased;
            () = stop.cancelled() => {
                tally.interrupted = true;
                break;
            }
            () = &mut deadline => break,
            _ = ticks.tick() => {
                tally.sent += 1;
                let request = Request::parse("ping", json!({ "seq": tally.sent }))?;
                let result = tokio::select! {
                    biased;
                    () = stop.cancelled() => {
                        tracing::info!(seq = tally.sent, "Soak interrupted mid-request");
                        tally.interrupted = true;
                        break;
                    }
                    result = dispatcher.request(request) => result,
                };
                match result {
                    Ok(_) => tally.succeeded += 1,
                    Err(err) => {
                        tally.failed += 1;
                        tracing::warn!(seq = tally.sent, error = %err, "Soak request failed");
                    }
                }
            }
        }
    }

    Ok(tally)
}
