//! Retry policy with exponential backoff.
//!
//! # Rules
//!
//! - Cancellation is terminal, whatever budget is left.
//! - Timeouts and transport failures retry while the budget is positive.
//! - Delay before retry `k` (1-based) is `initial_delay * 2^(k-1)`, capped at
//!   `max_delay`: 1s, 2s, 4s, ... with the defaults.
//! - Optional down-jitter multiplies the delay by a factor in
//!   `[1 - jitter_factor, 1.0]`. Off by default so delays are exact.

use std::time::Duration;

use tether_config::DispatchConfig;

use crate::race::AttemptError;

/// Shape of the backoff curve. The retry budget itself is per call.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Backoff delay before the first retry.
    pub initial_delay: Duration,
    /// Maximum backoff delay.
    pub max_delay: Duration,
    /// Jitter factor for down-jitter (0.25 = up to 25% reduction).
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            jitter_factor: 0.0,
        }
    }
}

impl From<&DispatchConfig> for RetryPolicy {
    fn from(config: &DispatchConfig) -> Self {
        Self {
            initial_delay: config.backoff_base(),
            max_delay: config.backoff_max(),
            jitter_factor: config.jitter,
        }
    }
}

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { delay: Duration },
    Stop,
}

/// Remaining budget for one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryState {
    remaining: u32,
    retries_made: u32,
}

impl RetryState {
    #[must_use]
    pub fn new(budget: u32) -> Self {
        Self {
            remaining: budget,
            retries_made: 0,
        }
    }

    #[must_use]
    pub fn remaining(&self) -> u32 {
        self.remaining
    }

    #[must_use]
    pub fn retries_made(&self) -> u32 {
        self.retries_made
    }
}

impl RetryPolicy {
    /// Delay before the retry that follows `backoff_step` earlier retries.
    ///
    /// - `backoff_step`: 0 before first retry, 1 before second, etc.
    #[must_use]
    pub fn delay_for(&self, backoff_step: u32) -> Duration {
        // Exponential backoff: initial_delay * 2^backoff_step
        let base = self.initial_delay.as_secs_f64() * 2.0_f64.powi(backoff_step as i32);
        let capped = base.min(self.max_delay.as_secs_f64());

        if self.jitter_factor <= 0.0 {
            return Duration::try_from_secs_f64(capped).unwrap_or(self.max_delay);
        }

        // Down-jitter: multiply by random factor in [1 - jitter_factor, 1.0]
        let jitter = 1.0 - rand::random::<f64>() * self.jitter_factor;
        Duration::try_from_secs_f64(capped * jitter).unwrap_or(self.max_delay)
    }

    /// Decide whether the call retries after `error`, updating `state`.
    pub fn decide(&self, state: &mut RetryState, error: &AttemptError) -> RetryDecision {
        if matches!(error, AttemptError::Cancelled) || state.remaining == 0 {
            return RetryDecision::Stop;
        }
        let delay = self.delay_for(state.retries_made);
        state.remaining -= 1;
        state.retries_made += 1;
        RetryDecision::Retry { delay }
    }
}
