//! Configuration for tether.
//!
//! Loaded from `~/.tether/config.toml`. Every field is optional; a missing file
//! yields the defaults. `TETHER_TIMEOUT_MS` and `TETHER_RETRIES` override the
//! dispatch defaults after the file is read.
//!
//! ```toml
//! [dispatch]
//! timeout_ms = 30000
//! retries = 0
//! backoff_base_ms = 1000
//!
//! [keepalive]
//! eviction_window_ms = 30000
//! ambient_period_ms = 20000
//! scoped_period_ms = 5000
//! ```

use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const TIMEOUT_ENV: &str = "TETHER_TIMEOUT_MS";
pub const RETRIES_ENV: &str = "TETHER_RETRIES";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config at {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config at {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("{var} must be a non-negative integer, got {value:?}")]
    InvalidEnv { var: &'static str, value: String },
    #[error("{0} must be greater than zero")]
    ZeroPeriod(&'static str),
    #[error(
        "ambient_period_ms ({period_ms}) must be at most two-thirds of eviction_window_ms ({window_ms})"
    )]
    AmbientTooSlow { period_ms: u64, window_ms: u64 },
    #[error("scoped_period_ms ({scoped_ms}) must be shorter than ambient_period_ms ({ambient_ms})")]
    ScopedTooSlow { scoped_ms: u64, ambient_ms: u64 },
    #[error("backoff_max_ms ({max_ms}) must not be below backoff_base_ms ({base_ms})")]
    BackoffRange { base_ms: u64, max_ms: u64 },
    #[error("jitter must be in [0, 1), got {0}")]
    JitterRange(f64),
}

/// Top-level configuration file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TetherConfig {
    pub dispatch: DispatchConfig,
    pub keepalive: KeepAliveConfig,
}

/// Defaults for dispatcher calls and the retry backoff curve.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Per-attempt deadline. Zero disables the deadline.
    pub timeout_ms: u64,
    /// Retries after the first attempt.
    pub retries: u32,
    /// Delay before the first retry; doubles for each later retry.
    pub backoff_base_ms: u64,
    /// Upper bound on any single backoff delay.
    pub backoff_max_ms: u64,
    /// Down-jitter factor (0.25 = up to 25% shorter). Zero keeps delays exact.
    pub jitter: f64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            retries: 0,
            backoff_base_ms: 1_000,
            backoff_max_ms: 60_000,
            jitter: 0.0,
        }
    }
}

impl DispatchConfig {
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    #[must_use]
    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    #[must_use]
    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }
}

/// Keep-alive cadence relative to the host's inactivity eviction window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeepAliveConfig {
    /// How long the host lets the worker sit idle before evicting it.
    pub eviction_window_ms: u64,
    /// Period of the process-lifetime lease.
    pub ambient_period_ms: u64,
    /// Period of operation-scoped leases.
    pub scoped_period_ms: u64,
}

impl Default for KeepAliveConfig {
    fn default() -> Self {
        Self {
            eviction_window_ms: 30_000,
            ambient_period_ms: 20_000,
            scoped_period_ms: 5_000,
        }
    }
}

impl KeepAliveConfig {
    #[must_use]
    pub fn eviction_window(&self) -> Duration {
        Duration::from_millis(self.eviction_window_ms)
    }

    #[must_use]
    pub fn ambient_period(&self) -> Duration {
        Duration::from_millis(self.ambient_period_ms)
    }

    #[must_use]
    pub fn scoped_period(&self) -> Duration {
        Duration::from_millis(self.scoped_period_ms)
    }
}

impl TetherConfig {
    /// Load from the default location, apply env overrides, and validate.
    ///
    /// Returns `Ok(None)` when no config file exists.
    pub fn load() -> Result<Option<Self>, ConfigError> {
        let Some(path) = config_path() else {
            return Ok(None);
        };
        if !path.exists() {
            return Ok(None);
        }
        Self::load_from(&path).map(Some)
    }

    /// Load defaults merged with the config file (if any) and env overrides.
    pub fn load_or_default() -> Result<Self, ConfigError> {
        if let Some(config) = Self::load()? {
            return Ok(config);
        }
        let mut config = Self::default();
        config.apply_env_overrides(|var| env::var(var).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Load `path` with overrides from the process environment.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        Self::load_from_with(path, |var| env::var(var).ok())
    }

    /// Load `path` with overrides resolved through `lookup` instead of the
    /// process environment.
    pub fn load_from_with<F>(path: &Path, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::parse(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.apply_env_overrides(lookup)?;
        config.validate()?;
        tracing::debug!(path = %path.display(), "Loaded config");
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    #[must_use]
    pub fn path() -> Option<PathBuf> {
        config_path()
    }

    /// Override dispatch defaults from the environment.
    ///
    /// `lookup` abstracts `std::env::var` so tests do not touch process state.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup(TIMEOUT_ENV) {
            self.dispatch.timeout_ms = raw
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidEnv {
                    var: TIMEOUT_ENV,
                    value: raw.clone(),
                })?;
        }
        if let Some(raw) = lookup(RETRIES_ENV) {
            self.dispatch.retries = raw
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidEnv {
                    var: RETRIES_ENV,
                    value: raw.clone(),
                })?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let dispatch = &self.dispatch;
        if dispatch.backoff_max_ms < dispatch.backoff_base_ms {
            return Err(ConfigError::BackoffRange {
                base_ms: dispatch.backoff_base_ms,
                max_ms: dispatch.backoff_max_ms,
            });
        }
        if !(0.0..1.0).contains(&dispatch.jitter) {
            return Err(ConfigError::JitterRange(dispatch.jitter));
        }

        let keepalive = &self.keepalive;
        for (name, value) in [
            ("eviction_window_ms", keepalive.eviction_window_ms),
            ("ambient_period_ms", keepalive.ambient_period_ms),
            ("scoped_period_ms", keepalive.scoped_period_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::ZeroPeriod(name));
            }
        }
        // period * 3 <= window * 2, without float rounding
        if u128::from(keepalive.ambient_period_ms) * 3 > u128::from(keepalive.eviction_window_ms) * 2
        {
            return Err(ConfigError::AmbientTooSlow {
                period_ms: keepalive.ambient_period_ms,
                window_ms: keepalive.eviction_window_ms,
            });
        }
        if keepalive.scoped_period_ms >= keepalive.ambient_period_ms {
            return Err(ConfigError::ScopedTooSlow {
                scoped_ms: keepalive.scoped_period_ms,
                ambient_ms: keepalive.ambient_period_ms,
            });
        }
        Ok(())
    }
}

fn config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".tether").join("config.toml"))
}
