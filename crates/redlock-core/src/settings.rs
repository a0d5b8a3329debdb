// Lock settings
// Timing, retry and drift parameters consumed by the quorum machinery

use std::path::Path;
use std::time::Duration;

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};

use crate::error::{LockError, Result};

/// Environment variable prefix, e.g. `REDLOCK_RETRY_COUNT=5`
pub const ENV_PREFIX: &str = "REDLOCK";

/// Longest ttl accepted by acquire and extend
pub const MAX_TTL: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Settings shared by every lock operation of one [`crate::Redlock`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockSettings {
    /// Fraction of the ttl treated as clock drift (default: 0.01)
    pub drift_factor: f64,

    /// Constant added to the drift allowance, in milliseconds (default: 2)
    pub clock_skew_ms: u64,

    /// Retries after the first attempt (default: 10, so 11 attempts in total)
    pub retry_count: u32,

    /// Base delay between attempts in milliseconds (default: 200)
    pub retry_delay_ms: u64,

    /// Maximum random addition to the delay in milliseconds (default: 100)
    pub retry_jitter_ms: u64,

    /// Remaining validity below which auto-extension fires (default: 500ms)
    pub automatic_extension_threshold_ms: u64,

    /// Timeout of every single store call in milliseconds (default: 50)
    /// Must stay below `retry_delay_ms`.
    pub store_timeout_ms: u64,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            drift_factor: 0.01,
            clock_skew_ms: 2,
            retry_count: 10,
            retry_delay_ms: 200,
            retry_jitter_ms: 100,
            automatic_extension_threshold_ms: 500,
            store_timeout_ms: 50,
        }
    }
}

impl LockSettings {
    /// Load settings from an optional file layered under `REDLOCK_*` variables
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(true));
        }
        let config = builder
            .add_source(Environment::with_prefix(ENV_PREFIX).try_parsing(true))
            .build()
            .map_err(config_error)?;

        let settings: LockSettings = config.try_deserialize().map_err(config_error)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Read settings from a section of an application-wide configuration
    ///
    /// A missing section yields the defaults.
    pub fn from_config(config: &Config, section: &str) -> Result<Self> {
        let settings = match config.get::<LockSettings>(section) {
            Ok(settings) => settings,
            Err(ConfigError::NotFound(_)) => LockSettings::default(),
            Err(e) => return Err(config_error(e)),
        };
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.drift_factor.is_finite() || !(0.0..1.0).contains(&self.drift_factor) {
            return Err(LockError::configuration(format!(
                "drift_factor must be within [0, 1), got {}",
                self.drift_factor
            )));
        }
        if self.store_timeout_ms == 0 {
            return Err(LockError::configuration(
                "store_timeout_ms must be greater than zero",
            ));
        }
        if self.automatic_extension_threshold_ms == 0 {
            return Err(LockError::configuration(
                "automatic_extension_threshold_ms must be greater than zero",
            ));
        }
        if self.retry_count > 0 && self.store_timeout_ms >= self.retry_delay_ms {
            return Err(LockError::configuration(format!(
                "store_timeout_ms ({}) must be shorter than retry_delay_ms ({})",
                self.store_timeout_ms, self.retry_delay_ms
            )));
        }
        Ok(())
    }

    /// Total attempts allowed for acquire and extend
    pub fn max_attempts(&self) -> u32 {
        self.retry_count.saturating_add(1)
    }

    /// Drift allowance for a ttl: `ttl * drift_factor + clock_skew`
    pub fn drift_allowance(&self, ttl: Duration) -> Duration {
        let drift_ms = (ttl.as_millis() as f64 * self.drift_factor).round() as u64;
        Duration::from_millis(drift_ms.saturating_add(self.clock_skew_ms))
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn retry_jitter(&self) -> Duration {
        Duration::from_millis(self.retry_jitter_ms)
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    pub fn automatic_extension_threshold(&self) -> Duration {
        Duration::from_millis(self.automatic_extension_threshold_ms)
    }
}

/// Per-call overrides of the retry policy
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AcquireOptions {
    pub retry_count: Option<u32>,
    pub retry_delay_ms: Option<u64>,
    pub retry_jitter_ms: Option<u64>,
}

impl AcquireOptions {
    /// Single attempt, no retries
    pub fn no_retry() -> Self {
        Self {
            retry_count: Some(0),
            ..Default::default()
        }
    }

    /// Apply these overrides on top of the base settings
    pub fn apply(&self, base: &LockSettings) -> LockSettings {
        LockSettings {
            retry_count: self.retry_count.unwrap_or(base.retry_count),
            retry_delay_ms: self.retry_delay_ms.unwrap_or(base.retry_delay_ms),
            retry_jitter_ms: self.retry_jitter_ms.unwrap_or(base.retry_jitter_ms),
            ..base.clone()
        }
    }
}

fn config_error(e: ConfigError) -> LockError {
    LockError::configuration(e.to_string())
}
