//! Configuration structures
//!
//! Every duration is written in files and environment variables as integer
//! milliseconds (`*_ms` keys). Missing keys fall back to the defaults in
//! [`crate::constants`].

use std::collections::BTreeSet;
use std::time::Duration;

use genguard_common::{duration_millis, ConfigError, ConfigResult};
use serde::{Deserialize, Serialize};

use crate::constants::{
    DEFAULT_BACKOFF_MULTIPLIER, DEFAULT_BASE_DELAY_MS, DEFAULT_BREAKER_WINDOW_MS,
    DEFAULT_COOLDOWN_MS, DEFAULT_DB_PATH, DEFAULT_FAILURE_RETENTION_MS,
    DEFAULT_FAILURE_THRESHOLD, DEFAULT_HALF_OPEN_MAX_CALLS, DEFAULT_LEASE_TIMEOUT_MS,
    DEFAULT_LOG_LEVEL, DEFAULT_MAX_ATTEMPTS, DEFAULT_MAX_DELAY_MS, DEFAULT_POOL_SIZE,
    DEFAULT_RETENTION_MS, DEFAULT_SUCCESS_THRESHOLD, DEFAULT_TIMEOUT_MS,
};
use crate::errors::ErrorKind;
use crate::impl_domain_status_conversions;

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardConfig {
    pub idempotency: IdempotencyConfig,
    pub breaker: BreakerConfig,
    pub retry: RetryPolicy,
    pub storage: StorageConfig,
    pub logging: LoggingConfig,
    /// Budget applied when a call does not pass its own
    #[serde(rename = "default_timeout_ms", with = "duration_millis")]
    pub default_timeout: Duration,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            idempotency: IdempotencyConfig::default(),
            breaker: BreakerConfig::default(),
            retry: RetryPolicy::default(),
            storage: StorageConfig::default(),
            logging: LoggingConfig::default(),
            default_timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
        }
    }
}

impl GuardConfig {
    /// Check cross-field constraints
    pub fn validate(&self) -> ConfigResult<()> {
        self.idempotency.validate()?;
        self.breaker.validate()?;
        self.retry.validate()?;
        self.storage.validate()?;

        if self.default_timeout.is_zero() {
            return Err(ConfigError::invalid("default_timeout_ms", "must be greater than 0"));
        }

        Ok(())
    }
}

/// What a caller does when its key is already in flight elsewhere
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum InFlightPolicy {
    /// Return a conflict immediately
    #[default]
    FailFast,
    /// Poll the store until the record resolves, the lease expires, or
    /// `max_wait` runs out
    Wait {
        #[serde(rename = "max_wait_ms", with = "duration_millis")]
        max_wait: Duration,
        #[serde(rename = "poll_interval_ms", with = "duration_millis")]
        poll_interval: Duration,
    },
}

/// Idempotency store lifetimes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdempotencyConfig {
    /// How long a completed outcome is replayed
    #[serde(rename = "retention_ms", with = "duration_millis")]
    pub retention: Duration,
    /// How long a failed outcome is replayed
    #[serde(rename = "failure_retention_ms", with = "duration_millis")]
    pub failure_retention: Duration,
    /// How long an in-flight owner keeps the key before others may reclaim it
    #[serde(rename = "lease_timeout_ms", with = "duration_millis")]
    pub lease_timeout: Duration,
    pub in_flight: InFlightPolicy,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            retention: Duration::from_millis(DEFAULT_RETENTION_MS),
            failure_retention: Duration::from_millis(DEFAULT_FAILURE_RETENTION_MS),
            lease_timeout: Duration::from_millis(DEFAULT_LEASE_TIMEOUT_MS),
            in_flight: InFlightPolicy::default(),
        }
    }
}

impl IdempotencyConfig {
    pub fn validate(&self) -> ConfigResult<()> {
        if self.lease_timeout.is_zero() {
            return Err(ConfigError::invalid("lease_timeout_ms", "must be greater than 0"));
        }
        if self.retention <= self.lease_timeout {
            return Err(ConfigError::invalid("retention_ms", "must exceed lease_timeout_ms"));
        }
        if self.failure_retention > self.retention {
            return Err(ConfigError::invalid(
                "failure_retention_ms",
                "must not exceed retention_ms",
            ));
        }
        if let InFlightPolicy::Wait { poll_interval, .. } = self.in_flight {
            if poll_interval.is_zero() {
                return Err(ConfigError::invalid("poll_interval_ms", "must be greater than 0"));
            }
        }
        Ok(())
    }

    /// Milliseconds helpers for adapters that store epoch-millisecond stamps
    pub fn retention_ms(&self) -> i64 {
        to_millis(self.retention)
    }

    pub fn failure_retention_ms(&self) -> i64 {
        to_millis(self.failure_retention)
    }

    pub fn lease_timeout_ms(&self) -> i64 {
        to_millis(self.lease_timeout)
    }

    /// Lease length for an owner that needs the key for at least `hold`
    ///
    /// Never shorter than `lease_timeout`.
    pub fn lease_ms_for(&self, hold: Duration) -> i64 {
        self.lease_timeout_ms().max(to_millis(hold))
    }
}

fn to_millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

/// Circuit breaker settings shared by every protected resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    pub failure_threshold: u64,
    #[serde(rename = "window_ms", with = "duration_millis")]
    pub window: Duration,
    #[serde(rename = "cooldown_ms", with = "duration_millis")]
    pub cooldown: Duration,
    pub success_threshold: u64,
    pub half_open_max_calls: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            window: Duration::from_millis(DEFAULT_BREAKER_WINDOW_MS),
            cooldown: Duration::from_millis(DEFAULT_COOLDOWN_MS),
            success_threshold: DEFAULT_SUCCESS_THRESHOLD,
            half_open_max_calls: DEFAULT_HALF_OPEN_MAX_CALLS,
        }
    }
}

impl BreakerConfig {
    pub fn validate(&self) -> ConfigResult<()> {
        if self.failure_threshold == 0 {
            return Err(ConfigError::invalid("failure_threshold", "must be greater than 0"));
        }
        if self.success_threshold == 0 {
            return Err(ConfigError::invalid("success_threshold", "must be greater than 0"));
        }
        if self.half_open_max_calls == 0 {
            return Err(ConfigError::invalid("half_open_max_calls", "must be greater than 0"));
        }
        if self.window.is_zero() {
            return Err(ConfigError::invalid("window_ms", "must be greater than 0"));
        }
        Ok(())
    }
}

/// Retry policy attached to a protected operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Attempts including the first one
    pub max_attempts: u32,
    #[serde(rename = "base_delay_ms", with = "duration_millis")]
    pub base_delay: Duration,
    #[serde(rename = "max_delay_ms", with = "duration_millis")]
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    /// Randomize delays (equal jitter) to avoid synchronized retry storms
    pub jitter: bool,
    pub retryable_kinds: BTreeSet<ErrorKind>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: Duration::from_millis(DEFAULT_BASE_DELAY_MS),
            max_delay: Duration::from_millis(DEFAULT_MAX_DELAY_MS),
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            jitter: true,
            retryable_kinds: ErrorKind::default_retryable(),
        }
    }
}

impl RetryPolicy {
    /// Un-jittered delay after the given failed attempt (1-based):
    /// `min(base_delay * backoff_multiplier^(attempt - 1), max_delay)`
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let delay_ms = self.base_delay.as_millis() as f64 * self.backoff_multiplier.powi(exponent);
        if !delay_ms.is_finite() || delay_ms >= self.max_delay.as_millis() as f64 {
            self.max_delay
        } else {
            Duration::from_millis(delay_ms.max(0.0).round() as u64)
        }
    }

    pub fn is_retryable(&self, kind: ErrorKind) -> bool {
        self.retryable_kinds.contains(&kind)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.max_attempts == 0 {
            return Err(ConfigError::invalid("max_attempts", "must be at least 1"));
        }
        if self.base_delay > self.max_delay {
            return Err(ConfigError::invalid("base_delay_ms", "must not exceed max_delay_ms"));
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(ConfigError::invalid("backoff_multiplier", "must be >= 1.0"));
        }
        Ok(())
    }
}

/// Backing store for idempotency records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    Memory,
    Sqlite,
}

impl_domain_status_conversions!(StorageBackend {
    Memory => "memory",
    Sqlite => "sqlite",
});

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    /// SQLite database file, ignored by the memory backend
    pub path: String,
    pub pool_size: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Memory,
            path: DEFAULT_DB_PATH.to_string(),
            pool_size: DEFAULT_POOL_SIZE,
        }
    }
}

impl StorageConfig {
    pub fn validate(&self) -> ConfigResult<()> {
        if self.backend == StorageBackend::Sqlite {
            if self.path.trim().is_empty() {
                return Err(ConfigError::invalid("storage.path", "must not be empty"));
            }
            if self.pool_size == 0 {
                return Err(ConfigError::invalid("storage.pool_size", "must be greater than 0"));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset
    pub level: String,
    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: DEFAULT_LOG_LEVEL.to_string(), json: false }
    }
}
