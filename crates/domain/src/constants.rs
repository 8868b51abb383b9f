//! Domain constants
//!
//! Defaults for every configuration value, shared by the config structs and
//! the loaders.

// Idempotency
pub const DEFAULT_RETENTION_MS: u64 = 600_000;
pub const DEFAULT_FAILURE_RETENTION_MS: u64 = 60_000;
pub const DEFAULT_LEASE_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_WAIT_MAX_MS: u64 = 5_000;
pub const DEFAULT_WAIT_POLL_MS: u64 = 50;
/// Lease time granted past a call's budget for recording its outcome
pub const LEASE_SETTLE_MARGIN_MS: u64 = 5_000;

// Circuit breaker
pub const DEFAULT_FAILURE_THRESHOLD: u64 = 3;
pub const DEFAULT_BREAKER_WINDOW_MS: u64 = 60_000;
pub const DEFAULT_COOLDOWN_MS: u64 = 10_000;
pub const DEFAULT_SUCCESS_THRESHOLD: u64 = 1;
pub const DEFAULT_HALF_OPEN_MAX_CALLS: u64 = 1;

// Retry
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_BASE_DELAY_MS: u64 = 200;
pub const DEFAULT_MAX_DELAY_MS: u64 = 1_500;
pub const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;

// Call budget
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;

// Storage
pub const DEFAULT_DB_PATH: &str = "genguard.db";
pub const DEFAULT_POOL_SIZE: u32 = 4;

// Logging
pub const DEFAULT_LOG_LEVEL: &str = "info";
