//! Generic resilience primitives shared across Genguard crates.
//!
//! # Feature Tiers
//!
//! Enable cargo features to opt into the tiers you need:
//! - `foundation`: error classification, serde helpers
//! - `runtime`: clock, circuit breaker, retry executor, resilience events
//! - `observability`: tracing integration (pulled in by `runtime`)

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms)]
#![warn(clippy::all, clippy::perf, clippy::complexity, clippy::suspicious)]

// Foundation tier
// -----------------------------------------------------------------
#[cfg(feature = "foundation")]
pub mod error;
#[cfg(feature = "foundation")]
pub mod utils;

// Runtime tier
// --------------------------------------------------------------------
#[cfg(feature = "runtime")]
pub mod resilience;

// Re-export commonly used types and traits for convenience
// ------------------------
#[cfg(feature = "foundation")]
pub use error::{ConfigError, ConfigResult, ErrorClassification, ErrorSeverity};
#[cfg(feature = "runtime")]
pub use resilience::{
    policies, AttemptOutcome, BackoffStrategy, BreakerRegistry, CircuitBreaker,
    CircuitBreakerConfig, CircuitBreakerConfigBuilder, CircuitBreakerMetrics, CircuitState, Clock,
    EventSink, Jitter, MemoryEventSink, MockClock, NoopEventSink, ResilienceEvent, RetryCondition,
    RetryConfig, RetryConfigBuilder, RetryDecision, RetryError, RetryExecutor, RetryOutcome,
    SystemClock, TracingEventSink,
};
#[cfg(feature = "foundation")]
pub use utils::serde::duration_millis;
