//! Resilience patterns for guarding calls to unreliable downstreams
//!
//! This module provides **generic, reusable** building blocks:
//! - **Circuit Breaker**: stops calling a resource once it is observed failing
//!   and probes it again after a cooldown
//! - **Breaker Registry**: one shared breaker per resource name
//! - **Retry Executor**: bounded retries with exponential backoff and jitter,
//!   gated by a breaker
//! - **Events**: structured [`ResilienceEvent`]s delivered to an [`EventSink`]
//!
//! None of these types know about idempotency keys or the gateway domain;
//! `genguard-core` composes them into the protected-call service.
//!
//! ## Testing time-dependent behavior
//!
//! Breakers read time through [`Clock`]. Tests inject [`MockClock`] and
//! advance it explicitly; retry sleeps use `tokio::time` and are driven with a
//! paused runtime.

pub mod circuit_breaker;
pub mod clock;
pub mod events;
pub mod registry;
pub mod retry;

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerConfigBuilder, CircuitBreakerMetrics,
    CircuitState,
};
pub use clock::{Clock, MockClock, SystemClock};
pub use events::{
    AttemptOutcome, EventSink, MemoryEventSink, NoopEventSink, ResilienceEvent, TracingEventSink,
};
pub use registry::BreakerRegistry;
pub use retry::{
    policies, BackoffStrategy, Jitter, RetryCondition, RetryConfig, RetryConfigBuilder,
    RetryDecision, RetryError, RetryExecutor, RetryOutcome, RetryResult,
};
