//! Bounded retry with backoff, guarded by a circuit breaker
//!
//! [`RetryExecutor`] runs an operation up to `max_attempts` times. Before
//! every attempt it asks the attached breaker for permission and after every
//! attempt it reports the outcome back, so retries stop as soon as the
//! resource is known to be unhealthy. Delays between attempts are async
//! sleeps and no lock is held across them.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use thiserror::Error;
use tracing::{debug, instrument};

use super::circuit_breaker::CircuitBreaker;
use super::clock::{Clock, SystemClock};
use super::events::{AttemptOutcome, EventSink, NoopEventSink, ResilienceEvent};
use crate::error::{ConfigError, ConfigResult};

/// Errors returned by the retry executor
#[derive(Debug, Error)]
pub enum RetryError<E> {
    /// The breaker refused the next attempt
    #[error("Circuit breaker is open, call rejected after {attempts} attempts")]
    CircuitOpen {
        /// Attempts made before the rejection
        attempts: u32,
    },

    /// All attempts failed with retryable errors
    #[error("All retry attempts exhausted after {attempts} tries: {source}")]
    Exhausted {
        /// Attempts made
        attempts: u32,
        /// Error from the last attempt
        #[source]
        source: E,
    },

    /// The operation failed with an error the retry condition refused to retry
    #[error("Operation failed with non-retryable error: {source}")]
    NonRetryable {
        /// Attempts made
        attempts: u32,
        /// The refused error
        #[source]
        source: E,
    },
}

impl<E> RetryError<E> {
    /// Number of times the operation was invoked
    pub fn attempts(&self) -> u32 {
        match self {
            Self::CircuitOpen { attempts }
            | Self::Exhausted { attempts, .. }
            | Self::NonRetryable { attempts, .. } => *attempts,
        }
    }

    /// The last operation error, if the operation ran and failed
    pub fn into_source(self) -> Option<E> {
        match self {
            Self::CircuitOpen { .. } => None,
            Self::Exhausted { source, .. } | Self::NonRetryable { source, .. } => Some(source),
        }
    }
}

/// Result type for retry operations
pub type RetryResult<T, E> = Result<T, RetryError<E>>;

/// Outcome of a retry execution including result and summary statistics.
#[derive(Debug)]
pub struct RetryOutcome<T, E> {
    /// Final result of the operation
    pub result: RetryResult<T, E>,
    /// Number of times the operation was invoked
    pub attempts: u32,
    /// Delays slept between attempts, in order
    pub delays: Vec<Duration>,
    /// When the first attempt started
    pub first_attempt_time: Instant,
}

impl<T, E> RetryOutcome<T, E> {
    /// Consume the outcome and return only the result.
    pub fn into_result(self) -> RetryResult<T, E> {
        self.result
    }

    /// Sum of all inter-attempt delays
    pub fn total_delay(&self) -> Duration {
        self.delays.iter().sum()
    }
}

/// Decides whether a failed attempt is retried
pub trait RetryCondition<E> {
    /// `attempt` is the 1-based number of the attempt that produced `error`
    fn should_retry(&self, error: &E, attempt: u32) -> RetryDecision;
}

/// Decision for whether to retry an operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry the operation with the default backoff delay
    Retry,
    /// Retry the operation with a custom delay
    RetryAfter(Duration),
    /// Don't retry the operation
    Stop,
}

/// Backoff strategy for calculating retry delays
#[derive(Debug, Clone, PartialEq)]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed(Duration),
    /// `min(initial_delay * multiplier^(attempt - 1), max_delay)`
    Exponential {
        /// Delay after the first failed attempt
        initial_delay: Duration,
        /// Growth factor per attempt
        multiplier: f64,
        /// Upper bound on any single delay
        max_delay: Duration,
    },
}

impl BackoffStrategy {
    /// Delay to sleep after the given failed attempt (1-based)
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        match self {
            BackoffStrategy::Fixed(delay) => *delay,
            BackoffStrategy::Exponential { initial_delay, multiplier, max_delay } => {
                let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
                let delay_ms = initial_delay.as_millis() as f64 * multiplier.powi(exponent);
                if !delay_ms.is_finite() || delay_ms >= max_delay.as_millis() as f64 {
                    *max_delay
                } else {
                    Duration::from_millis(delay_ms.max(0.0).round() as u64)
                }
            }
        }
    }
}

/// Jitter type for adding randomness to retry delays
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Jitter {
    /// No jitter
    None,
    /// Full jitter: 0 to calculated_delay
    Full,
    /// Equal jitter: calculated_delay/2 to calculated_delay
    Equal,
}

impl Jitter {
    /// Apply jitter to the calculated delay. Never exceeds `delay`.
    pub fn apply(&self, delay: Duration) -> Duration {
        let millis = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        match self {
            Jitter::None => delay,
            Jitter::Full => Duration::from_millis(random_up_to(millis)),
            Jitter::Equal => {
                let half = millis / 2;
                Duration::from_millis(half + random_up_to(millis - half))
            }
        }
    }
}

fn random_up_to(max: u64) -> u64 {
    if max == 0 {
        return 0;
    }
    rand::thread_rng().gen_range(0..=max)
}

/// Configuration for retry behavior
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first one
    pub max_attempts: u32,
    /// Backoff strategy for calculating delays
    pub backoff: BackoffStrategy,
    /// Jitter type for randomizing delays
    pub jitter: Jitter,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: BackoffStrategy::Exponential {
                initial_delay: Duration::from_millis(200),
                multiplier: 2.0,
                max_delay: Duration::from_millis(1500),
            },
            jitter: Jitter::Equal,
        }
    }
}

impl RetryConfig {
    /// Create a configuration builder
    pub fn builder() -> RetryConfigBuilder {
        RetryConfigBuilder::new()
    }

    /// Validate the configuration
    pub fn validate(&self) -> ConfigResult<()> {
        if self.max_attempts == 0 {
            return Err(ConfigError::invalid("max_attempts", "must be greater than 0"));
        }

        if let BackoffStrategy::Exponential { initial_delay, multiplier, max_delay } =
            &self.backoff
        {
            if !multiplier.is_finite() || *multiplier < 1.0 {
                return Err(ConfigError::invalid(
                    "backoff_multiplier",
                    "must be a finite number >= 1.0",
                ));
            }
            if initial_delay > max_delay {
                return Err(ConfigError::invalid("base_delay", "must not exceed max_delay"));
            }
        }

        Ok(())
    }

    /// Delay before the attempt following `attempt`, with jitter applied
    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.jitter.apply(self.backoff.calculate_delay(attempt))
    }

    /// Jittered delay after `attempt`, never shorter than `previous`.
    ///
    /// Jitter draws each delay independently, so without the floor a later
    /// delay could come out shorter than an earlier one.
    pub fn next_delay(&self, attempt: u32, previous: Duration) -> Duration {
        self.delay_after(attempt).max(previous)
    }
}

/// Builder for RetryConfig with fluent API
#[derive(Debug, Default)]
pub struct RetryConfigBuilder {
    config: RetryConfig,
}

impl RetryConfigBuilder {
    /// Start from [`RetryConfig::default`]
    pub fn new() -> Self {
        Self { config: RetryConfig::default() }
    }

    /// Maximum number of attempts, including the first one
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.config.max_attempts = attempts;
        self
    }

    /// Sleep the same `delay` between every attempt
    pub fn fixed_backoff(mut self, delay: Duration) -> Self {
        self.config.backoff = BackoffStrategy::Fixed(delay);
        self
    }

    /// Grow the delay by `multiplier` per attempt, capped at `max_delay`
    pub fn exponential_backoff(
        mut self,
        initial_delay: Duration,
        multiplier: f64,
        max_delay: Duration,
    ) -> Self {
        self.config.backoff = BackoffStrategy::Exponential { initial_delay, multiplier, max_delay };
        self
    }

    /// Use the computed delays as-is
    pub fn no_jitter(mut self) -> Self {
        self.config.jitter = Jitter::None;
        self
    }

    /// Randomize each delay over `[0, delay]`
    pub fn full_jitter(mut self) -> Self {
        self.config.jitter = Jitter::Full;
        self
    }

    /// Randomize each delay over `[delay / 2, delay]`
    pub fn equal_jitter(mut self) -> Self {
        self.config.jitter = Jitter::Equal;
        self
    }

    /// Validate and build the configuration
    ///
    /// # Errors
    /// Returns `ConfigError` if the settings are invalid.
    pub fn build(self) -> ConfigResult<RetryConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// The main retry executor
pub struct RetryExecutor<P, C: Clock = SystemClock> {
    config: RetryConfig,
    policy: P,
    resource: String,
    breaker: Option<Arc<CircuitBreaker<C>>>,
    events: Arc<dyn EventSink>,
}

impl<P> RetryExecutor<P, SystemClock> {
    /// Executor without a breaker
    pub fn new(config: RetryConfig, policy: P) -> Self {
        Self {
            config,
            policy,
            resource: String::from("unnamed"),
            breaker: None,
            events: Arc::new(NoopEventSink),
        }
    }
}

impl<P, C: Clock> RetryExecutor<P, C> {
    /// Gate every attempt on `breaker` and feed it each outcome. The
    /// breaker's name becomes the resource name of emitted events.
    pub fn with_breaker<C2: Clock>(self, breaker: Arc<CircuitBreaker<C2>>) -> RetryExecutor<P, C2> {
        RetryExecutor {
            config: self.config,
            policy: self.policy,
            resource: breaker.name().to_string(),
            breaker: Some(breaker),
            events: self.events,
        }
    }

    /// Emit attempt and rejection events to `sink`
    #[must_use]
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.events = sink;
        self
    }

    /// Resource name attached to emitted events
    #[must_use]
    pub fn with_resource(mut self, resource: impl Into<String>) -> Self {
        self.resource = resource.into();
        self
    }

    /// The retry configuration in use
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Execute an operation with retry logic
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> RetryResult<T, E>
    where
        P: RetryCondition<E>,
        E: fmt::Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.execute_with_outcome(operation).await.into_result()
    }

    /// Execute an operation with retry logic and return outcome statistics.
    #[instrument(
        skip(self, operation),
        fields(resource = %self.resource, max_attempts = self.config.max_attempts)
    )]
    pub async fn execute_with_outcome<F, Fut, T, E>(&self, mut operation: F) -> RetryOutcome<T, E>
    where
        P: RetryCondition<E>,
        E: fmt::Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let first_attempt_time = Instant::now();
        let mut delays = Vec::new();
        let mut previous = Duration::ZERO;
        let mut attempt: u32 = 1;

        loop {
            if let Some(breaker) = &self.breaker {
                if !breaker.allow() {
                    self.emit_attempt(attempt, AttemptOutcome::Rejected, Duration::ZERO);
                    self.events.emit(&ResilienceEvent::CallRejected {
                        resource: self.resource.clone(),
                    });
                    return RetryOutcome {
                        result: Err(RetryError::CircuitOpen { attempts: attempt - 1 }),
                        attempts: attempt - 1,
                        delays,
                        first_attempt_time,
                    };
                }
            }

            debug!(attempt, "Executing operation");

            let delay = {
                let error = match operation().await {
                    Ok(value) => {
                        if let Some(breaker) = &self.breaker {
                            breaker.record_success();
                        }
                        self.emit_attempt(attempt, AttemptOutcome::Succeeded, Duration::ZERO);
                        return RetryOutcome {
                            result: Ok(value),
                            attempts: attempt,
                            delays,
                            first_attempt_time,
                        };
                    }
                    Err(error) => error,
                };

                if let Some(breaker) = &self.breaker {
                    breaker.record_failure();
                }

                let delay = match self.policy.should_retry(&error, attempt) {
                    RetryDecision::Stop => {
                        self.emit_failure(attempt, &error, false, Duration::ZERO);
                        return RetryOutcome {
                            result: Err(RetryError::NonRetryable {
                                attempts: attempt,
                                source: error,
                            }),
                            attempts: attempt,
                            delays,
                            first_attempt_time,
                        };
                    }
                    _ if attempt >= self.config.max_attempts => {
                        self.emit_failure(attempt, &error, true, Duration::ZERO);
                        return RetryOutcome {
                            result: Err(RetryError::Exhausted { attempts: attempt, source: error }),
                            attempts: attempt,
                            delays,
                            first_attempt_time,
                        };
                    }
                    RetryDecision::Retry => self.config.next_delay(attempt, previous),
                    RetryDecision::RetryAfter(custom) => custom.max(previous),
                };
                self.emit_failure(attempt, &error, true, delay);
                delay
            };

            tokio::time::sleep(delay).await;
            delays.push(delay);
            previous = delay;
            attempt += 1;
        }
    }

    fn emit_failure<E: fmt::Display>(&self, attempt: u32, error: &E, retryable: bool, delay: Duration) {
        self.emit_attempt(
            attempt,
            AttemptOutcome::Failed { error: error.to_string(), retryable },
            delay,
        );
    }

    fn emit_attempt(&self, attempt: u32, outcome: AttemptOutcome, delay: Duration) {
        self.events.emit(&ResilienceEvent::RetryAttempt {
            resource: self.resource.clone(),
            attempt,
            outcome,
            delay,
        });
    }
}

/// Pre-defined retry conditions for common scenarios
pub mod policies {
    use super::{Duration, RetryCondition, RetryDecision};
    use crate::error::ErrorClassification;

    /// Retries on any error
    #[derive(Debug, Clone, Copy)]
    pub struct AlwaysRetry;

    impl<E> RetryCondition<E> for AlwaysRetry {
        fn should_retry(&self, _error: &E, _attempt: u32) -> RetryDecision {
            RetryDecision::Retry
        }
    }

    /// Never retries
    #[derive(Debug, Clone, Copy)]
    pub struct NeverRetry;

    impl<E> RetryCondition<E> for NeverRetry {
        fn should_retry(&self, _error: &E, _attempt: u32) -> RetryDecision {
            RetryDecision::Stop
        }
    }

    /// Predicate-based retry condition
    #[derive(Debug)]
    pub struct PredicateRetry<F> {
        predicate: F,
    }

    impl<F> PredicateRetry<F> {
        /// Retry while `predicate(error, attempt)` returns true
        pub fn new(predicate: F) -> Self {
            Self { predicate }
        }
    }

    impl<F, E> RetryCondition<E> for PredicateRetry<F>
    where
        F: Fn(&E, u32) -> bool,
    {
        fn should_retry(&self, error: &E, attempt: u32) -> RetryDecision {
            if (self.predicate)(error, attempt) {
                RetryDecision::Retry
            } else {
                RetryDecision::Stop
            }
        }
    }

    /// Retries errors that classify themselves as retryable, honouring
    /// their `retry_after` hint
    #[derive(Debug, Clone, Copy)]
    pub struct Classified;

    impl<E: ErrorClassification> RetryCondition<E> for Classified {
        fn should_retry(&self, error: &E, _attempt: u32) -> RetryDecision {
            if !error.is_retryable() {
                return RetryDecision::Stop;
            }
            match error.retry_after() {
                Some(delay) if delay > Duration::ZERO => RetryDecision::RetryAfter(delay),
                _ => RetryDecision::Retry,
            }
        }
    }
}
