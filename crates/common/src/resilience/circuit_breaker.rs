//! Circuit breaker guarding a single downstream resource
//!
//! The breaker moves through three states:
//!
//! - **CLOSED**: calls are permitted. Failures are counted inside a sliding
//!   window; once the count reaches `failure_threshold` the breaker opens.
//! - **OPEN**: calls are rejected without touching the resource. After
//!   `cooldown` has elapsed since `opened_at`, the next [`CircuitBreaker::allow`]
//!   moves the breaker to half-open.
//! - **HALF_OPEN**: at most `half_open_max_calls` probes are let through.
//!   `success_threshold` probe successes close the breaker; any probe failure
//!   opens it again.
//!
//! All state lives behind one mutex, so every transition is observed whole.
//! Transition events are emitted after the lock is released.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::clock::{Clock, SystemClock};
use super::events::{EventSink, NoopEventSink, ResilienceEvent};
use crate::error::{ConfigError, ConfigResult};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Circuit is closed, allowing requests
    Closed,
    /// Circuit is open, rejecting requests
    Open,
    /// Circuit is half-open, allowing limited requests to test recovery
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "CLOSED"),
            CircuitState::Open => write!(f, "OPEN"),
            CircuitState::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Configuration for circuit breaker behavior
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Number of failures inside `window` that opens the circuit
    pub failure_threshold: u64,
    /// Number of probe successes needed to close the circuit from half-open
    pub success_threshold: u64,
    /// Time to wait in OPEN before probing
    pub cooldown: Duration,
    /// Sliding window over which failures are counted
    pub window: Duration,
    /// Maximum number of concurrent probes in half-open state
    pub half_open_max_calls: u64,
    /// Whether a success in closed state clears the failure window
    pub reset_on_success: bool,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            success_threshold: 1,
            cooldown: Duration::from_secs(10),
            window: Duration::from_secs(60),
            half_open_max_calls: 1,
            reset_on_success: true,
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a configuration builder
    pub fn builder() -> CircuitBreakerConfigBuilder {
        CircuitBreakerConfigBuilder::new()
    }

    /// Validate the configuration
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
            return Err(ConfigError::invalid("window", "must be greater than 0"));
        }

        Ok(())
    }
}

/// Builder for CircuitBreakerConfig
#[derive(Debug, Default)]
pub struct CircuitBreakerConfigBuilder {
    config: CircuitBreakerConfig,
}

impl CircuitBreakerConfigBuilder {
    /// Start from [`CircuitBreakerConfig::default`]
    pub fn new() -> Self {
        Self { config: CircuitBreakerConfig::default() }
    }

    /// Failures inside the window that open the circuit
    pub fn failure_threshold(mut self, threshold: u64) -> Self {
        self.config.failure_threshold = threshold;
        self
    }

    /// Probe successes that close the circuit from half-open
    pub fn success_threshold(mut self, threshold: u64) -> Self {
        self.config.success_threshold = threshold;
        self
    }

    /// Time spent open before a probe is allowed
    pub fn cooldown(mut self, cooldown: Duration) -> Self {
        self.config.cooldown = cooldown;
        self
    }

    /// Sliding window for failure counting
    pub fn window(mut self, window: Duration) -> Self {
        self.config.window = window;
        self
    }

    /// Concurrent probes admitted while half-open
    pub fn half_open_max_calls(mut self, max_calls: u64) -> Self {
        self.config.half_open_max_calls = max_calls;
        self
    }

    /// Clear the failure window on a closed-state success
    pub fn reset_on_success(mut self, reset: bool) -> Self {
        self.config.reset_on_success = reset;
        self
    }

    /// Validate and build the configuration
    ///
    /// # Errors
    /// Returns `ConfigError` if the settings are invalid.
    pub fn build(self) -> ConfigResult<CircuitBreakerConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Circuit breaker metrics for monitoring
#[derive(Debug, Clone)]
pub struct CircuitBreakerMetrics {
    /// Current state
    pub state: CircuitState,
    /// Failures currently inside the sliding window
    pub failure_count: u64,
    /// Probe successes since entering half-open
    pub success_count: u64,
    /// Probes currently admitted in half-open
    pub half_open_calls: u64,
    /// Calls admitted by `allow()`
    pub total_calls: u64,
    /// Calls refused by `allow()`
    pub rejected_calls: u64,
    /// When the breaker last opened
    pub opened_at: Option<Instant>,
    /// When the breaker last changed state
    pub state_change_time: Instant,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failures: VecDeque<Instant>,
    success_count: u64,
    half_open_calls: u64,
    total_calls: u64,
    rejected_calls: u64,
    opened_at: Option<Instant>,
    state_change_time: Instant,
}

impl BreakerState {
    fn prune(&mut self, now: Instant, window: Duration) {
        while let Some(&oldest) = self.failures.front() {
            if now.saturating_duration_since(oldest) > window {
                self.failures.pop_front();
            } else {
                break;
            }
        }
    }

    fn failure_count(&self) -> u64 {
        self.failures.len() as u64
    }
}

/// Circuit breaker for one named resource
///
/// Clones share state, so one breaker can be handed to every caller of the
/// resource. Use [`super::BreakerRegistry`] to keep one per resource name.
pub struct CircuitBreaker<C: Clock = SystemClock> {
    name: Arc<str>,
    config: CircuitBreakerConfig,
    inner: Arc<Mutex<BreakerState>>,
    clock: Arc<C>,
    events: Arc<dyn EventSink>,
}

impl<C: Clock> fmt::Debug for CircuitBreaker<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("state", &inner.state)
            .field("failure_count", &inner.failure_count())
            .finish()
    }
}

impl<C: Clock> Clone for CircuitBreaker<C> {
    fn clone(&self) -> Self {
        Self {
            name: Arc::clone(&self.name),
            config: self.config.clone(),
            inner: Arc::clone(&self.inner),
            clock: Arc::clone(&self.clock),
            events: Arc::clone(&self.events),
        }
    }
}

impl CircuitBreaker<SystemClock> {
    /// Create a breaker using the system clock
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> ConfigResult<Self> {
        Self::with_clock(name, config, SystemClock)
    }
}

impl<C: Clock> CircuitBreaker<C> {
    /// Create a breaker with a custom clock (useful for testing)
    pub fn with_clock(
        name: impl Into<String>,
        config: CircuitBreakerConfig,
        clock: C,
    ) -> ConfigResult<Self> {
        config.validate()?;
        Ok(Self::from_validated(name.into(), config, clock))
    }

    /// Construct from a config that has already passed `validate()`
    pub(crate) fn from_validated(name: String, config: CircuitBreakerConfig, clock: C) -> Self {
        let now = clock.now();

        Self {
            name: Arc::from(name),
            config,
            inner: Arc::new(Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failures: VecDeque::new(),
                success_count: 0,
                half_open_calls: 0,
                total_calls: 0,
                rejected_calls: 0,
                opened_at: None,
                state_change_time: now,
            })),
            clock: Arc::new(clock),
            events: Arc::new(NoopEventSink),
        }
    }

    /// Route transition events to `sink`
    #[must_use]
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.events = sink;
        self
    }

    /// Name of the protected resource
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The breaker configuration
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Ask whether a call may proceed
    ///
    /// In OPEN, the first call after the cooldown moves the breaker to
    /// HALF_OPEN and takes a probe slot. In HALF_OPEN, calls beyond
    /// `half_open_max_calls` outstanding probes are refused.
    pub fn allow(&self) -> bool {
        let now = self.clock.now();
        let mut event = None;

        let allowed = {
            let mut inner = self.inner.lock();
            let allowed = match inner.state {
                CircuitState::Closed => true,
                CircuitState::Open => {
                    let cooled = inner
                        .opened_at
                        .is_some_and(|at| now.saturating_duration_since(at) >= self.config.cooldown);
                    if cooled {
                        event = Some(self.transition(&mut inner, CircuitState::HalfOpen, now));
                        inner.half_open_calls = 1;
                    }
                    cooled
                }
                CircuitState::HalfOpen => {
                    if inner.half_open_calls < self.config.half_open_max_calls {
                        inner.half_open_calls += 1;
                        true
                    } else {
                        false
                    }
                }
            };

            if allowed {
                inner.total_calls += 1;
            } else {
                inner.rejected_calls += 1;
            }
            allowed
        };

        self.publish(event);
        if !allowed {
            debug!(resource = %self.name, "Circuit breaker rejected call");
        }
        allowed
    }

    /// Record a successful call
    pub fn record_success(&self) {
        let now = self.clock.now();
        let mut event = None;

        {
            let mut inner = self.inner.lock();
            match inner.state {
                CircuitState::Closed => {
                    if self.config.reset_on_success {
                        inner.failures.clear();
                    }
                }
                CircuitState::HalfOpen => {
                    inner.half_open_calls = inner.half_open_calls.saturating_sub(1);
                    inner.success_count += 1;
                    if inner.success_count >= self.config.success_threshold {
                        event = Some(self.transition(&mut inner, CircuitState::Closed, now));
                    }
                }
                CircuitState::Open => {
                    // Late result of a call admitted before the breaker opened.
                    debug!(resource = %self.name, "Ignoring success while circuit is open");
                }
            }
        }

        self.publish(event);
    }

    /// Record a failed call
    pub fn record_failure(&self) {
        let now = self.clock.now();
        let mut event = None;

        {
            let mut inner = self.inner.lock();
            match inner.state {
                CircuitState::Closed => {
                    inner.prune(now, self.config.window);
                    inner.failures.push_back(now);
                    if inner.failure_count() >= self.config.failure_threshold {
                        event = Some(self.transition(&mut inner, CircuitState::Open, now));
                    }
                }
                CircuitState::HalfOpen => {
                    inner.failures.push_back(now);
                    event = Some(self.transition(&mut inner, CircuitState::Open, now));
                }
                CircuitState::Open => {}
            }
        }

        self.publish(event);
    }

    /// Current state. Does not apply the OPEN to HALF_OPEN transition; only
    /// [`CircuitBreaker::allow`] does.
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Snapshot of the breaker counters
    pub fn metrics(&self) -> CircuitBreakerMetrics {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        if inner.state == CircuitState::Closed {
            inner.prune(now, self.config.window);
        }
        CircuitBreakerMetrics {
            state: inner.state,
            failure_count: inner.failure_count(),
            success_count: inner.success_count,
            half_open_calls: inner.half_open_calls,
            total_calls: inner.total_calls,
            rejected_calls: inner.rejected_calls,
            opened_at: inner.opened_at,
            state_change_time: inner.state_change_time,
        }
    }

    /// Apply a transition under the lock; the returned event is published by
    /// the caller once the lock is dropped.
    fn transition(
        &self,
        inner: &mut BreakerState,
        to: CircuitState,
        now: Instant,
    ) -> ResilienceEvent {
        let from = inner.state;
        let failure_count = inner.failure_count();

        inner.state = to;
        inner.state_change_time = now;
        inner.success_count = 0;
        inner.half_open_calls = 0;
        match to {
            CircuitState::Open => {
                inner.opened_at = Some(now);
                inner.failures.clear();
            }
            CircuitState::Closed => inner.failures.clear(),
            CircuitState::HalfOpen => {}
        }

        ResilienceEvent::BreakerTransition {
            resource: self.name.to_string(),
            from,
            to,
            failure_count,
            at_millis: self.clock.millis_since_epoch(),
        }
    }

    fn publish(&self, event: Option<ResilienceEvent>) {
        if let Some(event) = event {
            if let ResilienceEvent::BreakerTransition { to: CircuitState::Open, failure_count, .. } =
                &event
            {
                warn!(resource = %self.name, failure_count, "Circuit breaker opened");
            }
            self.events.emit(&event);
        }
    }
}
