//! A downstream resource with its breaker and retry policy

use std::collections::BTreeSet;
use std::sync::Arc;

use genguard_common::{
    BreakerRegistry, CircuitBreaker, CircuitBreakerConfig, Clock, ConfigResult, EventSink,
    RetryCondition, RetryConfig, RetryDecision, RetryExecutor, SystemClock,
};
use genguard_domain::{BreakerConfig, DownstreamError, ErrorKind, GuardConfig, RetryPolicy};

/// Breaker settings for the common circuit breaker
pub fn breaker_config(config: &BreakerConfig) -> ConfigResult<CircuitBreakerConfig> {
    CircuitBreakerConfig::builder()
        .failure_threshold(config.failure_threshold)
        .success_threshold(config.success_threshold)
        .cooldown(config.cooldown)
        .window(config.window)
        .half_open_max_calls(config.half_open_max_calls)
        .reset_on_success(true)
        .build()
}

/// Executor settings for a retry policy; jitter never exceeds the capped delay
pub fn retry_config(policy: &RetryPolicy) -> ConfigResult<RetryConfig> {
    let builder = RetryConfig::builder().max_attempts(policy.max_attempts).exponential_backoff(
        policy.base_delay,
        policy.backoff_multiplier,
        policy.max_delay,
    );
    let builder = if policy.jitter { builder.equal_jitter() } else { builder.no_jitter() };
    builder.build()
}

/// Retries downstream errors whose kind is in a configured set
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KindCondition {
    kinds: BTreeSet<ErrorKind>,
}

impl KindCondition {
    pub fn new(kinds: BTreeSet<ErrorKind>) -> Self {
        Self { kinds }
    }

    pub fn from_policy(policy: &RetryPolicy) -> Self {
        Self::new(policy.retryable_kinds.clone())
    }
}

impl RetryCondition<DownstreamError> for KindCondition {
    fn should_retry(&self, error: &DownstreamError, _attempt: u32) -> RetryDecision {
        if self.kinds.contains(&error.kind) {
            RetryDecision::Retry
        } else {
            RetryDecision::Stop
        }
    }
}

/// A named downstream guarded by one shared breaker and one retry policy
///
/// Clones share the breaker.
pub struct ProtectedResource<C: Clock = SystemClock> {
    breaker: Arc<CircuitBreaker<C>>,
    policy: RetryPolicy,
    retry: RetryConfig,
}

impl<C: Clock> Clone for ProtectedResource<C> {
    fn clone(&self) -> Self {
        Self {
            breaker: Arc::clone(&self.breaker),
            policy: self.policy.clone(),
            retry: self.retry.clone(),
        }
    }
}

impl<C: Clock> ProtectedResource<C> {
    /// Guard the resource named after `breaker` with `policy`
    pub fn new(breaker: Arc<CircuitBreaker<C>>, policy: RetryPolicy) -> ConfigResult<Self> {
        policy.validate()?;
        let retry = retry_config(&policy)?;
        Ok(Self { breaker, policy, retry })
    }

    /// Build a dedicated breaker from `config.breaker` and use `config.retry`
    pub fn from_config(
        name: impl Into<String>,
        config: &GuardConfig,
        clock: C,
        events: Arc<dyn EventSink>,
    ) -> ConfigResult<Self> {
        let breaker = CircuitBreaker::with_clock(name, breaker_config(&config.breaker)?, clock)?
            .with_event_sink(events);
        Self::new(Arc::new(breaker), config.retry.clone())
    }

    /// Use the registry's shared breaker for `name`
    pub fn from_registry(
        registry: &BreakerRegistry<C>,
        name: &str,
        policy: RetryPolicy,
    ) -> ConfigResult<Self>
    where
        C: Clone,
    {
        Self::new(registry.get_or_create(name), policy)
    }

    pub fn name(&self) -> &str {
        self.breaker.name()
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker<C>> {
        &self.breaker
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn retry_config(&self) -> &RetryConfig {
        &self.retry
    }

    /// Retry executor gated by this resource's breaker
    pub(crate) fn executor(&self, events: Arc<dyn EventSink>) -> RetryExecutor<KindCondition, C> {
        RetryExecutor::new(self.retry.clone(), KindCondition::from_policy(&self.policy))
            .with_breaker(Arc::clone(&self.breaker))
            .with_event_sink(events)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use genguard_common::{BackoffStrategy, CircuitState, Jitter, MockClock, NoopEventSink};

    use super::*;

    #[test]
    fn kind_condition_follows_policy_set() {
        let condition = KindCondition::from_policy(&RetryPolicy::default());
        assert_eq!(
            condition.should_retry(&DownstreamError::transient("blip"), 1),
            RetryDecision::Retry
        );
        assert_eq!(
            condition.should_retry(&DownstreamError::invalid_input("bad"), 1),
            RetryDecision::Stop
        );
    }

    #[test]
    fn retry_config_mirrors_policy() {
        let policy = RetryPolicy { jitter: false, ..RetryPolicy::default() };
        let config = retry_config(&policy).expect("valid policy");
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.jitter, Jitter::None);
        assert_eq!(
            config.backoff,
            BackoffStrategy::Exponential {
                initial_delay: Duration::from_millis(200),
                multiplier: 2.0,
                max_delay: Duration::from_millis(1_500),
            }
        );
        assert_eq!(config.delay_after(1), Duration::from_millis(200));
        assert_eq!(config.delay_after(4), Duration::from_millis(1_500));
    }

    #[test]
    fn from_config_builds_named_breaker() {
        let resource = ProtectedResource::from_config(
            "llm",
            &GuardConfig::default(),
            MockClock::new(),
            Arc::new(NoopEventSink),
        )
        .expect("defaults are valid");

        assert_eq!(resource.name(), "llm");
        assert_eq!(resource.breaker().state(), CircuitState::Closed);
        assert_eq!(resource.breaker().config().failure_threshold, 3);
        assert_eq!(resource.breaker().config().cooldown, Duration::from_secs(10));

        let shared = resource.clone();
        shared.breaker().record_failure();
        assert_eq!(resource.breaker().metrics().failure_count, 1);
    }

    #[test]
    fn invalid_policy_is_rejected() {
        let breaker = Arc::new(
            CircuitBreaker::with_clock("llm", CircuitBreakerConfig::default(), MockClock::new())
                .expect("valid"),
        );
        let policy = RetryPolicy { max_attempts: 0, ..RetryPolicy::default() };
        assert!(ProtectedResource::new(breaker, policy).is_err());
    }

    #[test]
    fn registry_resources_share_breakers() {
        let registry =
            BreakerRegistry::with_clock(CircuitBreakerConfig::default(), MockClock::new())
                .expect("valid");
        let a = ProtectedResource::from_registry(&registry, "history", RetryPolicy::default())
            .expect("valid");
        let b = ProtectedResource::from_registry(&registry, "history", RetryPolicy::default())
            .expect("valid");
        assert!(Arc::ptr_eq(a.breaker(), b.breaker()));
    }
}
