//! One shared circuit breaker per downstream resource

use std::sync::Arc;

use dashmap::DashMap;

use super::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use super::clock::{Clock, SystemClock};
use super::events::{EventSink, NoopEventSink};
use crate::error::ConfigResult;

/// Hands out a single [`CircuitBreaker`] per resource name
///
/// Every breaker created by the registry shares the registry's config, clock
/// and event sink. Concurrent `get_or_create` calls for the same name observe
/// the same breaker.
pub struct BreakerRegistry<C: Clock + Clone = SystemClock> {
    config: CircuitBreakerConfig,
    clock: C,
    events: Arc<dyn EventSink>,
    breakers: DashMap<String, Arc<CircuitBreaker<C>>>,
}

impl BreakerRegistry<SystemClock> {
    /// Registry using the system clock
    pub fn new(config: CircuitBreakerConfig) -> ConfigResult<Self> {
        Self::with_clock(config, SystemClock)
    }
}

impl<C: Clock + Clone> BreakerRegistry<C> {
    /// Registry with a custom clock
    pub fn with_clock(config: CircuitBreakerConfig, clock: C) -> ConfigResult<Self> {
        config.validate()?;
        Ok(Self { config, clock, events: Arc::new(NoopEventSink), breakers: DashMap::new() })
    }

    /// Route events of every breaker created from now on to `sink`
    #[must_use]
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.events = sink;
        self
    }

    /// Breaker for `resource`, created on first use
    pub fn get_or_create(&self, resource: &str) -> Arc<CircuitBreaker<C>> {
        if let Some(existing) = self.breakers.get(resource) {
            return Arc::clone(existing.value());
        }

        let entry = self.breakers.entry(resource.to_string()).or_insert_with(|| {
            let breaker = CircuitBreaker::from_validated(
                resource.to_string(),
                self.config.clone(),
                self.clock.clone(),
            );
            Arc::new(breaker.with_event_sink(Arc::clone(&self.events)))
        });
        Arc::clone(entry.value())
    }

    /// Breaker for `resource` if one was created
    pub fn get(&self, resource: &str) -> Option<Arc<CircuitBreaker<C>>> {
        self.breakers.get(resource).map(|entry| Arc::clone(entry.value()))
    }

    /// Names of every resource with a breaker, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.breakers.iter().map(|entry| entry.key().clone()).collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::resilience::circuit_breaker::CircuitState;
    use crate::resilience::clock::MockClock;
    use crate::resilience::events::MemoryEventSink;

    #[test]
    fn same_name_shares_state() {
        let registry = BreakerRegistry::new(
            CircuitBreakerConfig::builder().failure_threshold(1).build().expect("valid"),
        )
        .expect("valid");

        registry.get_or_create("llm").record_failure();
        assert_eq!(registry.get_or_create("llm").state(), CircuitState::Open);
        assert_eq!(registry.get_or_create("history").state(), CircuitState::Closed);
        assert_eq!(registry.names(), vec!["history".to_string(), "llm".to_string()]);
        assert!(registry.get("unknown").is_none());
    }

    #[test]
    fn breakers_share_clock_and_sink() {
        let clock = MockClock::new();
        let sink = Arc::new(MemoryEventSink::new());
        let registry = BreakerRegistry::with_clock(
            CircuitBreakerConfig::builder()
                .failure_threshold(1)
                .cooldown(Duration::from_secs(5))
                .build()
                .expect("valid"),
            clock.clone(),
        )
        .expect("valid")
        .with_event_sink(sink.clone());

        let breaker = registry.get_or_create("llm");
        breaker.record_failure();
        clock.advance(Duration::from_secs(5));
        assert!(breaker.allow());
        assert_eq!(sink.count("breaker_transition"), 2);
    }

    #[test]
    fn rejects_invalid_config() {
        let config = CircuitBreakerConfig { failure_threshold: 0, ..Default::default() };
        assert!(BreakerRegistry::new(config).is_err());
    }
}
