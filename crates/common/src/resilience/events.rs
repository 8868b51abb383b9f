//! Structured resilience events
//!
//! Breakers, the retry executor and the protected-call service describe what
//! they did as [`ResilienceEvent`] values and hand them to an [`EventSink`].
//! Formatting and shipping belong to the sink.

use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::circuit_breaker::CircuitState;
use crate::utils::serde::duration_millis;

/// Outcome of a single attempt made by the retry executor
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AttemptOutcome {
    /// The operation returned a value
    Succeeded,
    /// The operation returned an error
    Failed {
        /// Display form of the error
        error: String,
        /// Whether the retry condition allowed another attempt
        retryable: bool,
    },
    /// The breaker refused the attempt before the operation ran
    Rejected,
}

/// Event emitted by the resilience layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ResilienceEvent {
    /// A breaker moved between states
    BreakerTransition {
        /// Resource guarded by the breaker
        resource: String,
        /// State before the transition
        from: CircuitState,
        /// State after the transition
        to: CircuitState,
        /// Windowed failure count at the moment of the transition
        failure_count: u64,
        /// Wall-clock time of the transition, in epoch milliseconds
        at_millis: u64,
    },
    /// One attempt of a retried operation finished
    RetryAttempt {
        /// Resource the operation targets
        resource: String,
        /// 1-based attempt number
        attempt: u32,
        /// How the attempt ended
        outcome: AttemptOutcome,
        /// Delay before the next attempt, zero when no further attempt follows
        #[serde(with = "duration_millis")]
        delay: Duration,
    },
    /// A call was refused because the breaker is open
    CallRejected {
        /// Resource guarded by the open breaker
        resource: String,
    },
    /// A cached outcome was returned for an idempotency key
    IdempotencyReplay {
        /// Idempotency key
        key: String,
        /// Terminal state of the replayed record
        state: String,
    },
    /// An idempotency key could not be served (in flight or reused with another body)
    IdempotencyConflict {
        /// Idempotency key
        key: String,
        /// Why the key could not be served
        reason: String,
    },
    /// An expired lease was taken over by a new owner
    LeaseReclaimed {
        /// Idempotency key
        key: String,
    },
}

impl ResilienceEvent {
    /// Stable snake_case name of the event
    pub fn name(&self) -> &'static str {
        match self {
            Self::BreakerTransition { .. } => "breaker_transition",
            Self::RetryAttempt { .. } => "retry_attempt",
            Self::CallRejected { .. } => "call_rejected",
            Self::IdempotencyReplay { .. } => "idempotency_replay",
            Self::IdempotencyConflict { .. } => "idempotency_conflict",
            Self::LeaseReclaimed { .. } => "lease_reclaimed",
        }
    }
}

/// Destination for resilience events
pub trait EventSink: Send + Sync + 'static {
    /// Deliver an event. Must not block.
    fn emit(&self, event: &ResilienceEvent);
}

/// Sink that drops every event
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopEventSink;

impl EventSink for NoopEventSink {
    fn emit(&self, _event: &ResilienceEvent) {}
}

/// Sink that turns each event into one `tracing` event with structured fields
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn emit(&self, event: &ResilienceEvent) {
        match event {
            ResilienceEvent::BreakerTransition { resource, from, to, failure_count, at_millis } => {
                if *to == CircuitState::Open {
                    warn!(
                        event = event.name(),
                        resource = %resource,
                        from = %from,
                        to = %to,
                        failure_count,
                        at_millis,
                        "Circuit breaker opened"
                    );
                } else {
                    info!(
                        event = event.name(),
                        resource = %resource,
                        from = %from,
                        to = %to,
                        failure_count,
                        at_millis,
                        "Circuit breaker state changed"
                    );
                }
            }
            ResilienceEvent::RetryAttempt { resource, attempt, outcome, delay } => {
                let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
                match outcome {
                    AttemptOutcome::Succeeded => {
                        debug!(event = event.name(), resource = %resource, attempt, "Attempt succeeded");
                    }
                    AttemptOutcome::Failed { error, retryable } => {
                        warn!(
                            event = event.name(),
                            resource = %resource,
                            attempt,
                            retryable,
                            delay_ms,
                            error = %error,
                            "Attempt failed"
                        );
                    }
                    AttemptOutcome::Rejected => {
                        warn!(event = event.name(), resource = %resource, attempt, "Attempt rejected by open breaker");
                    }
                }
            }
            ResilienceEvent::CallRejected { resource } => {
                warn!(event = event.name(), resource = %resource, "Call rejected, breaker open");
            }
            ResilienceEvent::IdempotencyReplay { key, state } => {
                info!(event = event.name(), key = %key, state = %state, "Replaying cached outcome");
            }
            ResilienceEvent::IdempotencyConflict { key, reason } => {
                warn!(event = event.name(), key = %key, reason = %reason, "Idempotency conflict");
            }
            ResilienceEvent::LeaseReclaimed { key } => {
                warn!(event = event.name(), key = %key, "Reclaimed expired lease");
            }
        }
    }
}

/// Sink that keeps every event in memory, for assertions in tests
#[derive(Debug, Default)]
pub struct MemoryEventSink {
    events: Mutex<Vec<ResilienceEvent>>,
}

impl MemoryEventSink {
    /// Create an empty sink
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the captured events in emission order
    pub fn events(&self) -> Vec<ResilienceEvent> {
        self.events.lock().clone()
    }

    /// Number of captured events with the given [`ResilienceEvent::name`]
    pub fn count(&self, name: &str) -> usize {
        self.events.lock().iter().filter(|event| event.name() == name).count()
    }

    /// Drop all captured events
    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl EventSink for MemoryEventSink {
    fn emit(&self, event: &ResilienceEvent) {
        self.events.lock().push(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_sink_records_in_order() {
        let sink = MemoryEventSink::new();
        sink.emit(&ResilienceEvent::CallRejected { resource: "llm".into() });
        sink.emit(&ResilienceEvent::LeaseReclaimed { key: "abc".into() });
        sink.emit(&ResilienceEvent::CallRejected { resource: "llm".into() });

        assert_eq!(sink.events().len(), 3);
        assert_eq!(sink.count("call_rejected"), 2);
        assert_eq!(sink.events()[1].name(), "lease_reclaimed");

        sink.clear();
        assert!(sink.events().is_empty());
    }

    #[test]
    fn events_serialize_with_tag_and_millis() {
        let event = ResilienceEvent::RetryAttempt {
            resource: "history".into(),
            attempt: 2,
            outcome: AttemptOutcome::Failed { error: "timeout".into(), retryable: true },
            delay: Duration::from_millis(400),
        };
        let json = serde_json::to_value(&event).expect("serialize");
        assert_eq!(json["event"], "retry_attempt");
        assert_eq!(json["delay"], 400);
        assert_eq!(json["outcome"]["status"], "failed");
        assert_eq!(json["outcome"]["retryable"], true);

        let transition = ResilienceEvent::BreakerTransition {
            resource: "llm".into(),
            from: CircuitState::HalfOpen,
            to: CircuitState::Closed,
            failure_count: 0,
            at_millis: 10,
        };
        let json = serde_json::to_value(&transition).expect("serialize");
        assert_eq!(json["from"], "HALF_OPEN");
        assert_eq!(json["to"], "CLOSED");
    }

    #[test]
    fn tracing_sink_accepts_every_variant() {
        let sink = TracingEventSink;
        let events = [
            ResilienceEvent::CallRejected { resource: "llm".into() },
            ResilienceEvent::IdempotencyReplay { key: "k".into(), state: "completed".into() },
            ResilienceEvent::IdempotencyConflict { key: "k".into(), reason: "in_flight".into() },
            ResilienceEvent::LeaseReclaimed { key: "k".into() },
            ResilienceEvent::RetryAttempt {
                resource: "llm".into(),
                attempt: 1,
                outcome: AttemptOutcome::Rejected,
                delay: Duration::ZERO,
            },
        ];
        for event in &events {
            sink.emit(event);
        }
    }
}
