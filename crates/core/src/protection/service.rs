//! Protected-call service - composes idempotency, breaker, retry and budget

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use genguard_common::{Clock, EventSink, NoopEventSink, ResilienceEvent, RetryError};
use genguard_domain::constants::LEASE_SETTLE_MARGIN_MS;
use genguard_domain::{
    ConflictReason, ErrorKind, IdempotencyConfig, InFlightPolicy, Lease, ProtectionError,
    RecordState, StoreResult,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use super::operation::Operation;
use super::resource::ProtectedResource;
use crate::idempotency::ports::{AcquireOutcome, IdempotencyStore};

/// Per-call inputs supplied by the request handler
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallRequest {
    /// Idempotency key; `None` runs the call without deduplication
    pub key: Option<String>,
    /// Fingerprint of the request body, see [`crate::fingerprint_json`]
    pub fingerprint: Option<String>,
    /// Overall budget for every attempt and backoff delay
    pub budget: Duration,
}

impl CallRequest {
    pub fn keyed(key: impl Into<String>, budget: Duration) -> Self {
        Self { key: Some(key.into()), fingerprint: None, budget }
    }

    pub fn pass_through(budget: Duration) -> Self {
        Self { key: None, fingerprint: None, budget }
    }

    #[must_use]
    pub fn with_fingerprint(mut self, fingerprint: impl Into<String>) -> Self {
        self.fingerprint = Some(fingerprint.into());
        self
    }
}

/// Value returned by [`ProtectedCall::call_tracked`]
#[derive(Debug, Clone, PartialEq)]
pub struct CallOutcome<T> {
    pub value: T,
    /// The value came from the idempotency store, not from the downstream
    pub replayed: bool,
}

/// Protected-call service
///
/// One instance is shared by every handler; the store it holds is shared
/// across all resources. Resources (and their breakers) are passed per call.
///
/// Once a key is acquired, the downstream work runs on its own task. A caller
/// that stops waiting does not cancel it: the outcome is still recorded, so a
/// retry with the same key observes it.
///
/// The lease taken for a call covers its whole budget plus
/// [`LEASE_SETTLE_MARGIN_MS`], so a live owner is never reclaimed mid-call.
pub struct ProtectedCall {
    store: Arc<dyn IdempotencyStore>,
    in_flight: InFlightPolicy,
    events: Arc<dyn EventSink>,
}

enum Admission<T> {
    Owned(Lease),
    Replayed(T),
}

enum Settlement {
    Complete(Value),
    Fail(ProtectionError),
    Release,
}

impl ProtectedCall {
    /// Create a service that fails fast on keys in flight elsewhere
    pub fn new(store: Arc<dyn IdempotencyStore>) -> Self {
        Self { store, in_flight: InFlightPolicy::FailFast, events: Arc::new(NoopEventSink) }
    }

    /// Create a service using the in-flight policy from `config`
    pub fn from_config(store: Arc<dyn IdempotencyStore>, config: &IdempotencyConfig) -> Self {
        Self::new(store).with_in_flight_policy(config.in_flight)
    }

    #[must_use]
    pub fn with_in_flight_policy(mut self, policy: InFlightPolicy) -> Self {
        self.in_flight = policy;
        self
    }

    /// Route idempotency and retry events to `sink`
    ///
    /// Breaker transitions go to the sink the breaker was built with.
    #[must_use]
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.events = sink;
        self
    }

    pub fn store(&self) -> &Arc<dyn IdempotencyStore> {
        &self.store
    }

    /// Run `operation` against `resource` and return its value
    pub async fn call<T, O, C>(
        &self,
        request: &CallRequest,
        resource: &ProtectedResource<C>,
        operation: O,
    ) -> Result<T, ProtectionError>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        O: Operation<T>,
        C: Clock,
    {
        self.call_tracked(request, resource, operation).await.map(|outcome| outcome.value)
    }

    /// Run `operation` against `resource`, reporting whether the value was
    /// replayed from the idempotency store
    #[instrument(
        skip_all,
        fields(resource = %resource.name(), key = request.key.as_deref().unwrap_or("-"))
    )]
    pub async fn call_tracked<T, O, C>(
        &self,
        request: &CallRequest,
        resource: &ProtectedResource<C>,
        operation: O,
    ) -> Result<CallOutcome<T>, ProtectionError>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        O: Operation<T>,
        C: Clock,
    {
        let Some(key) = request.key.as_deref() else {
            debug!("No idempotency key, running pass-through");
            let value = spawn_protected(run_guarded(
                resource.clone(),
                operation,
                request.budget,
                Arc::clone(&self.events),
            ))
            .await?;
            return Ok(CallOutcome { value, replayed: false });
        };

        let hold = request.budget.saturating_add(Duration::from_millis(LEASE_SETTLE_MARGIN_MS));
        let lease = match self.admit(key, request.fingerprint.as_deref(), hold).await? {
            Admission::Replayed(value) => return Ok(CallOutcome { value, replayed: true }),
            Admission::Owned(lease) => lease,
        };

        let value = spawn_protected(run_owned(
            Arc::clone(&self.store),
            lease,
            resource.clone(),
            operation,
            request.budget,
            Arc::clone(&self.events),
        ))
        .await?;
        Ok(CallOutcome { value, replayed: false })
    }

    async fn admit<T: DeserializeOwned>(
        &self,
        key: &str,
        fingerprint: Option<&str>,
        hold: Duration,
    ) -> Result<Admission<T>, ProtectionError> {
        let started = Instant::now();

        loop {
            match self.store.acquire_with_lease(key, fingerprint, hold).await? {
                AcquireOutcome::Acquired { lease, reclaimed } => {
                    if reclaimed {
                        warn!(key, "Reclaimed idempotency key from an expired lease");
                        self.events.emit(&ResilienceEvent::LeaseReclaimed { key: key.to_string() });
                    }
                    return Ok(Admission::Owned(lease));
                }
                AcquireOutcome::AlreadyCompleted(value) => {
                    self.replayed(key, RecordState::Completed);
                    let value = serde_json::from_value(value).map_err(|err| {
                        ProtectionError::Store(format!(
                            "cached result for key '{key}' does not decode: {err}"
                        ))
                    })?;
                    return Ok(Admission::Replayed(value));
                }
                AcquireOutcome::AlreadyFailed(error) => {
                    self.replayed(key, RecordState::Failed);
                    return Err(error);
                }
                AcquireOutcome::FingerprintMismatch => {
                    return Err(self.conflict(key, ConflictReason::FingerprintMismatch));
                }
                AcquireOutcome::InProgressByOther => match self.in_flight {
                    InFlightPolicy::FailFast => {
                        return Err(self.conflict(key, ConflictReason::InFlight));
                    }
                    InFlightPolicy::Wait { max_wait, poll_interval } => {
                        let waited = started.elapsed();
                        if waited >= max_wait {
                            return Err(self.conflict(key, ConflictReason::InFlight));
                        }
                        debug!(key, waited = ?waited, "Key in flight elsewhere, waiting");
                        tokio::time::sleep(poll_interval.min(max_wait - waited)).await;
                    }
                },
            }
        }
    }

    fn replayed(&self, key: &str, state: RecordState) {
        info!(key, %state, "Replaying cached idempotent outcome");
        self.events
            .emit(&ResilienceEvent::IdempotencyReplay { key: key.to_string(), state: state.to_string() });
    }

    fn conflict(&self, key: &str, reason: ConflictReason) -> ProtectionError {
        info!(key, %reason, "Idempotency key conflict");
        self.events.emit(&ResilienceEvent::IdempotencyConflict {
            key: key.to_string(),
            reason: reason.to_string(),
        });
        ProtectionError::Conflict { key: key.to_string(), reason }
    }
}

/// Run `task` detached from the caller and wait for it
async fn spawn_protected<T, F>(task: F) -> Result<T, ProtectionError>
where
    T: Send + 'static,
    F: Future<Output = Result<T, ProtectionError>> + Send + 'static,
{
    match tokio::spawn(task).await {
        Ok(result) => result,
        Err(err) => {
            error!(error = %err, "Protected call task did not finish");
            Err(ProtectionError::Downstream {
                kind: ErrorKind::Internal,
                message: format!("protected call aborted: {err}"),
            })
        }
    }
}

/// Breaker + retry + budget, no idempotency
async fn run_guarded<T, O, C>(
    resource: ProtectedResource<C>,
    operation: O,
    budget: Duration,
    events: Arc<dyn EventSink>,
) -> Result<T, ProtectionError>
where
    T: Send + 'static,
    O: Operation<T>,
    C: Clock,
{
    let executor = resource.executor(events);
    let attempt_running = AtomicBool::new(false);
    let guarded = executor.execute(|| {
        let attempt = operation.invoke();
        let running = &attempt_running;
        async move {
            running.store(true, Ordering::SeqCst);
            let result = attempt.await;
            running.store(false, Ordering::SeqCst);
            result
        }
    });

    match tokio::time::timeout(budget, guarded).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(RetryError::CircuitOpen { attempts })) => {
            warn!(attempts, "Circuit breaker refused the call");
            Err(ProtectionError::BreakerOpen { resource: resource.name().to_string() })
        }
        Ok(Err(
            RetryError::Exhausted { attempts, source } | RetryError::NonRetryable { attempts, source },
        )) => {
            warn!(attempts, error = %source, "Protected call failed");
            Err(source.into())
        }
        Err(_elapsed) => {
            let error = ProtectionError::timeout(budget);
            warn!(error = %error, "Protected call exceeded its budget");
            // A budget spent in backoff already had its last failure recorded
            if attempt_running.load(Ordering::SeqCst) {
                resource.breaker().record_failure();
            }
            Err(error)
        }
    }
}

/// Guarded run that records its outcome under `lease`
///
/// Breaker rejections release the key instead of caching, since no
/// downstream outcome exists for them.
async fn run_owned<T, O, C>(
    store: Arc<dyn IdempotencyStore>,
    lease: Lease,
    resource: ProtectedResource<C>,
    operation: O,
    budget: Duration,
    events: Arc<dyn EventSink>,
) -> Result<T, ProtectionError>
where
    T: Serialize + Send + 'static,
    O: Operation<T>,
    C: Clock,
{
    let outcome = run_guarded(resource, operation, budget, events).await;

    let settlement = match &outcome {
        Ok(value) => match serde_json::to_value(value) {
            Ok(json) => Settlement::Complete(json),
            Err(err) => Settlement::Fail(ProtectionError::Store(format!(
                "result for key '{}' is not serializable: {err}",
                lease.key
            ))),
        },
        Err(ProtectionError::BreakerOpen { .. }) => Settlement::Release,
        Err(error) => Settlement::Fail(error.clone()),
    };

    match settlement {
        Settlement::Complete(json) => settle(&lease, store.complete(&lease, json).await)?,
        Settlement::Release => settle(&lease, store.release(&lease).await)?,
        Settlement::Fail(error) => {
            settle(&lease, store.fail(&lease, error.clone()).await)?;
            if outcome.is_ok() {
                return Err(error);
            }
        }
    }
    outcome
}

fn settle(lease: &Lease, result: StoreResult<()>) -> Result<(), ProtectionError> {
    result.map_err(|err| {
        error!(key = %lease.key, error = %err, "Failed to record idempotency outcome");
        ProtectionError::from(err)
    })
}
