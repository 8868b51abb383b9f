use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use genguard_common::{Clock, SystemClock};
use genguard_core::idempotency::ports::{AcquireOutcome, IdempotencyStore};
use genguard_core::idempotency::{
    complete_record, fail_record, in_flight_record, is_stale, now_millis, resolve_acquire,
};
use genguard_domain::{
    IdempotencyConfig, IdempotencyRecord, Lease, ProtectionError, StoreError, StoreResult,
};
use serde_json::Value;
use tracing::debug;

/// In-memory idempotency store
///
/// Each key's shard lock is held for the whole read-decide-write of an
/// operation, so two concurrent `acquire` calls for one key never both win.
pub struct InMemoryIdempotencyStore<C: Clock = SystemClock> {
    records: DashMap<String, IdempotencyRecord>,
    settings: IdempotencyConfig,
    clock: C,
}

impl InMemoryIdempotencyStore<SystemClock> {
    pub fn new(settings: IdempotencyConfig) -> Self {
        Self::with_clock(settings, SystemClock)
    }
}

impl Default for InMemoryIdempotencyStore<SystemClock> {
    fn default() -> Self {
        Self::new(IdempotencyConfig::default())
    }
}

impl<C: Clock> InMemoryIdempotencyStore<C> {
    pub fn with_clock(settings: IdempotencyConfig, clock: C) -> Self {
        Self { records: DashMap::new(), settings, clock }
    }

    /// Number of stored records, expired ones included until purged
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn now(&self) -> i64 {
        now_millis(&self.clock)
    }
}

#[async_trait]
impl<C: Clock> IdempotencyStore for InMemoryIdempotencyStore<C> {
    async fn acquire_with_lease(
        &self,
        key: &str,
        fingerprint: Option<&str>,
        min_lease: Duration,
    ) -> StoreResult<AcquireOutcome> {
        let now = self.now();
        let lease_ms = self.settings.lease_ms_for(min_lease);

        let outcome = match self.records.entry(key.to_string()) {
            Entry::Occupied(mut entry) => {
                let outcome = resolve_acquire(Some(entry.get()), key, fingerprint, now, lease_ms);
                if let AcquireOutcome::Acquired { lease, .. } = &outcome {
                    entry.insert(in_flight_record(lease, fingerprint, now, &self.settings));
                }
                outcome
            }
            Entry::Vacant(entry) => {
                let outcome = resolve_acquire(None, key, fingerprint, now, lease_ms);
                if let AcquireOutcome::Acquired { lease, .. } = &outcome {
                    entry.insert(in_flight_record(lease, fingerprint, now, &self.settings));
                }
                outcome
            }
        };

        Ok(outcome)
    }

    async fn complete(&self, lease: &Lease, result: Value) -> StoreResult<()> {
        let now = self.now();
        let mut record = self.records.get_mut(&lease.key);
        complete_record(record.as_deref_mut(), lease, result, now, &self.settings)
    }

    async fn fail(&self, lease: &Lease, error: ProtectionError) -> StoreResult<()> {
        let now = self.now();
        let mut record = self.records.get_mut(&lease.key);
        fail_record(record.as_deref_mut(), lease, error, now, &self.settings)
    }

    async fn release(&self, lease: &Lease) -> StoreResult<()> {
        self.records
            .remove_if(&lease.key, |_, record| record.is_owned_by(&lease.token))
            .map(|_| ())
            .ok_or_else(|| StoreError::NotOwner { key: lease.key.clone() })
    }

    async fn release_stale(&self, key: &str) -> StoreResult<bool> {
        let now = self.now();
        let removed = self.records.remove_if(key, |_, record| is_stale(record, now)).is_some();
        if removed {
            debug!(key, "Released stale idempotency record");
        }
        Ok(removed)
    }

    async fn get(&self, key: &str) -> StoreResult<Option<IdempotencyRecord>> {
        let now = self.now();
        Ok(self
            .records
            .get(key)
            .map(|record| record.value().clone())
            .filter(|record| !record.is_expired(now)))
    }

    async fn purge_expired(&self) -> StoreResult<usize> {
        let now = self.now();
        let mut purged = 0;
        self.records.retain(|_, record| {
            let keep = !record.is_expired(now);
            if !keep {
                purged += 1;
            }
            keep
        });
        if purged > 0 {
            debug!(purged, "Purged expired idempotency records");
        }
        Ok(purged)
    }
}

#[cfg(test)]
mod tests {
    use genguard_common::MockClock;
    use genguard_domain::RecordState;
    use serde_json::json;

    use super::*;

    fn store(clock: &MockClock) -> InMemoryIdempotencyStore<MockClock> {
        InMemoryIdempotencyStore::with_clock(IdempotencyConfig::default(), clock.clone())
    }

    #[tokio::test]
    async fn expired_records_are_hidden_then_purged() {
        let clock = MockClock::new();
        let store = store(&clock);

        let AcquireOutcome::Acquired { lease, .. } =
            store.acquire("k", None).await.expect("acquire")
        else {
            panic!("fresh key must be acquired");
        };
        store.complete(&lease, json!("done")).await.expect("complete");
        assert_eq!(store.get("k").await.expect("get").map(|r| r.state), Some(RecordState::Completed));

        clock.advance_millis(600_000);
        assert!(store.get("k").await.expect("get").is_none());
        assert_eq!(store.len(), 1);

        assert_eq!(store.purge_expired().await.expect("purge"), 1);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn complete_on_missing_key_is_not_owner() {
        let store = store(&MockClock::new());
        let lease = Lease::new("ghost", 0, 30_000);
        assert_eq!(
            store.complete(&lease, json!(null)).await,
            Err(StoreError::NotOwner { key: "ghost".into() })
        );
    }
}
