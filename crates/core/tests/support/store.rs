//! In-memory fake for the `IdempotencyStore` port
//!
//! A single mutex around a `HashMap` serializes every operation, which is
//! enough atomicity for tests and exercises the shared acquire rules.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use genguard_common::MockClock;
use genguard_core::idempotency;
use genguard_core::idempotency::ports::{AcquireOutcome, IdempotencyStore};
use genguard_domain::{IdempotencyConfig, IdempotencyRecord, Lease, ProtectionError, StoreResult};
use parking_lot::Mutex;
use serde_json::Value;

pub struct FakeStore {
    records: Mutex<HashMap<String, IdempotencyRecord>>,
    clock: MockClock,
    settings: IdempotencyConfig,
    acquire_calls: AtomicUsize,
}

impl FakeStore {
    pub fn new(clock: MockClock) -> Self {
        Self::with_settings(clock, IdempotencyConfig::default())
    }

    pub fn with_settings(clock: MockClock, settings: IdempotencyConfig) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            clock,
            settings,
            acquire_calls: AtomicUsize::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn acquire_calls(&self) -> usize {
        self.acquire_calls.load(Ordering::SeqCst)
    }

    fn now(&self) -> i64 {
        idempotency::now_millis(&self.clock)
    }
}

#[async_trait]
impl IdempotencyStore for FakeStore {
    async fn acquire_with_lease(
        &self,
        key: &str,
        fingerprint: Option<&str>,
        min_lease: Duration,
    ) -> StoreResult<AcquireOutcome> {
        self.acquire_calls.fetch_add(1, Ordering::SeqCst);
        let now = self.now();
        let lease_ms = self.settings.lease_ms_for(min_lease);
        let mut records = self.records.lock();
        let outcome =
            idempotency::resolve_acquire(records.get(key), key, fingerprint, now, lease_ms);
        if let AcquireOutcome::Acquired { lease, .. } = &outcome {
            let record = idempotency::in_flight_record(lease, fingerprint, now, &self.settings);
            records.insert(key.to_string(), record);
        }
        Ok(outcome)
    }

    async fn complete(&self, lease: &Lease, result: Value) -> StoreResult<()> {
        let now = self.now();
        let mut records = self.records.lock();
        idempotency::complete_record(records.get_mut(&lease.key), lease, result, now, &self.settings)
    }

    async fn fail(&self, lease: &Lease, error: ProtectionError) -> StoreResult<()> {
        let now = self.now();
        let mut records = self.records.lock();
        idempotency::fail_record(records.get_mut(&lease.key), lease, error, now, &self.settings)
    }

    async fn release(&self, lease: &Lease) -> StoreResult<()> {
        let mut records = self.records.lock();
        idempotency::ensure_owner(records.get(&lease.key), lease)?;
        records.remove(&lease.key);
        Ok(())
    }

    async fn release_stale(&self, key: &str) -> StoreResult<bool> {
        let now = self.now();
        let mut records = self.records.lock();
        let stale = records.get(key).is_some_and(|record| idempotency::is_stale(record, now));
        if stale {
            records.remove(key);
        }
        Ok(stale)
    }

    async fn get(&self, key: &str) -> StoreResult<Option<IdempotencyRecord>> {
        let now = self.now();
        Ok(self.records.lock().get(key).filter(|record| !record.is_expired(now)).cloned())
    }

    async fn purge_expired(&self) -> StoreResult<usize> {
        let now = self.now();
        let mut records = self.records.lock();
        let before = records.len();
        records.retain(|_, record| !record.is_expired(now));
        Ok(before - records.len())
    }
}
