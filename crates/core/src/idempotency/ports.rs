//! Port interface for idempotency storage
//!
//! Adapters live in `genguard-infra`. Every adapter must make [`acquire`]
//! atomic per key: two concurrent callers never both receive
//! [`AcquireOutcome::Acquired`].
//!
//! [`acquire`]: IdempotencyStore::acquire

use std::time::Duration;

use async_trait::async_trait;
use genguard_domain::{IdempotencyRecord, Lease, ProtectionError, StoreResult};
use serde_json::Value;

/// Result of trying to take ownership of an idempotency key
#[derive(Debug, Clone, PartialEq)]
pub enum AcquireOutcome {
    /// The caller now owns the key and must finish it with `complete`,
    /// `fail` or `release`
    Acquired {
        lease: Lease,
        /// An abandoned in-flight record was taken over
        reclaimed: bool,
    },
    /// A cached success exists for the key
    AlreadyCompleted(Value),
    /// A cached failure exists for the key
    AlreadyFailed(ProtectionError),
    /// Another caller holds a live lease on the key
    InProgressByOther,
    /// A live record exists for the key with a different request fingerprint
    FingerprintMismatch,
}

impl AcquireOutcome {
    pub fn is_acquired(&self) -> bool {
        matches!(self, Self::Acquired { .. })
    }
}

/// Keyed store of idempotency records
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Atomically create an in-flight record for `key`, or report what
    /// already exists
    ///
    /// Expired records and in-flight records whose lease ran out are
    /// treated as absent. A granted lease lasts the configured lease timeout.
    async fn acquire(&self, key: &str, fingerprint: Option<&str>) -> StoreResult<AcquireOutcome> {
        self.acquire_with_lease(key, fingerprint, Duration::ZERO).await
    }

    /// Like [`acquire`](Self::acquire), but a granted lease lasts at least
    /// `min_lease`
    async fn acquire_with_lease(
        &self,
        key: &str,
        fingerprint: Option<&str>,
        min_lease: Duration,
    ) -> StoreResult<AcquireOutcome>;

    /// Cache the success payload; requires ownership of `lease`
    async fn complete(&self, lease: &Lease, result: Value) -> StoreResult<()>;

    /// Cache the failure; requires ownership of `lease`
    async fn fail(&self, lease: &Lease, error: ProtectionError) -> StoreResult<()>;

    /// Drop the in-flight record without caching an outcome; requires
    /// ownership of `lease`
    async fn release(&self, lease: &Lease) -> StoreResult<()>;

    /// Remove the record for `key` if its lease or retention ran out
    ///
    /// Returns `true` when a record was removed.
    async fn release_stale(&self, key: &str) -> StoreResult<bool>;

    /// Unexpired record for `key`, if any
    async fn get(&self, key: &str) -> StoreResult<Option<IdempotencyRecord>>;

    /// Delete every expired record, returning how many were removed
    async fn purge_expired(&self) -> StoreResult<usize>;
}
