//! Idempotency record model
//!
//! Timestamps are milliseconds since the UNIX epoch as read from the injected
//! clock, so adapters and tests agree on "now" without touching wall time.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::ProtectionError;
use crate::impl_domain_status_conversions;

/// Lifecycle state of an idempotency record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordState {
    InFlight,
    Completed,
    Failed,
}

impl_domain_status_conversions!(RecordState {
    InFlight => "in_flight",
    Completed => "completed",
    Failed => "failed",
});

/// Stored outcome (or pending ownership) of one logical request
///
/// A record moves `InFlight -> Completed` or `InFlight -> Failed` once. While
/// in flight, `owner` holds the token of the lease that may finish it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub key: String,
    pub state: RecordState,
    /// Success payload, present only when `Completed`
    pub result: Option<serde_json::Value>,
    /// Failure descriptor, present only when `Failed`
    pub error: Option<ProtectionError>,
    /// Fingerprint of the request that created the record
    pub fingerprint: Option<String>,
    /// Lease token of the current owner, present only when `InFlight`
    pub owner: Option<Uuid>,
    pub created_at: i64,
    pub expires_at: i64,
    /// End of the owner's lease, present only when `InFlight`
    pub lease_expires_at: Option<i64>,
}

impl IdempotencyRecord {
    /// New in-flight record owned by `lease`
    ///
    /// The record is retained at least until the lease ends.
    pub fn in_flight(
        lease: &Lease,
        fingerprint: Option<String>,
        now_ms: i64,
        retention_ms: i64,
    ) -> Self {
        Self {
            key: lease.key.clone(),
            state: RecordState::InFlight,
            result: None,
            error: None,
            fingerprint,
            owner: Some(lease.token),
            created_at: now_ms,
            expires_at: now_ms.saturating_add(retention_ms).max(lease.lease_expires_at),
            lease_expires_at: Some(lease.lease_expires_at),
        }
    }

    /// Past its retention window; treated as absent
    pub fn is_expired(&self, now_ms: i64) -> bool {
        now_ms >= self.expires_at
    }

    /// In flight with a lease that ran out; may be re-acquired
    pub fn is_lease_expired(&self, now_ms: i64) -> bool {
        self.state == RecordState::InFlight
            && self.lease_expires_at.is_some_and(|lease_end| now_ms >= lease_end)
    }

    /// Holds a final outcome
    pub fn is_terminal(&self) -> bool {
        matches!(self.state, RecordState::Completed | RecordState::Failed)
    }

    /// Neither expired nor an abandoned lease
    pub fn is_live(&self, now_ms: i64) -> bool {
        !self.is_expired(now_ms) && !self.is_lease_expired(now_ms)
    }

    /// In flight and owned by `token`
    pub fn is_owned_by(&self, token: &Uuid) -> bool {
        self.state == RecordState::InFlight && self.owner.as_ref() == Some(token)
    }

    /// Record the success payload; keeps it for `retention_ms` from `now_ms`
    pub fn mark_completed(&mut self, value: serde_json::Value, now_ms: i64, retention_ms: i64) {
        self.state = RecordState::Completed;
        self.result = Some(value);
        self.error = None;
        self.finish(now_ms, retention_ms);
    }

    /// Record the failure; keeps it for `retention_ms` from `now_ms`
    pub fn mark_failed(&mut self, error: ProtectionError, now_ms: i64, retention_ms: i64) {
        self.state = RecordState::Failed;
        self.result = None;
        self.error = Some(error);
        self.finish(now_ms, retention_ms);
    }

    fn finish(&mut self, now_ms: i64, retention_ms: i64) {
        self.owner = None;
        self.lease_expires_at = None;
        self.expires_at = now_ms.saturating_add(retention_ms);
    }

    pub fn created_at_utc(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis(self.created_at)
    }

    pub fn expires_at_utc(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis(self.expires_at)
    }
}

/// Time-bounded ownership of an in-flight record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub key: String,
    /// Distinguishes this owner from whoever reclaims the key after expiry
    pub token: Uuid,
    pub lease_expires_at: i64,
}

impl Lease {
    pub fn new(key: impl Into<String>, now_ms: i64, lease_timeout_ms: i64) -> Self {
        Self {
            key: key.into(),
            token: Uuid::new_v4(),
            lease_expires_at: now_ms.saturating_add(lease_timeout_ms),
        }
    }
}
