//! Idempotency key ownership
//!
//! [`ports::IdempotencyStore`] is the storage boundary. The functions here
//! are the decision rules shared by every adapter, so the in-memory and
//! SQLite stores agree on expiry, lease takeover and fingerprint checks.
//! Adapters call them while holding their own per-key serialization (a map
//! entry lock, a database transaction).

pub mod ports;

use genguard_common::Clock;
use genguard_domain::{
    IdempotencyConfig, IdempotencyRecord, Lease, ProtectionError, RecordState, StoreError,
    StoreResult,
};
use serde_json::Value;

use self::ports::AcquireOutcome;

/// Current time in the millisecond representation used by records
pub fn now_millis<C: Clock + ?Sized>(clock: &C) -> i64 {
    i64::try_from(clock.millis_since_epoch()).unwrap_or(i64::MAX)
}

/// Decide the outcome of `acquire` given the record currently stored for `key`
///
/// When the outcome is [`AcquireOutcome::Acquired`], the adapter must store
/// a fresh in-flight record built with [`in_flight_record`] in the same
/// critical section. A granted lease lasts `lease_ms`, see
/// [`IdempotencyConfig::lease_ms_for`].
pub fn resolve_acquire(
    existing: Option<&IdempotencyRecord>,
    key: &str,
    fingerprint: Option<&str>,
    now_ms: i64,
    lease_ms: i64,
) -> AcquireOutcome {
    match existing {
        Some(record) if record.is_live(now_ms) => {
            if let (Some(stored), Some(requested)) = (record.fingerprint.as_deref(), fingerprint) {
                if stored != requested {
                    return AcquireOutcome::FingerprintMismatch;
                }
            }
            match record.state {
                RecordState::InFlight => AcquireOutcome::InProgressByOther,
                RecordState::Completed => {
                    AcquireOutcome::AlreadyCompleted(record.result.clone().unwrap_or(Value::Null))
                }
                RecordState::Failed => AcquireOutcome::AlreadyFailed(
                    record.error.clone().unwrap_or_else(|| {
                        ProtectionError::Store(format!("failed record '{key}' has no error"))
                    }),
                ),
            }
        }
        stale => AcquireOutcome::Acquired {
            lease: Lease::new(key, now_ms, lease_ms),
            reclaimed: stale.is_some_and(|record| record.is_lease_expired(now_ms)),
        },
    }
}

/// In-flight record for a freshly granted lease
pub fn in_flight_record(
    lease: &Lease,
    fingerprint: Option<&str>,
    now_ms: i64,
    settings: &IdempotencyConfig,
) -> IdempotencyRecord {
    IdempotencyRecord::in_flight(
        lease,
        fingerprint.map(str::to_string),
        now_ms,
        settings.retention_ms(),
    )
}

/// Fail with [`StoreError::NotOwner`] unless `record` is in flight under `lease`
pub fn ensure_owner(record: Option<&IdempotencyRecord>, lease: &Lease) -> StoreResult<()> {
    match record {
        Some(record) if record.is_owned_by(&lease.token) => Ok(()),
        _ => Err(StoreError::NotOwner { key: lease.key.clone() }),
    }
}

/// Apply `complete` to the stored record
pub fn complete_record(
    record: Option<&mut IdempotencyRecord>,
    lease: &Lease,
    result: Value,
    now_ms: i64,
    settings: &IdempotencyConfig,
) -> StoreResult<()> {
    let record = owned(record, lease)?;
    record.mark_completed(result, now_ms, settings.retention_ms());
    Ok(())
}

/// Apply `fail` to the stored record; failures use the shorter retention
pub fn fail_record(
    record: Option<&mut IdempotencyRecord>,
    lease: &Lease,
    error: ProtectionError,
    now_ms: i64,
    settings: &IdempotencyConfig,
) -> StoreResult<()> {
    let record = owned(record, lease)?;
    record.mark_failed(error, now_ms, settings.failure_retention_ms());
    Ok(())
}

/// Record whose lease or retention ran out
pub fn is_stale(record: &IdempotencyRecord, now_ms: i64) -> bool {
    !record.is_live(now_ms)
}

fn owned<'a>(
    record: Option<&'a mut IdempotencyRecord>,
    lease: &Lease,
) -> StoreResult<&'a mut IdempotencyRecord> {
    match record {
        Some(record) if record.is_owned_by(&lease.token) => Ok(record),
        _ => Err(StoreError::NotOwner { key: lease.key.clone() }),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use genguard_domain::{ConflictReason, ErrorKind};
    use serde_json::json;

    use super::*;

    const LEASE_MS: i64 = 30_000;

    fn settings() -> IdempotencyConfig {
        IdempotencyConfig::default()
    }

    fn acquire_fresh(key: &str, fingerprint: Option<&str>, now: i64) -> (Lease, IdempotencyRecord) {
        match resolve_acquire(None, key, fingerprint, now, LEASE_MS) {
            AcquireOutcome::Acquired { lease, reclaimed } => {
                assert!(!reclaimed);
                let record = in_flight_record(&lease, fingerprint, now, &settings());
                (lease, record)
            }
            other => panic!("expected Acquired, got {other:?}"),
        }
    }

    #[test]
    fn live_in_flight_record_blocks_others() {
        let (_lease, record) = acquire_fresh("abc", None, 0);
        let outcome = resolve_acquire(Some(&record), "abc", None, 1_000, LEASE_MS);
        assert_eq!(outcome, AcquireOutcome::InProgressByOther);
    }

    #[test]
    fn expired_lease_is_reclaimed() {
        let (lease, record) = acquire_fresh("abc", None, 0);
        let outcome = resolve_acquire(Some(&record), "abc", None, 30_000, LEASE_MS);
        match outcome {
            AcquireOutcome::Acquired { lease: next, reclaimed } => {
                assert!(reclaimed);
                assert_ne!(next.token, lease.token);
                assert_eq!(next.lease_expires_at, 60_000);
            }
            other => panic!("expected reclaim, got {other:?}"),
        }
        assert!(is_stale(&record, 30_000));
    }

    #[test]
    fn completed_record_replays_until_retention_ends() {
        let (lease, mut record) = acquire_fresh("abc", None, 0);
        complete_record(Some(&mut record), &lease, json!("R"), 100, &settings())
            .expect("owner completes");

        assert_eq!(
            resolve_acquire(Some(&record), "abc", None, 600_099, LEASE_MS),
            AcquireOutcome::AlreadyCompleted(json!("R"))
        );
        let after = resolve_acquire(Some(&record), "abc", None, 600_100, LEASE_MS);
        assert!(matches!(after, AcquireOutcome::Acquired { reclaimed: false, .. }));
    }

    #[test]
    fn failed_record_uses_failure_retention() {
        let (lease, mut record) = acquire_fresh("abc", None, 0);
        let error = ProtectionError::Downstream {
            kind: ErrorKind::InvalidInput,
            message: "empty prompt".into(),
        };
        fail_record(Some(&mut record), &lease, error.clone(), 0, &settings()).expect("owner fails");

        assert_eq!(
            resolve_acquire(Some(&record), "abc", None, 59_999, LEASE_MS),
            AcquireOutcome::AlreadyFailed(error)
        );
        assert!(resolve_acquire(Some(&record), "abc", None, 60_000, LEASE_MS).is_acquired());
    }

    #[test]
    fn long_hold_keeps_the_key_past_lease_timeout() {
        let lease_ms = settings().lease_ms_for(Duration::from_secs(65));
        let (lease, record) = match resolve_acquire(None, "abc", None, 0, lease_ms) {
            AcquireOutcome::Acquired { lease, .. } => {
                let record = in_flight_record(&lease, None, 0, &settings());
                (lease, record)
            }
            other => panic!("expected Acquired, got {other:?}"),
        };

        assert_eq!(lease.lease_expires_at, 65_000);
        assert_eq!(
            resolve_acquire(Some(&record), "abc", None, 31_000, LEASE_MS),
            AcquireOutcome::InProgressByOther
        );
        assert!(resolve_acquire(Some(&record), "abc", None, 65_000, LEASE_MS).is_acquired());
    }

    #[test]
    fn fingerprint_mismatch_is_reported_only_when_both_sides_have_one() {
        let (_lease, record) = acquire_fresh("abc", Some("aaa"), 0);
        assert_eq!(
            resolve_acquire(Some(&record), "abc", Some("bbb"), 10, LEASE_MS),
            AcquireOutcome::FingerprintMismatch
        );
        assert_eq!(
            resolve_acquire(Some(&record), "abc", None, 10, LEASE_MS),
            AcquireOutcome::InProgressByOther
        );
        assert_eq!(
            resolve_acquire(Some(&record), "abc", Some("aaa"), 10, LEASE_MS),
            AcquireOutcome::InProgressByOther
        );
    }

    #[test]
    fn only_the_owner_may_finish_a_record() {
        let (lease, mut record) = acquire_fresh("abc", None, 0);
        let stranger = Lease::new("abc", 0, 30_000);

        let err = complete_record(Some(&mut record), &stranger, json!(1), 10, &settings())
            .expect_err("stranger must not complete");
        assert_eq!(err, StoreError::NotOwner { key: "abc".into() });
        assert!(ensure_owner(None, &lease).is_err());
        assert!(ensure_owner(Some(&record), &lease).is_ok());

        complete_record(Some(&mut record), &lease, json!(1), 10, &settings()).expect("owner");
        let conflict = ProtectionError::Conflict {
            key: "abc".into(),
            reason: ConflictReason::InFlight,
        };
        assert!(fail_record(Some(&mut record), &lease, conflict, 20, &settings()).is_err());
        assert_eq!(record.state, RecordState::Completed);
    }
}
