//! SQLite-backed implementation of the idempotency store port.
//!
//! Every operation runs on the blocking pool inside a `BEGIN IMMEDIATE`
//! transaction, so the read-decide-write of `acquire` holds the database
//! write lock and concurrent callers (in this process or another one sharing
//! the file) serialize on it.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use genguard_common::{Clock, SystemClock};
use genguard_core::idempotency::ports::{AcquireOutcome, IdempotencyStore};
use genguard_core::idempotency::{
    complete_record, ensure_owner, fail_record, in_flight_record, is_stale, now_millis,
    resolve_acquire,
};
use genguard_domain::{
    IdempotencyConfig, IdempotencyRecord, Lease, ProtectionError, RecordState, StoreError,
    StoreResult,
};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use serde_json::Value;
use tokio::task;
use tracing::debug;
use uuid::Uuid;

use super::manager::DbManager;
use crate::errors::InfraError;

/// SQLite-backed idempotency store.
pub struct SqliteIdempotencyStore<C: Clock = SystemClock> {
    db: Arc<DbManager>,
    settings: IdempotencyConfig,
    clock: C,
}

impl SqliteIdempotencyStore<SystemClock> {
    /// Construct a store backed by the shared database manager.
    ///
    /// The schema must already exist; see [`DbManager::run_migrations`].
    pub fn new(db: Arc<DbManager>, settings: IdempotencyConfig) -> Self {
        Self::with_clock(db, settings, SystemClock)
    }
}

impl<C: Clock> SqliteIdempotencyStore<C> {
    pub fn with_clock(db: Arc<DbManager>, settings: IdempotencyConfig, clock: C) -> Self {
        Self { db, settings, clock }
    }

    fn now(&self) -> i64 {
        now_millis(&self.clock)
    }

    /// Run `work` on the blocking pool inside an immediate transaction
    async fn in_transaction<T, F>(&self, work: F) -> StoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> StoreResult<T> + Send + 'static,
    {
        let db = Arc::clone(&self.db);

        task::spawn_blocking(move || -> StoreResult<T> {
            let mut conn = db.get_connection()?;
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(InfraError::from)?;
            let value = work(&tx)?;
            tx.commit().map_err(InfraError::from)?;
            Ok(value)
        })
        .await
        .map_err(InfraError::from)?
    }
}

#[async_trait]
impl<C: Clock> IdempotencyStore for SqliteIdempotencyStore<C> {
    async fn acquire_with_lease(
        &self,
        key: &str,
        fingerprint: Option<&str>,
        min_lease: Duration,
    ) -> StoreResult<AcquireOutcome> {
        let settings = self.settings.clone();
        let lease_ms = settings.lease_ms_for(min_lease);
        let key = key.to_string();
        let fingerprint = fingerprint.map(str::to_string);
        let now = self.now();

        self.in_transaction(move |conn| {
            let existing = select_record(conn, &key)?;
            let outcome =
                resolve_acquire(existing.as_ref(), &key, fingerprint.as_deref(), now, lease_ms);
            if let AcquireOutcome::Acquired { lease, .. } = &outcome {
                let record = in_flight_record(lease, fingerprint.as_deref(), now, &settings);
                upsert_record(conn, &record)?;
            }
            Ok(outcome)
        })
        .await
    }

    async fn complete(&self, lease: &Lease, result: Value) -> StoreResult<()> {
        let settings = self.settings.clone();
        let lease = lease.clone();
        let now = self.now();

        self.in_transaction(move |conn| {
            let mut record = select_record(conn, &lease.key)?;
            complete_record(record.as_mut(), &lease, result, now, &settings)?;
            write_back(conn, record)
        })
        .await
    }

    async fn fail(&self, lease: &Lease, error: ProtectionError) -> StoreResult<()> {
        let settings = self.settings.clone();
        let lease = lease.clone();
        let now = self.now();

        self.in_transaction(move |conn| {
            let mut record = select_record(conn, &lease.key)?;
            fail_record(record.as_mut(), &lease, error, now, &settings)?;
            write_back(conn, record)
        })
        .await
    }

    async fn release(&self, lease: &Lease) -> StoreResult<()> {
        let lease = lease.clone();

        self.in_transaction(move |conn| {
            let record = select_record(conn, &lease.key)?;
            ensure_owner(record.as_ref(), &lease)?;
            delete_record(conn, &lease.key)?;
            Ok(())
        })
        .await
    }

    async fn release_stale(&self, key: &str) -> StoreResult<bool> {
        let key = key.to_string();
        let now = self.now();

        self.in_transaction(move |conn| {
            let stale = select_record(conn, &key)?.is_some_and(|record| is_stale(&record, now));
            if stale {
                delete_record(conn, &key)?;
                debug!(key = %key, "Released stale idempotency record");
            }
            Ok(stale)
        })
        .await
    }

    async fn get(&self, key: &str) -> StoreResult<Option<IdempotencyRecord>> {
        let key = key.to_string();
        let now = self.now();

        self.in_transaction(move |conn| {
            Ok(select_record(conn, &key)?.filter(|record| !record.is_expired(now)))
        })
        .await
    }

    async fn purge_expired(&self) -> StoreResult<usize> {
        let now = self.now();

        self.in_transaction(move |conn| {
            let purged = conn.execute(PURGE_SQL, params![now]).map_err(InfraError::from)?;
            if purged > 0 {
                debug!(purged, "Purged expired idempotency records");
            }
            Ok(purged)
        })
        .await
    }
}

/// Row as stored, before decoding the JSON and enum columns
struct RecordRow {
    key: String,
    state: String,
    result_json: Option<String>,
    error_json: Option<String>,
    fingerprint: Option<String>,
    owner: Option<String>,
    created_at: i64,
    expires_at: i64,
    lease_expires_at: Option<i64>,
}

impl RecordRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            key: row.get(0)?,
            state: row.get(1)?,
            result_json: row.get(2)?,
            error_json: row.get(3)?,
            fingerprint: row.get(4)?,
            owner: row.get(5)?,
            created_at: row.get(6)?,
            expires_at: row.get(7)?,
            lease_expires_at: row.get(8)?,
        })
    }

    fn into_record(self) -> StoreResult<IdempotencyRecord> {
        let state = RecordState::from_str(&self.state).map_err(StoreError::Serialization)?;
        let result = self.result_json.as_deref().map(serde_json::from_str).transpose()?;
        let error = self.error_json.as_deref().map(serde_json::from_str).transpose()?;
        let owner = self
            .owner
            .as_deref()
            .map(Uuid::parse_str)
            .transpose()
            .map_err(|err| StoreError::Serialization(format!("invalid lease owner: {err}")))?;

        Ok(IdempotencyRecord {
            key: self.key,
            state,
            result,
            error,
            fingerprint: self.fingerprint,
            owner,
            created_at: self.created_at,
            expires_at: self.expires_at,
            lease_expires_at: self.lease_expires_at,
        })
    }
}

fn select_record(conn: &Connection, key: &str) -> StoreResult<Option<IdempotencyRecord>> {
    conn.query_row(SELECT_SQL, params![key], RecordRow::from_row)
        .optional()
        .map_err(InfraError::from)?
        .map(RecordRow::into_record)
        .transpose()
}

fn upsert_record(conn: &Connection, record: &IdempotencyRecord) -> StoreResult<()> {
    let result_json = record.result.as_ref().map(serde_json::to_string).transpose()?;
    let error_json = record.error.as_ref().map(serde_json::to_string).transpose()?;
    let owner = record.owner.map(|token| token.to_string());

    conn.execute(
        UPSERT_SQL,
        params![
            record.key,
            record.state.to_string(),
            result_json,
            error_json,
            record.fingerprint,
            owner,
            record.created_at,
            record.expires_at,
            record.lease_expires_at,
        ],
    )
    .map_err(InfraError::from)?;
    Ok(())
}

fn write_back(conn: &Connection, record: Option<IdempotencyRecord>) -> StoreResult<()> {
    match record {
        Some(record) => upsert_record(conn, &record),
        None => Ok(()),
    }
}

fn delete_record(conn: &Connection, key: &str) -> StoreResult<()> {
    conn.execute("DELETE FROM idempotency_records WHERE key = ?1", params![key])
        .map_err(InfraError::from)?;
    Ok(())
}

const SELECT_SQL: &str = "SELECT
        key, state, result_json, error_json, fingerprint, owner,
        created_at, expires_at, lease_expires_at
    FROM idempotency_records
    WHERE key = ?1";

const UPSERT_SQL: &str = "INSERT OR REPLACE INTO idempotency_records (
        key, state, result_json, error_json, fingerprint, owner,
        created_at, expires_at, lease_expires_at
    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)";

const PURGE_SQL: &str = "DELETE FROM idempotency_records WHERE expires_at <= ?1";

#[cfg(test)]
mod tests {
    use genguard_common::MockClock;
    use genguard_domain::ErrorKind;
    use serde_json::json;
    use tempfile::TempDir;

    use super::*;

    fn open(dir: &TempDir, clock: MockClock) -> SqliteIdempotencyStore<MockClock> {
        let db = DbManager::new(dir.path().join("guard.db"), 2).expect("manager created");
        db.run_migrations().expect("migrations run");
        SqliteIdempotencyStore::with_clock(Arc::new(db), IdempotencyConfig::default(), clock)
    }

    fn lease_of(outcome: AcquireOutcome) -> Lease {
        match outcome {
            AcquireOutcome::Acquired { lease, .. } => lease,
            other => panic!("expected Acquired, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn records_round_trip_through_sqlite() {
        let dir = TempDir::new().expect("temp dir");
        let clock = MockClock::new();
        let store = open(&dir, clock.clone());

        let lease = lease_of(store.acquire("abc", Some("fp-1")).await.expect("acquire"));
        let in_flight = store.get("abc").await.expect("get").expect("record exists");
        assert_eq!(in_flight.state, RecordState::InFlight);
        assert_eq!(in_flight.owner, Some(lease.token));
        assert_eq!(in_flight.fingerprint.as_deref(), Some("fp-1"));
        assert_eq!(in_flight.lease_expires_at, Some(30_000));

        clock.advance_millis(250);
        store.complete(&lease, json!({"text": "hello"})).await.expect("complete");

        let done = store.get("abc").await.expect("get").expect("record exists");
        assert_eq!(done.state, RecordState::Completed);
        assert_eq!(done.result, Some(json!({"text": "hello"})));
        assert_eq!(done.owner, None);
        assert_eq!(done.expires_at, 600_250);
        assert_eq!(
            store.acquire("abc", Some("fp-1")).await.expect("acquire"),
            AcquireOutcome::AlreadyCompleted(json!({"text": "hello"}))
        );
    }

    #[tokio::test]
    async fn failed_records_keep_their_error() {
        let dir = TempDir::new().expect("temp dir");
        let store = open(&dir, MockClock::new());

        let lease = lease_of(store.acquire("bad", None).await.expect("acquire"));
        let error = ProtectionError::Downstream {
            kind: ErrorKind::InvalidInput,
            message: "prompt is empty".into(),
        };
        store.fail(&lease, error.clone()).await.expect("fail");

        assert_eq!(
            store.acquire("bad", None).await.expect("acquire"),
            AcquireOutcome::AlreadyFailed(error)
        );
    }

    #[tokio::test]
    async fn purge_and_release_stale_remove_rows() {
        let dir = TempDir::new().expect("temp dir");
        let clock = MockClock::new();
        let store = open(&dir, clock.clone());

        let done = lease_of(store.acquire("done", None).await.expect("acquire"));
        store.complete(&done, json!(1)).await.expect("complete");
        store.acquire("orphan", None).await.expect("acquire");

        assert!(!store.release_stale("orphan").await.expect("release_stale"));
        clock.advance_millis(30_000);
        assert!(store.release_stale("orphan").await.expect("release_stale"));
        assert!(store.get("orphan").await.expect("get").is_none());

        assert_eq!(store.purge_expired().await.expect("purge"), 0);
        clock.advance_millis(600_000);
        assert_eq!(store.purge_expired().await.expect("purge"), 1);
    }

    #[tokio::test]
    async fn release_requires_the_lease() {
        let dir = TempDir::new().expect("temp dir");
        let store = open(&dir, MockClock::new());

        let lease = lease_of(store.acquire("k", None).await.expect("acquire"));
        let stranger = Lease::new("k", 0, 30_000);
        assert_eq!(
            store.release(&stranger).await,
            Err(StoreError::NotOwner { key: "k".into() })
        );
        store.release(&lease).await.expect("owner releases");
        assert!(store.get("k").await.expect("get").is_none());
    }
}
