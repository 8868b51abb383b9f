//! SQLite store durability and end-to-end protected calls
//!
//! The store is the only state shared between processes, so these tests
//! open several pools on one database file to stand in for restarts and
//! sibling gateway instances.

mod support;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use genguard_common::{MockClock, NoopEventSink, SystemClock};
use genguard_core::{
    AcquireOutcome, CallRequest, IdempotencyStore, ProtectedCall, ProtectedResource,
};
use genguard_domain::{
    DownstreamError, ErrorKind, GuardConfig, IdempotencyConfig, ProtectionError, StorageBackend,
};
use genguard_infra::{build_store, SqliteIdempotencyStore};
use serde::{Deserialize, Serialize};
use serde_json::json;
use support::TestDatabase;
use tempfile::TempDir;
use tokio::sync::Barrier;

const BUDGET: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Completion {
    text: String,
    tokens: u32,
}

fn sqlite_config(dir: &TempDir) -> GuardConfig {
    let mut config = GuardConfig::default();
    config.storage.backend = StorageBackend::Sqlite;
    config.storage.path = dir.path().join("gateway.db").to_string_lossy().into_owned();
    config.retry.jitter = false;
    config
}

fn resource(config: &GuardConfig) -> ProtectedResource<SystemClock> {
    ProtectedResource::from_config("llm", config, SystemClock, Arc::new(NoopEventSink))
        .expect("default policies are valid")
}

#[tokio::test]
async fn completed_record_survives_reopen() -> Result<()> {
    let db = TestDatabase::new();
    let clock = MockClock::new();
    let settings = IdempotencyConfig::default();

    let first = SqliteIdempotencyStore::with_clock(
        Arc::clone(&db.manager),
        settings.clone(),
        clock.clone(),
    );
    let lease = match first.acquire("abc", Some("fp")).await? {
        AcquireOutcome::Acquired { lease, .. } => lease,
        other => panic!("expected Acquired, got {other:?}"),
    };
    first.complete(&lease, json!({"text": "R"})).await?;
    drop(first);

    let reopened = SqliteIdempotencyStore::with_clock(db.reopen(), settings, clock);
    assert_eq!(
        reopened.acquire("abc", Some("fp")).await?,
        AcquireOutcome::AlreadyCompleted(json!({"text": "R"}))
    );
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pools_on_one_file_share_key_ownership() -> Result<()> {
    const CALLERS: usize = 12;

    let db = TestDatabase::new();
    let clock = MockClock::new();
    let stores: [Arc<dyn IdempotencyStore>; 2] = [
        Arc::new(SqliteIdempotencyStore::with_clock(
            Arc::clone(&db.manager),
            IdempotencyConfig::default(),
            clock.clone(),
        )),
        Arc::new(SqliteIdempotencyStore::with_clock(
            db.reopen(),
            IdempotencyConfig::default(),
            clock.clone(),
        )),
    ];
    let barrier = Arc::new(Barrier::new(CALLERS));

    let handles: Vec<_> = (0..CALLERS)
        .map(|i| {
            let store = Arc::clone(&stores[i % 2]);
            let barrier = Arc::clone(&barrier);
            tokio::spawn(async move {
                barrier.wait().await;
                store.acquire("shared", None).await
            })
        })
        .collect();

    let mut winners = 0;
    for handle in handles {
        if handle.await??.is_acquired() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);
    Ok(())
}

#[tokio::test]
async fn protected_call_replays_across_restart() -> Result<()> {
    let dir = TempDir::new()?;
    let config = sqlite_config(&dir);
    let calls = Arc::new(AtomicU32::new(0));
    let op = {
        let calls = Arc::clone(&calls);
        move || {
            let calls = Arc::clone(&calls);
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, DownstreamError>(Completion { text: format!("answer {n}"), tokens: 7 })
            }
        }
    };
    let request = CallRequest::keyed("req-1", BUDGET).with_fingerprint("body-hash");
    let expected = Completion { text: "answer 0".into(), tokens: 7 };

    let service = ProtectedCall::from_config(build_store(&config)?, &config.idempotency);
    let first = service.call_tracked(&request, &resource(&config), op.clone()).await?;
    assert_eq!(first.value, expected);
    assert!(!first.replayed);

    // new store, new breaker: only the database file is shared
    let restarted = ProtectedCall::from_config(build_store(&config)?, &config.idempotency);
    let replay = restarted.call_tracked(&request, &resource(&config), op.clone()).await?;
    assert_eq!(replay.value, expected);
    assert!(replay.replayed);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let changed_body = CallRequest::keyed("req-1", BUDGET).with_fingerprint("other");
    let conflict = restarted.call(&changed_body, &resource(&config), op).await;
    assert!(matches!(conflict, Err(ProtectionError::Conflict { .. })));
    Ok(())
}

#[tokio::test]
async fn non_retryable_failure_is_cached_in_sqlite() -> Result<()> {
    let dir = TempDir::new()?;
    let config = sqlite_config(&dir);
    let service = ProtectedCall::from_config(build_store(&config)?, &config.idempotency);
    let resource = resource(&config);
    let calls = Arc::new(AtomicU32::new(0));
    let op = {
        let calls = Arc::clone(&calls);
        move || {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<Completion, _>(DownstreamError::invalid_input("prompt too long"))
            }
        }
    };
    let request = CallRequest::keyed("req-2", BUDGET);

    let first = service.call(&request, &resource, op.clone()).await;
    let second = service.call(&request, &resource, op).await;

    let expected = ProtectionError::Downstream {
        kind: ErrorKind::InvalidInput,
        message: "prompt too long".into(),
    };
    assert_eq!(first, Err(expected.clone()));
    assert_eq!(second, Err(expected));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let record = service.store().get("req-2").await?.expect("failure is cached");
    assert!(record.error.is_some());
    Ok(())
}

#[tokio::test]
async fn memory_backend_is_the_default() -> Result<()> {
    let store = build_store(&GuardConfig::default())?;
    assert!(store.acquire("k", None).await?.is_acquired());
    assert!(store.get("k").await?.is_some());
    Ok(())
}
