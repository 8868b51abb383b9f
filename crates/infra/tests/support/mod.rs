//! Shared fixtures for infra integration tests

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use genguard_common::MockClock;
use genguard_core::IdempotencyStore;
use genguard_domain::IdempotencyConfig;
use genguard_infra::{DbManager, InMemoryIdempotencyStore, SqliteIdempotencyStore};
use tempfile::TempDir;

/// Temporary SQLite database that keeps its directory alive for the test.
pub struct TestDatabase {
    pub manager: Arc<DbManager>,
    temp_dir: TempDir,
}

impl TestDatabase {
    /// Create a new temporary database with the schema applied.
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("temp dir should be created");
        let manager = open_manager(&temp_dir.path().join("guard.db"));
        Self { manager, temp_dir }
    }

    pub fn path(&self) -> PathBuf {
        self.temp_dir.path().join("guard.db")
    }

    /// A second pool on the same file, as another process would open it.
    pub fn reopen(&self) -> Arc<DbManager> {
        open_manager(&self.path())
    }
}

fn open_manager(path: &Path) -> Arc<DbManager> {
    let manager = DbManager::new(path, 4).expect("db manager should be created");
    manager.run_migrations().expect("schema migrations should apply");
    Arc::new(manager)
}

#[derive(Debug, Clone, Copy)]
pub enum Backend {
    Memory,
    Sqlite,
}

pub const BACKENDS: [Backend; 2] = [Backend::Memory, Backend::Sqlite];

/// Store under test plus whatever must outlive it.
pub struct StoreFixture {
    pub store: Arc<dyn IdempotencyStore>,
    pub clock: MockClock,
    _db: Option<TestDatabase>,
}

impl StoreFixture {
    pub fn open(backend: Backend) -> Self {
        Self::with_settings(backend, IdempotencyConfig::default())
    }

    pub fn with_settings(backend: Backend, settings: IdempotencyConfig) -> Self {
        let clock = MockClock::new();
        match backend {
            Backend::Memory => Self {
                store: Arc::new(InMemoryIdempotencyStore::with_clock(settings, clock.clone())),
                clock,
                _db: None,
            },
            Backend::Sqlite => {
                let db = TestDatabase::new();
                let store = SqliteIdempotencyStore::with_clock(
                    Arc::clone(&db.manager),
                    settings,
                    clock.clone(),
                );
                Self { store: Arc::new(store), clock, _db: Some(db) }
            }
        }
    }
}
