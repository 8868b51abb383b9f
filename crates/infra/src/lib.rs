//! # Genguard Infrastructure
//!
//! Infrastructure implementations of core ports.
//!
//! This crate contains:
//! - Idempotency stores (in-memory, SQLite through an r2d2 pool)
//! - Configuration loading (TOML/JSON files plus `GENGUARD_*` overrides)
//! - Tracing subscriber setup
//!
//! ## Architecture
//! - Implements traits defined in `genguard-core`
//! - Depends on `genguard-domain` and `genguard-core`
//! - Contains all "impure" code (file system, database, global subscriber)

pub mod config;
pub mod database;
pub mod errors;
pub mod idempotency;
pub mod observability;

use std::sync::Arc;

use genguard_core::IdempotencyStore;
use genguard_domain::{GuardConfig, StorageBackend};
use tracing::info;

// Re-export commonly used items
pub use database::{DbManager, SqliteIdempotencyStore};
pub use errors::{InfraError, InfraResult};
pub use idempotency::InMemoryIdempotencyStore;
pub use observability::init_logging;

/// Build the idempotency store selected by `config.storage`
///
/// The SQLite backend opens (or creates) the database file and applies the
/// schema before returning.
///
/// # Errors
/// Returns `InfraError::Database` if the SQLite database cannot be opened or
/// migrated.
pub fn build_store(config: &GuardConfig) -> InfraResult<Arc<dyn IdempotencyStore>> {
    let settings = config.idempotency.clone();

    match config.storage.backend {
        StorageBackend::Memory => {
            info!(backend = %StorageBackend::Memory, "Using in-memory idempotency store");
            Ok(Arc::new(InMemoryIdempotencyStore::new(settings)))
        }
        StorageBackend::Sqlite => {
            let db = DbManager::new(&config.storage.path, config.storage.pool_size)?;
            db.run_migrations()?;
            info!(
                backend = %StorageBackend::Sqlite,
                path = %config.storage.path,
                "Using SQLite idempotency store"
            );
            Ok(Arc::new(SqliteIdempotencyStore::new(Arc::new(db), settings)))
        }
    }
}
