//! Idempotency store adapters
//!
//! - [`InMemoryIdempotencyStore`]: process-local, for tests and single-node
//!   deployments that can lose records on restart
//! - [`SqliteIdempotencyStore`](crate::database::SqliteIdempotencyStore):
//!   durable, shared by every process that opens the same file

pub mod memory;

pub use memory::InMemoryIdempotencyStore;
