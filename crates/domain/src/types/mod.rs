//! Domain types and models

pub mod idempotency;

pub use idempotency::{IdempotencyRecord, Lease, RecordState};
