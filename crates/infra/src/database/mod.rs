//! Database implementations

pub mod idempotency_repository;
pub mod manager;

pub use idempotency_repository::*;
pub use manager::*;
