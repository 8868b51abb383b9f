//! # Genguard Core
//!
//! Resilience services with no infrastructure dependencies.
//!
//! This crate contains:
//! - The idempotency store port and the acquire/complete rules every adapter
//!   shares
//! - Request fingerprinting
//! - The protected-call service composing idempotency, circuit breaking,
//!   retry and a timeout budget
//!
//! ## Architecture Principles
//! - Only depends on `genguard-common` and `genguard-domain`
//! - No database or platform code
//! - Storage is reached through the [`IdempotencyStore`] trait
//! - Breakers, stores and clocks are passed in explicitly, never global

pub mod fingerprint;
pub mod idempotency;
pub mod protection;

pub use fingerprint::fingerprint_json;
pub use idempotency::ports::{AcquireOutcome, IdempotencyStore};
pub use protection::{
    CallOutcome, CallRequest, KindCondition, Operation, ProtectedCall, ProtectedResource,
};
