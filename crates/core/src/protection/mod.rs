//! Protected downstream calls
//!
//! [`ProtectedCall`] runs an [`Operation`] against a [`ProtectedResource`]
//! with idempotency-key deduplication, circuit breaking, bounded retry and a
//! timeout budget.

pub mod operation;
pub mod resource;
pub mod service;

pub use operation::Operation;
pub use resource::{breaker_config, retry_config, KindCondition, ProtectedResource};
pub use service::{CallOutcome, CallRequest, ProtectedCall};
