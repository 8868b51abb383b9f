//! Shared test helpers for `genguard-core` integration tests.
//!
//! These helpers provide lightweight fakes so that service tests can focus on
//! behaviour instead of storage plumbing.

pub mod store;
