//! # Genguard Domain
//!
//! Pure data for the resilience core: idempotency records and leases, the
//! classified error taxonomy, retry policy and configuration structures.
//!
//! ## Architecture
//! - Depends only on `genguard-common` (foundation tier) for error
//!   classification and serde helpers
//! - No I/O, no async runtime

pub mod config;
pub mod constants;
pub mod errors;
pub mod macros;
pub mod types;

// Re-export commonly used items
pub use config::*;
pub use errors::*;
pub use types::*;
