//! Configuration loading
//!
//! Reads [`GuardConfig`](genguard_domain::GuardConfig) from a TOML or JSON
//! file, layers `GENGUARD_*` environment overrides on top and validates the
//! result.

pub mod loader;

// Re-export commonly used items
pub use loader::{load, load_from_env, load_from_file, probe_config_paths};
