//! Logging setup
//!
//! Library code only emits `tracing` events; binaries and integration tests
//! call [`init_logging`] once to install a subscriber.

pub mod logging;

pub use logging::init_logging;
