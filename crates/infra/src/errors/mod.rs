//! Infrastructure error type
//!
//! Adapter failures are collected in [`InfraError`] and converted to the
//! domain's [`StoreError`](genguard_domain::StoreError) at the port boundary.

mod conversions;

use genguard_common::{ErrorClassification, ErrorSeverity};
use thiserror::Error;

/// Errors raised by infrastructure code
#[derive(Debug, Error)]
pub enum InfraError {
    /// SQLite or pool failure
    #[error("Database error: {0}")]
    Database(String),

    /// SQLite reported contention that a later attempt may not see
    #[error("Database busy: {0}")]
    Busy(String),

    /// Configuration could not be read, parsed or validated
    #[error("Configuration error: {0}")]
    Config(String),

    /// The tracing subscriber could not be installed
    #[error("Logging error: {0}")]
    Logging(String),

    /// A blocking worker panicked or was cancelled
    #[error("Background task failed: {0}")]
    Task(String),
}

impl ErrorClassification for InfraError {
    fn is_retryable(&self) -> bool {
        matches!(self, Self::Busy(_) | Self::Task(_))
    }

    fn severity(&self) -> ErrorSeverity {
        match self {
            Self::Busy(_) => ErrorSeverity::Warning,
            Self::Database(_) | Self::Task(_) => ErrorSeverity::Error,
            Self::Config(_) | Self::Logging(_) => ErrorSeverity::Critical,
        }
    }
}

/// Result type alias for infrastructure operations
pub type InfraResult<T> = std::result::Result<T, InfraError>;
