//! Shared error classification for Genguard crates.
//!
//! Every public error type in the workspace implements
//! [`ErrorClassification`], so retry decisions, log levels and alerting can be
//! driven from one interface instead of matching on concrete variants.
//!
//! | Level | Use Case | Examples |
//! |-------|----------|----------|
//! | **Info** | Expected conditions | Idempotent replay, missing record |
//! | **Warning** | Degraded but operational | Breaker open, timeouts, key contention |
//! | **Error** | Failure requiring attention | Downstream rejected request, storage fault |
//! | **Critical** | System integrity at risk | Lease ownership violated |

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Trait for classifying errors by their characteristics
pub trait ErrorClassification {
    /// Check if this error is retryable
    ///
    /// Retryable errors are transient issues that may succeed if attempted
    /// again (timeouts, throttling, temporary unavailability).
    fn is_retryable(&self) -> bool;

    /// Get the error severity level
    fn severity(&self) -> ErrorSeverity;

    /// Check if this is a critical error requiring immediate attention
    fn is_critical(&self) -> bool {
        self.severity() == ErrorSeverity::Critical
    }

    /// Get the suggested retry delay if applicable
    fn retry_after(&self) -> Option<Duration> {
        None
    }
}

/// Error severity levels for monitoring and alerting
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorSeverity {
    /// Informational, typically for debugging
    Info,
    /// Warning, should be monitored but not critical
    Warning,
    /// Error, requires attention and action
    Error,
    /// Critical, immediate action required
    Critical,
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Info => write!(f, "INFO"),
            Self::Warning => write!(f, "WARN"),
            Self::Error => write!(f, "ERROR"),
            Self::Critical => write!(f, "CRITICAL"),
        }
    }
}

/// Configuration validation error returned by builders and `validate()`
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// A field holds a value outside its allowed range
    #[error("Invalid configuration for '{field}': {message}")]
    Invalid { field: &'static str, message: String },
}

impl ConfigError {
    /// Shorthand for [`ConfigError::Invalid`]
    pub fn invalid(field: &'static str, message: impl Into<String>) -> Self {
        Self::Invalid { field, message: message.into() }
    }
}

impl ErrorClassification for ConfigError {
    fn is_retryable(&self) -> bool {
        false
    }

    fn severity(&self) -> ErrorSeverity {
        ErrorSeverity::Error
    }
}

/// Configuration result type
pub type ConfigResult<T> = Result<T, ConfigError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_display_and_ordering() {
        assert_eq!(ErrorSeverity::Info.to_string(), "INFO");
        assert_eq!(ErrorSeverity::Warning.to_string(), "WARN");
        assert_eq!(ErrorSeverity::Critical.to_string(), "CRITICAL");
        assert!(ErrorSeverity::Info < ErrorSeverity::Warning);
        assert!(ErrorSeverity::Error < ErrorSeverity::Critical);
    }

    #[test]
    fn config_error_names_the_field() {
        let err = ConfigError::invalid("failure_threshold", "must be greater than 0");
        let text = err.to_string();
        assert!(text.contains("failure_threshold"));
        assert!(text.contains("greater than 0"));
        assert!(!err.is_retryable());
        assert!(!err.is_critical());
        assert_eq!(err.retry_after(), None);
    }
}
