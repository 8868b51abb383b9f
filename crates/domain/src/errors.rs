//! Error types used throughout Genguard
//!
//! [`ProtectionError`] is what callers of the protected-call service see.
//! [`StoreError`] is returned by idempotency store adapters.

use std::collections::BTreeSet;
use std::time::Duration;

use genguard_common::{ErrorClassification, ErrorSeverity};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::impl_domain_status_conversions;

/// Classification of a downstream failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Temporary fault, likely to succeed on retry
    Transient,
    /// Resource temporarily unavailable (503-style)
    Unavailable,
    /// Throttled by the downstream
    RateLimited,
    /// The downstream did not answer in time
    Timeout,
    /// The request itself is invalid
    InvalidInput,
    /// Credentials rejected
    Unauthorized,
    /// Unexpected downstream failure
    Internal,
}

impl_domain_status_conversions!(ErrorKind {
    Transient => "transient",
    Unavailable => "unavailable",
    RateLimited => "rate_limited",
    Timeout => "timeout",
    InvalidInput => "invalid_input",
    Unauthorized => "unauthorized",
    Internal => "internal",
});

impl ErrorKind {
    /// Kinds retried when no explicit set is configured
    pub fn default_retryable() -> BTreeSet<ErrorKind> {
        [ErrorKind::Transient, ErrorKind::Unavailable, ErrorKind::RateLimited]
            .into_iter()
            .collect()
    }
}

/// Failure reported by a protected downstream operation
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct DownstreamError {
    pub kind: ErrorKind,
    pub message: String,
}

impl DownstreamError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transient, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unavailable, message)
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidInput, message)
    }
}

impl ErrorClassification for DownstreamError {
    fn is_retryable(&self) -> bool {
        ErrorKind::default_retryable().contains(&self.kind)
    }

    fn severity(&self) -> ErrorSeverity {
        match self.kind {
            ErrorKind::InvalidInput | ErrorKind::Unauthorized => ErrorSeverity::Info,
            ErrorKind::Transient | ErrorKind::RateLimited | ErrorKind::Timeout => {
                ErrorSeverity::Warning
            }
            ErrorKind::Unavailable | ErrorKind::Internal => ErrorSeverity::Error,
        }
    }
}

/// Why an idempotency key could not be served
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictReason {
    /// Another caller owns the key and the wait policy gave up
    InFlight,
    /// The key was reused with a different request body
    FingerprintMismatch,
}

impl_domain_status_conversions!(ConflictReason {
    InFlight => "in_flight",
    FingerprintMismatch => "fingerprint_mismatch",
});

/// Classified error returned by a protected call
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "detail", rename_all = "snake_case")]
pub enum ProtectionError {
    #[error("Circuit breaker open for resource '{resource}'")]
    BreakerOpen { resource: String },

    #[error("Call exceeded its budget of {budget_ms} ms")]
    Timeout { budget_ms: u64 },

    #[error("Downstream error ({kind}): {message}")]
    Downstream { kind: ErrorKind, message: String },

    #[error("Idempotency conflict for key '{key}': {reason}")]
    Conflict { key: String, reason: ConflictReason },

    #[error("Idempotency store error: {0}")]
    Store(String),
}

impl ProtectionError {
    /// Stable snake_case code, suitable for API responses
    pub fn code(&self) -> &'static str {
        match self {
            Self::BreakerOpen { .. } => "breaker_open",
            Self::Timeout { .. } => "timeout",
            Self::Downstream { .. } => "downstream",
            Self::Conflict { .. } => "conflict",
            Self::Store(_) => "store",
        }
    }

    pub fn timeout(budget: Duration) -> Self {
        Self::Timeout { budget_ms: u64::try_from(budget.as_millis()).unwrap_or(u64::MAX) }
    }
}

impl From<DownstreamError> for ProtectionError {
    fn from(error: DownstreamError) -> Self {
        Self::Downstream { kind: error.kind, message: error.message }
    }
}

impl From<StoreError> for ProtectionError {
    fn from(error: StoreError) -> Self {
        Self::Store(error.to_string())
    }
}

impl ErrorClassification for ProtectionError {
    fn is_retryable(&self) -> bool {
        match self {
            Self::BreakerOpen { .. } | Self::Timeout { .. } | Self::Store(_) => true,
            Self::Downstream { kind, .. } => ErrorKind::default_retryable().contains(kind),
            Self::Conflict { reason, .. } => *reason == ConflictReason::InFlight,
        }
    }

    fn severity(&self) -> ErrorSeverity {
        match self {
            Self::Conflict { .. } => ErrorSeverity::Info,
            Self::BreakerOpen { .. } | Self::Timeout { .. } => ErrorSeverity::Warning,
            Self::Downstream { .. } | Self::Store(_) => ErrorSeverity::Error,
        }
    }
}

/// Errors returned by idempotency store adapters
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// `complete`/`fail`/`release` called without owning the in-flight record
    #[error("Lease for key '{key}' is not held by this caller")]
    NotOwner { key: String },

    #[error("No idempotency record for key '{key}'")]
    NotFound { key: String },

    #[error("Storage backend error: {0}")]
    Backend(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(error: serde_json::Error) -> Self {
        Self::Serialization(error.to_string())
    }
}

impl ErrorClassification for StoreError {
    fn is_retryable(&self) -> bool {
        matches!(self, Self::Backend(_))
    }

    fn severity(&self) -> ErrorSeverity {
        match self {
            Self::NotOwner { .. } => ErrorSeverity::Critical,
            Self::NotFound { .. } => ErrorSeverity::Info,
            Self::Backend(_) | Self::Serialization(_) => ErrorSeverity::Error,
        }
    }
}

/// Result type alias for idempotency store operations
pub type StoreResult<T> = std::result::Result<T, StoreError>;
