//! Conversions from external infrastructure errors into [`InfraError`] and
//! from [`InfraError`] into the domain's store error.

use genguard_common::ConfigError;
use genguard_domain::StoreError;
use rusqlite::Error as SqlError;
use tokio::task::JoinError;

use super::InfraError;

/* -------------------------------------------------------------------------- */
/* rusqlite::Error → InfraError */
/* -------------------------------------------------------------------------- */

impl From<SqlError> for InfraError {
    fn from(value: SqlError) -> Self {
        use rusqlite::ffi::ErrorCode;
        use rusqlite::Error as RE;

        match value {
            RE::SqliteFailure(err, maybe_message) => {
                let message = maybe_message.unwrap_or_default();
                match (err.code, err.extended_code) {
                    (ErrorCode::DatabaseBusy, _) => InfraError::Busy("database is busy".into()),
                    (ErrorCode::DatabaseLocked, _) => {
                        InfraError::Busy("database is locked".into())
                    }
                    (ErrorCode::ConstraintViolation, 1555 | 2067) => {
                        InfraError::Database("unique constraint violation".into())
                    }
                    _ => InfraError::Database(format!(
                        "sqlite failure {:?} (code {}): {}",
                        err.code, err.extended_code, message
                    )),
                }
            }
            RE::FromSqlConversionFailure(_, _, cause) => {
                InfraError::Database(format!("failed to convert sqlite value: {cause}"))
            }
            RE::InvalidColumnType(_, _, ty) => {
                InfraError::Database(format!("invalid column type: {ty}"))
            }
            RE::InvalidPath(path) => InfraError::Database(format!(
                "invalid database path: {}",
                path.to_string_lossy()
            )),
            other => InfraError::Database(other.to_string()),
        }
    }
}

/* -------------------------------------------------------------------------- */
/* r2d2 / tokio → InfraError */
/* -------------------------------------------------------------------------- */

impl From<r2d2::Error> for InfraError {
    fn from(value: r2d2::Error) -> Self {
        InfraError::Database(format!("connection pool error: {value}"))
    }
}

impl From<JoinError> for InfraError {
    fn from(value: JoinError) -> Self {
        InfraError::Task(value.to_string())
    }
}

/* -------------------------------------------------------------------------- */
/* ConfigError → InfraError */
/* -------------------------------------------------------------------------- */

impl From<ConfigError> for InfraError {
    fn from(value: ConfigError) -> Self {
        InfraError::Config(value.to_string())
    }
}

/* -------------------------------------------------------------------------- */
/* InfraError → StoreError */
/* -------------------------------------------------------------------------- */

impl From<InfraError> for StoreError {
    fn from(value: InfraError) -> Self {
        StoreError::Backend(value.to_string())
    }
}

/* -------------------------------------------------------------------------- */
/* Tests */
/* -------------------------------------------------------------------------- */

#[cfg(test)]
mod tests {
    use genguard_common::ErrorClassification;
    use rusqlite::ffi::{Error as FfiError, ErrorCode};

    use super::*;

    #[test]
    fn sqlite_busy_maps_to_retryable_busy() {
        let err = SqlError::SqliteFailure(
            FfiError { code: ErrorCode::DatabaseBusy, extended_code: 5 },
            Some("database is locked".into()),
        );
        let infra = InfraError::from(err);
        assert!(matches!(infra, InfraError::Busy(_)));
        assert!(infra.is_retryable());
    }

    #[test]
    fn primary_key_violation_is_named() {
        let err = SqlError::SqliteFailure(
            FfiError { code: ErrorCode::ConstraintViolation, extended_code: 1555 },
            None,
        );
        assert_eq!(
            InfraError::from(err).to_string(),
            "Database error: unique constraint violation"
        );
    }

    #[test]
    fn infra_errors_become_backend_store_errors() {
        let store: StoreError = InfraError::Database("disk full".into()).into();
        assert_eq!(store, StoreError::Backend("Database error: disk full".into()));
    }
}
