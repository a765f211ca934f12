//! Error types for the warehouse crate.

use std::io;

use crate::signal::Signal;

/// Result type alias using [`WarehouseError`].
pub type WarehouseResult<T> = Result<T, WarehouseError>;

/// SQLSTATE raised by PostgreSQL on a unique constraint violation.
const PG_UNIQUE_VIOLATION: &str = "23505";

/// Errors that can occur while storing telemetry.
///
/// Ingestion callers only ever need to distinguish "accepted" from
/// "failed, retry the batch"; see [`WarehouseError::is_retryable`].
#[derive(Debug, thiserror::Error)]
pub enum WarehouseError {
    /// Database error.
    #[error("database error: {0}")]
    Database(#[source] sqlx::Error),

    /// A concurrent writer won an insert race on a unique key.
    #[error("unique constraint violated: {0}")]
    UniqueViolation(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// The promotion policy could not be loaded or merged.
    #[error("promotion policy error: {0}")]
    Policy(String),

    /// The fact-write phase of a batch failed and was rolled back.
    ///
    /// Dimensions resolved before the failure remain committed, so retrying
    /// the whole batch is always safe.
    #[error("{signal} batch ingestion failed, retryable: {source}")]
    BatchFailed {
        /// Signal of the failed batch.
        signal: Signal,
        /// Underlying failure.
        #[source]
        source: Box<WarehouseError>,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serialisation error.
    #[error("serialisation error: {0}")]
    Serialisation(String),

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl WarehouseError {
    /// Create an internal error.
    #[must_use]
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create a policy error.
    #[must_use]
    pub fn policy(msg: impl Into<String>) -> Self {
        Self::Policy(msg.into())
    }

    /// Wrap a fact-phase failure for the given signal.
    #[must_use]
    pub fn batch_failed(signal: Signal, source: Self) -> Self {
        Self::BatchFailed {
            signal,
            source: Box::new(source),
        }
    }

    /// Whether retrying the whole batch is expected to succeed eventually.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::BatchFailed { .. } | Self::UniqueViolation(_) => true,
            Self::Database(err) => matches!(
                err,
                sqlx::Error::Io(_)
                    | sqlx::Error::PoolTimedOut
                    | sqlx::Error::PoolClosed
                    | sqlx::Error::WorkerCrashed
            ),
            _ => false,
        }
    }
}

impl From<sqlx::Error> for WarehouseError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db) = &err {
            if db.code().as_deref() == Some(PG_UNIQUE_VIOLATION) {
                return Self::UniqueViolation(db.message().to_owned());
            }
        }
        Self::Database(err)
    }
}

impl From<serde_json::Error> for WarehouseError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialisation(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_failure_is_retryable() {
        let err = WarehouseError::batch_failed(Signal::Logs, WarehouseError::internal("boom"));
        assert!(err.is_retryable());
        assert_eq!(
            err.to_string(),
            "logs batch ingestion failed, retryable: internal error: boom"
        );
    }

    #[test]
    fn policy_errors_are_not_retryable() {
        assert!(!WarehouseError::policy("bad override").is_retryable());
        assert!(!WarehouseError::Config("missing url".to_owned()).is_retryable());
    }

    #[test]
    fn pool_timeout_is_retryable() {
        let err = WarehouseError::from(sqlx::Error::PoolTimedOut);
        assert!(err.is_retryable());
    }
}
