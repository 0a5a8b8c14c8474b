//! Error types for the database access layer.
//!
//! This module defines all error types using `thiserror` for ergonomic error handling.
//! Driver errors are classified into a small taxonomy; most variants carry a
//! suggestion to help operators recover from the condition.

use crate::context::CancelReason;
use crate::migrate::MigrationError;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Configuration error: {message}")]
    Configuration { message: String, suggestion: String },

    #[error("Connection failed: {message}")]
    Connection { message: String, suggestion: String },

    #[error("Database error: {message}")]
    Database {
        message: String,
        /// e.g., "42P01" for undefined table
        sql_state: Option<String>,
        suggestion: String,
    },

    #[error("Transaction error: {message} (transaction: {transaction_id})")]
    Transaction {
        message: String,
        transaction_id: String,
    },

    #[error("Timeout: {operation} exceeded {limit_ms}ms")]
    Timeout { operation: String, limit_ms: u64 },

    #[error("Cancelled: {operation} ({reason})")]
    Cancelled {
        operation: String,
        reason: CancelReason,
    },

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },

    #[error("Migration failed: {0}")]
    Migration(#[from] MigrationError),
}

impl DbError {
    /// Create a configuration error with a helpful suggestion.
    pub fn configuration(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    /// Create a connection error with a helpful suggestion.
    pub fn connection(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    /// Create a database error with optional SQL state.
    pub fn database(
        message: impl Into<String>,
        sql_state: Option<String>,
        suggestion: impl Into<String>,
    ) -> Self {
        Self::Database {
            message: message.into(),
            sql_state,
            suggestion: suggestion.into(),
        }
    }

    /// Create a transaction error.
    pub fn transaction(message: impl Into<String>, transaction_id: impl Into<String>) -> Self {
        Self::Transaction {
            message: message.into(),
            transaction_id: transaction_id.into(),
        }
    }

    /// Create a timeout error.
    pub fn timeout(operation: impl Into<String>, limit: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            limit_ms: u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// Create a cancellation error.
    pub fn cancelled(operation: impl Into<String>, reason: CancelReason) -> Self {
        Self::Cancelled {
            operation: operation.into(),
            reason,
        }
    }

    /// Create an invalid input error.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Get the suggestion for this error, if available.
    pub fn suggestion(&self) -> Option<&str> {
        match self {
            Self::Configuration { suggestion, .. } => Some(suggestion),
            Self::Connection { suggestion, .. } => Some(suggestion),
            Self::Database { suggestion, .. } => Some(suggestion),
            _ => None,
        }
    }

    /// Check if this error is retryable. Nothing in this crate retries; the
    /// classification is for callers.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::Timeout { .. })
    }

    /// True for deadline expiry or explicit cancellation of the context.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    /// SQLSTATE reported by the server, if any.
    pub fn sql_state(&self) -> Option<&str> {
        match self {
            Self::Database { sql_state, .. } => sql_state.as_deref(),
            _ => None,
        }
    }
}

/// Convert sqlx errors to DbError.
impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Configuration(msg) => DbError::configuration(
                msg.to_string(),
                "Check the connection string format and credentials",
            ),
            sqlx::Error::Database(db_err) => {
                let code = db_err.code().map(|c| c.to_string());
                DbError::database(
                    db_err.message(),
                    code,
                    "Check the SQL syntax and referenced objects",
                )
            }
            sqlx::Error::RowNotFound => DbError::database(
                "No rows returned",
                None,
                "Verify the query conditions match existing data",
            ),
            sqlx::Error::PoolTimedOut => DbError::connection(
                "Timed out acquiring a pooled connection",
                "Increase the pool size or the acquire timeout",
            ),
            sqlx::Error::PoolClosed => {
                DbError::connection("Connection pool is closed", "Reconnect to the database")
            }
            sqlx::Error::Io(io_err) => DbError::connection(
                format!("I/O error: {}", io_err),
                "Check network connectivity and database server status",
            ),
            sqlx::Error::Tls(tls_err) => DbError::connection(
                format!("TLS error: {}", tls_err),
                "Verify TLS configuration and certificates",
            ),
            sqlx::Error::Protocol(msg) => DbError::connection(
                format!("Protocol error: {}", msg),
                "Check database server compatibility",
            ),
            sqlx::Error::ColumnNotFound(col) => {
                DbError::internal(format!("Column not found: {}", col))
            }
            sqlx::Error::ColumnDecode { index, source } => {
                DbError::internal(format!("Failed to decode column {}: {}", index, source))
            }
            sqlx::Error::Decode(source) => DbError::internal(format!("Decode error: {}", source)),
            sqlx::Error::WorkerCrashed => DbError::internal("Database worker crashed"),
            _ => DbError::internal(format!("Unknown database error: {}", err)),
        }
    }
}

/// Result type alias for database operations.
pub type DbResult<T> = Result<T, DbError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DbError::connection("Failed to connect", "Check credentials");
        assert!(err.to_string().contains("Connection failed"));

        let err = DbError::timeout("exec", Duration::from_millis(250));
        assert_eq!(err.to_string(), "Timeout: exec exceeded 250ms");

        let err = DbError::timeout("exec", Duration::MAX);
        assert!(matches!(err, DbError::Timeout { limit_ms: u64::MAX, .. }));
    }

    #[test]
    fn test_error_suggestion() {
        let err = DbError::database(
            "Syntax error",
            Some("42601".to_string()),
            "Check SQL syntax",
        );
        assert_eq!(err.suggestion(), Some("Check SQL syntax"));
        assert_eq!(err.sql_state(), Some("42601"));
        assert_eq!(DbError::internal("x").suggestion(), None);
    }

    #[test]
    fn test_error_retryable() {
        assert!(DbError::timeout("query", Duration::from_secs(30)).is_retryable());
        assert!(DbError::connection("err", "sugg").is_retryable());
        assert!(!DbError::invalid_input("bad").is_retryable());
        assert!(!DbError::cancelled("exec", CancelReason::Canceled).is_retryable());
    }

    #[test]
    fn test_cancelled_display() {
        let err = DbError::cancelled("exec", CancelReason::DeadlineExceeded);
        assert!(err.is_cancelled());
        assert_eq!(err.to_string(), "Cancelled: exec (context deadline exceeded)");
    }

    #[test]
    fn test_pool_closed_maps_to_connection() {
        let err = DbError::from(sqlx::Error::PoolClosed);
        assert!(matches!(err, DbError::Connection { .. }));
    }

    #[test]
    fn test_row_not_found_maps_to_database() {
        let err = DbError::from(sqlx::Error::RowNotFound);
        assert!(matches!(err, DbError::Database { sql_state: None, .. }));
    }

    #[test]
    fn test_migration_error_wraps() {
        let err = DbError::from(MigrationError::AlreadyInitialized("schema_migrations".into()));
        assert!(err.to_string().starts_with("Migration failed:"));
    }
}
