//! Storage error types.

use std::time::Duration;
use thiserror::Error;

/// Storage-specific errors.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Database connection error.
    #[error("database connection error: {message}")]
    ConnectionError { message: String },

    /// Database query error.
    #[error("database query error: {message}")]
    QueryError { message: String },

    /// Query exceeded its deadline.
    #[error("query timeout after {timeout:?}: {operation}")]
    QueryTimeout { operation: String, timeout: Duration },

    /// Subscribing to a notification channel failed.
    #[error("listen error on channel {channel}: {message}")]
    ListenError { channel: String, message: String },

    /// The dedicated notification connection went away.
    #[error("notification connection lost: {message}")]
    ConnectionLost { message: String },

    /// Invalid input error.
    #[error("invalid input: {message}")]
    InvalidInput { message: String },
}

impl StorageError {
    /// True for errors where reconnecting may help.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            StorageError::ConnectionError { .. } | StorageError::ConnectionLost { .. } | StorageError::ListenError { .. }
        )
    }
}

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;
