//! Notification engine errors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum NotificationError {
    /// A subscription with this id is already registered.
    #[error("subscription {id} already exists")]
    Duplicate { id: String },

    /// The listen connection could not be opened for the first subscription.
    #[error("failed to start listening: {message}")]
    Connect { message: String },

    #[error("invalid filter: {message}")]
    InvalidFilter { message: String },
}

pub type NotificationResult<T> = Result<T, NotificationError>;
