//! Domain error types for identity and authorization caching.

use thiserror::Error;

/// Domain-specific errors for identity verification and grant resolution.
///
/// Errors are `Clone` because a single outcome is recorded on cache entries
/// and broadcast to every waiter of a coalesced lookup.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DomainError {
    /// The identity provider could not be reached or rejected the request.
    #[error("identity provider error: {message}")]
    IdentityProviderError { message: String },

    /// A live authorization review failed.
    #[error("authorization review error: {message}")]
    AuthorizationReviewError { message: String },

    /// The cluster API failed to list or watch a resource.
    #[error("cluster api error: {message}")]
    ClusterApiError { message: String },

    /// A query against the relational store failed.
    #[error("store query error: {message}")]
    StoreQueryError { message: String },

    /// The fine-grained permission source failed.
    #[error("permission source error: {message}")]
    PermissionSourceError { message: String },

    /// An external call exceeded its deadline.
    #[error("timeout after {duration_ms}ms: {operation}")]
    Timeout { operation: String, duration_ms: u64 },

    /// The caller presented a token that the identity provider did not authenticate.
    #[error("token is not authenticated")]
    Unauthenticated,

    /// The task executing a coalesced lookup was dropped before finishing.
    #[error("coalesced lookup abandoned for key {key}")]
    Abandoned { key: String },
}

impl DomainError {
    /// Returns true for failures that a later retry may resolve.
    pub fn is_transient(&self) -> bool {
        !matches!(self, DomainError::Unauthenticated)
    }
}

/// Result type for domain operations.
pub type DomainResult<T> = Result<T, DomainError>;
