//! Tunables for the cache tiers.

use std::time::Duration;

/// Configuration shared by the identity, grant and watch caches.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// How long a verified identity stays fresh.
    pub auth_ttl: Duration,
    /// How long each shared grant field stays fresh.
    pub shared_ttl: Duration,
    /// How long each per-user grant field stays fresh.
    pub user_ttl: Duration,
    /// How long a single watch permission decision stays valid.
    pub watch_ttl: Duration,
    /// Upper bound on identity records held in memory.
    pub identity_capacity: u64,
    /// Upper bound on concurrent reviews issued while resolving one user.
    pub review_concurrency: usize,
    /// Deadline applied to each external call.
    pub external_call_timeout: Duration,
    /// Consult fine-grained permission records during grant resolution.
    pub fine_grained: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            auth_ttl: Duration::from_secs(60),
            shared_ttl: Duration::from_secs(300),
            user_ttl: Duration::from_secs(300),
            watch_ttl: Duration::from_secs(300),
            identity_capacity: 10_000,
            review_concurrency: 32,
            external_call_timeout: Duration::from_secs(10),
            fine_grained: false,
        }
    }
}

impl CacheConfig {
    pub fn with_auth_ttl(mut self, ttl: Duration) -> Self {
        self.auth_ttl = ttl;
        self
    }

    pub fn with_shared_ttl(mut self, ttl: Duration) -> Self {
        self.shared_ttl = ttl;
        self
    }

    pub fn with_user_ttl(mut self, ttl: Duration) -> Self {
        self.user_ttl = ttl;
        self
    }

    pub fn with_watch_ttl(mut self, ttl: Duration) -> Self {
        self.watch_ttl = ttl;
        self
    }

    pub fn with_identity_capacity(mut self, capacity: u64) -> Self {
        self.identity_capacity = capacity;
        self
    }

    pub fn with_review_concurrency(mut self, concurrency: usize) -> Self {
        self.review_concurrency = concurrency.max(1);
        self
    }

    pub fn with_external_call_timeout(mut self, timeout: Duration) -> Self {
        self.external_call_timeout = timeout;
        self
    }

    pub fn with_fine_grained(mut self, enabled: bool) -> Self {
        self.fine_grained = enabled;
        self
    }
}

/// Wraps an external call in the configured deadline.
pub(crate) async fn with_deadline<T, F>(
    operation: &str,
    timeout: Duration,
    call: F,
) -> crate::error::DomainResult<T>
where
    F: std::future::Future<Output = crate::error::DomainResult<T>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(crate::error::DomainError::Timeout {
            operation: operation.to_string(),
            duration_ms: timeout.as_millis() as u64,
        }),
    }
}
