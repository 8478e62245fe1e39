//! Coalesced identity verification cache.
//!
//! `verify` answers from a fresh cached record when one exists. Otherwise
//! concurrent callers presenting the same token share a single call to the
//! identity provider through [`Singleflight`]; every waiter receives the
//! same outcome. Provider failures are surfaced to all waiters and never
//! cached, so an outage does not turn into a cached denial.
//!
//! Records are also held in a bounded moka cache whose own TTL matches the
//! freshness window, which keeps rotated tokens from accumulating.

use moka::future::Cache;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

use crate::config::{with_deadline, CacheConfig};
use crate::error::{DomainError, DomainResult};
use crate::model::UserInfo;
use crate::singleflight::Singleflight;
use crate::traits::IdentityProvider;

/// Outcome of verifying one token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityRecord {
    pub authenticated: bool,
    pub user: UserInfo,
    pub verified_at: Instant,
}

impl IdentityRecord {
    pub fn uid(&self) -> &str {
        &self.user.uid
    }
}

/// Short, non-reversible label for a token, safe to put in logs.
pub fn token_fingerprint(token: &str) -> String {
    let prefix: String = token.chars().take(6).collect();
    format!("{prefix}..({})", token.len())
}

/// Registers metric descriptions for the identity cache.
pub fn register_identity_cache_metrics() {
    metrics::describe_counter!(
        "searchgate_identity_cache_hits_total",
        "Token verifications answered from a fresh cached record"
    );
    metrics::describe_counter!(
        "searchgate_identity_cache_misses_total",
        "Token verifications that needed the identity provider"
    );
    metrics::describe_counter!(
        "searchgate_identity_coalesced_total",
        "Token verifications that joined an in-flight provider call"
    );
}

/// Verifies tokens against an [`IdentityProvider`], coalescing concurrent calls.
pub struct IdentityCache {
    provider: Arc<dyn IdentityProvider>,
    records: Cache<String, IdentityRecord>,
    flights: Singleflight<String, DomainResult<IdentityRecord>>,
    ttl: Duration,
    timeout: Duration,
}

impl IdentityCache {
    pub fn new(provider: Arc<dyn IdentityProvider>, config: &CacheConfig) -> Self {
        let records = Cache::builder()
            .max_capacity(config.identity_capacity)
            .time_to_live(config.auth_ttl)
            .build();

        Self {
            provider,
            records,
            flights: Singleflight::new(),
            ttl: config.auth_ttl,
            timeout: config.external_call_timeout,
        }
    }

    /// Verifies `token`, returning the cached or freshly reviewed record.
    ///
    /// An `Err` always means "not verified": callers must treat it as
    /// unauthenticated for this request.
    #[instrument(skip_all, fields(token = %token_fingerprint(token)))]
    pub async fn verify(&self, token: &str) -> DomainResult<IdentityRecord> {
        if let Some(record) = self.fresh_record(token).await {
            metrics::counter!("searchgate_identity_cache_hits_total").increment(1);
            return Ok(record);
        }
        metrics::counter!("searchgate_identity_cache_misses_total").increment(1);

        let (outcome, shared) = self
            .flights
            .run(token.to_string(), || self.review_and_store(token))
            .await;
        if shared {
            metrics::counter!("searchgate_identity_coalesced_total").increment(1);
            debug!("joined in-flight token review");
        }
        outcome
    }

    /// Verifies `token` and returns its user, rejecting unauthenticated tokens.
    pub async fn verify_user(&self, token: &str) -> DomainResult<UserInfo> {
        let record = self.verify(token).await?;
        if record.authenticated {
            Ok(record.user)
        } else {
            Err(DomainError::Unauthenticated)
        }
    }

    /// Drops any cached record for `token`.
    pub async fn invalidate(&self, token: &str) {
        self.records.invalidate(token).await;
    }

    /// Number of tokens with an in-flight review.
    pub fn in_flight(&self) -> usize {
        self.flights.in_flight()
    }

    async fn fresh_record(&self, token: &str) -> Option<IdentityRecord> {
        self.records
            .get(token)
            .await
            .filter(|record| Instant::now() < record.verified_at + self.ttl)
    }

    async fn review_and_store(&self, token: &str) -> DomainResult<IdentityRecord> {
        // Another leader may have stored a record between our miss and taking the slot.
        if let Some(record) = self.fresh_record(token).await {
            return Ok(record);
        }

        let review = with_deadline("token review", self.timeout, self.provider.review_token(token)).await;
        match review {
            Ok(review) => {
                let record = IdentityRecord {
                    authenticated: review.authenticated,
                    user: review.user,
                    verified_at: Instant::now(),
                };
                self.records.insert(token.to_string(), record.clone()).await;
                debug!(
                    authenticated = record.authenticated,
                    uid = %record.user.uid,
                    "token reviewed"
                );
                Ok(record)
            }
            Err(error) => {
                warn!(error = %error, "token review failed");
                Err(error)
            }
        }
    }
}

impl std::fmt::Debug for IdentityCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityCache")
            .field("entry_count", &self.records.entry_count())
            .field("in_flight", &self.flights.in_flight())
            .field("ttl", &self.ttl)
            .finish()
    }
}
