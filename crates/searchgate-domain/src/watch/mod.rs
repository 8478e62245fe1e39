//! Per-tuple watch permission decisions for live event delivery.
//!
//! Unlike [`UserGrant`](crate::grants::UserGrant), which enumerates what a
//! user may list in bulk, this cache answers "may this user see this one
//! resource" for a concrete (verb, group, kind, namespace) tuple. Both
//! positive and negative answers are cached until the TTL lapses. Failed
//! checks deny the event and are not cached.

use moka::future::Cache;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::{with_deadline, CacheConfig};
use crate::identity::IdentityCache;
use crate::model::{ResourceAttributes, UserInfo};
use crate::traits::AccessReviewer;

/// Registers metric descriptions for the watch permission cache.
pub fn register_watch_cache_metrics() {
    metrics::describe_counter!(
        "searchgate_watch_cache_hits_total",
        "Watch permission checks answered from cache"
    );
    metrics::describe_counter!(
        "searchgate_watch_cache_misses_total",
        "Watch permission checks that needed a live review"
    );
}

/// Composite key of one watch decision within a user's entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WatchPermissionKey {
    pub verb: String,
    pub api_group: String,
    pub kind: String,
    /// Empty for cluster-scoped resources.
    pub namespace: String,
}

impl WatchPermissionKey {
    pub fn new(verb: &str, api_group: &str, kind: &str, namespace: &str) -> Self {
        Self {
            verb: verb.to_string(),
            api_group: api_group.to_string(),
            kind: kind.to_string(),
            namespace: namespace.to_string(),
        }
    }

    fn attributes(&self) -> ResourceAttributes {
        let attributes = ResourceAttributes::new(self.verb.as_str(), self.api_group.as_str(), self.kind.as_str());
        if self.namespace.is_empty() {
            attributes
        } else {
            attributes.in_namespace(self.namespace.as_str())
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct WatchPermissionEntry {
    pub allowed: bool,
    pub decided_at: Instant,
}

/// One user's watch decisions.
pub struct UserWatchPermissions {
    user: UserInfo,
    permissions: RwLock<HashMap<WatchPermissionKey, WatchPermissionEntry>>,
    ttl: Duration,
}

impl UserWatchPermissions {
    fn new(user: UserInfo, ttl: Duration) -> Self {
        Self {
            user,
            permissions: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    pub fn user(&self) -> &UserInfo {
        &self.user
    }

    /// Returns the cached decision if it is still valid.
    pub fn cached(&self, key: &WatchPermissionKey) -> Option<bool> {
        let permissions = self.permissions.read().ok()?;
        permissions
            .get(key)
            .filter(|entry| entry.decided_at.elapsed() < self.ttl)
            .map(|entry| entry.allowed)
    }

    /// Stores a decision, overwriting any expired one in place.
    fn store(&self, key: WatchPermissionKey, allowed: bool) {
        let entry = WatchPermissionEntry {
            allowed,
            decided_at: Instant::now(),
        };
        let mut permissions = self.permissions.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        permissions.insert(key, entry);
    }

    pub fn len(&self) -> usize {
        self.permissions.read().map(|p| p.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Watch permission decisions for every user, keyed by UID.
///
/// A user's entry is dropped after it has gone unused for a full TTL, at
/// which point every decision in it has expired anyway.
pub struct WatchPermissionCache {
    identity: Arc<IdentityCache>,
    reviewer: Arc<dyn AccessReviewer>,
    users: Cache<String, Arc<UserWatchPermissions>>,
    ttl: Duration,
    timeout: Duration,
}

impl WatchPermissionCache {
    pub fn new(identity: Arc<IdentityCache>, reviewer: Arc<dyn AccessReviewer>, config: &CacheConfig) -> Self {
        let users = Cache::builder()
            .max_capacity(config.identity_capacity)
            .time_to_idle(config.watch_ttl)
            .build();
        Self {
            identity,
            reviewer,
            users,
            ttl: config.watch_ttl,
            timeout: config.external_call_timeout,
        }
    }

    /// Resolves the caller behind `token` and checks one permission.
    ///
    /// Any identity or review failure yields `false`.
    pub async fn check_permission_and_cache(
        &self,
        token: &str,
        verb: &str,
        api_group: &str,
        kind: &str,
        namespace: &str,
    ) -> bool {
        match self.identity.verify_user(token).await {
            Ok(user) => self.check(&user, verb, api_group, kind, namespace).await,
            Err(error) => {
                debug!(error = %error, "identity unavailable; denying watch permission");
                false
            }
        }
    }

    /// Checks one permission for an already verified user.
    pub async fn check(&self, user: &UserInfo, verb: &str, api_group: &str, kind: &str, namespace: &str) -> bool {
        let permissions = self.for_user(user).await;
        let key = WatchPermissionKey::new(verb, api_group, kind, namespace);

        if let Some(allowed) = permissions.cached(&key) {
            metrics::counter!("searchgate_watch_cache_hits_total").increment(1);
            return allowed;
        }
        metrics::counter!("searchgate_watch_cache_misses_total").increment(1);

        let attributes = key.attributes();
        let review = with_deadline(
            "watch access review",
            self.timeout,
            self.reviewer.review_access(permissions.user(), &attributes),
        )
        .await;
        match review {
            Ok(allowed) => {
                debug!(uid = %user.uid, ?key, allowed, "cached watch decision");
                permissions.store(key, allowed);
                allowed
            }
            Err(error) => {
                warn!(uid = %user.uid, ?key, error = %error, "watch access review failed; denying");
                false
            }
        }
    }

    /// Returns the user's decision set, creating it on first use.
    pub async fn for_user(&self, user: &UserInfo) -> Arc<UserWatchPermissions> {
        let ttl = self.ttl;
        self.users
            .get_with(user.uid.clone(), async { Arc::new(UserWatchPermissions::new(user.clone(), ttl)) })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockAccessReviewer, MockIdentityProvider};
    use std::sync::atomic::Ordering;

    struct Fixture {
        reviewer: Arc<MockAccessReviewer>,
        cache: WatchPermissionCache,
    }

    fn fixture(watch_ttl: Duration) -> Fixture {
        let config = CacheConfig::default().with_watch_ttl(watch_ttl);
        let provider = Arc::new(MockIdentityProvider::new().with_user("token-u", UserInfo::new("uid-u", "u")));
        let identity = Arc::new(IdentityCache::new(provider, &config));
        let reviewer = Arc::new(MockAccessReviewer::new());
        let cache = WatchPermissionCache::new(identity, reviewer.clone(), &config);
        Fixture { reviewer, cache }
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_check_is_served_from_cache() {
        // Arrange
        let fx = fixture(Duration::from_secs(60));
        fx.reviewer.allow("uid-u", "watch", "apps", "deployments", Some("ns-a"));

        // Act
        let first = fx
            .cache
            .check_permission_and_cache("token-u", "watch", "apps", "deployments", "ns-a")
            .await;
        let second = fx
            .cache
            .check_permission_and_cache("token-u", "watch", "apps", "deployments", "ns-a")
            .await;

        // Assert
        assert!(first);
        assert!(second);
        assert_eq!(fx.reviewer.access_call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_denials_are_cached_per_tuple() {
        let fx = fixture(Duration::from_secs(60));

        assert!(!fx.cache.check_permission_and_cache("token-u", "watch", "", "secrets", "ns-a").await);
        assert!(!fx.cache.check_permission_and_cache("token-u", "watch", "", "secrets", "ns-a").await);
        assert!(!fx.cache.check_permission_and_cache("token-u", "watch", "", "secrets", "ns-b").await);

        assert_eq!(fx.reviewer.access_call_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_decision_is_rechecked() {
        // Arrange
        let fx = fixture(Duration::from_secs(30));
        fx.cache.check_permission_and_cache("token-u", "watch", "", "pods", "ns-a").await;
        fx.reviewer.allow("uid-u", "watch", "", "pods", Some("ns-a"));

        // Act
        tokio::time::advance(Duration::from_secs(29)).await;
        let cached = fx.cache.check_permission_and_cache("token-u", "watch", "", "pods", "ns-a").await;
        tokio::time::advance(Duration::from_secs(2)).await;
        let refreshed = fx.cache.check_permission_and_cache("token-u", "watch", "", "pods", "ns-a").await;

        // Assert
        assert!(!cached);
        assert!(refreshed);
        assert_eq!(fx.reviewer.access_call_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_review_failure_denies_without_caching() {
        let fx = fixture(Duration::from_secs(60));
        fx.reviewer.allow("uid-u", "watch", "", "pods", Some("ns-a"));
        fx.reviewer.fail_access.store(true, Ordering::SeqCst);

        let failed = fx.cache.check_permission_and_cache("token-u", "watch", "", "pods", "ns-a").await;
        fx.reviewer.fail_access.store(false, Ordering::SeqCst);
        let recovered = fx.cache.check_permission_and_cache("token-u", "watch", "", "pods", "ns-a").await;

        assert!(!failed);
        assert!(recovered);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_token_is_denied_without_review() {
        let fx = fixture(Duration::from_secs(60));

        let allowed = fx.cache.check_permission_and_cache("bogus", "watch", "", "pods", "ns-a").await;

        assert!(!allowed);
        assert_eq!(fx.reviewer.access_call_count(), 0);
    }

    #[tokio::test]
    async fn test_cluster_scoped_key_has_no_namespace() {
        let key = WatchPermissionKey::new("watch", "", "nodes", "");
        assert_eq!(key.attributes().namespace, None);
    }
}
