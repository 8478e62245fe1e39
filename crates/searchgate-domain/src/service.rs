//! The cache service object wiring every tier together.

use std::sync::Arc;

use crate::config::CacheConfig;
use crate::error::DomainResult;
use crate::grants::{SharedGrant, SharedGrantCache, UserGrant, UserGrantCache};
use crate::identity::{IdentityCache, IdentityRecord};
use crate::invalidation::{BackgroundInvalidator, InvalidatorConfig};
use crate::traits::{AccessReviewer, ClusterApi, GrantReader, IdentityProvider, PermissionSource};
use crate::watch::WatchPermissionCache;

/// External systems the caches depend on.
#[derive(Clone)]
pub struct ExternalServices {
    pub identity_provider: Arc<dyn IdentityProvider>,
    pub access_reviewer: Arc<dyn AccessReviewer>,
    pub cluster_api: Arc<dyn ClusterApi>,
    pub grant_reader: Arc<dyn GrantReader>,
    pub permission_source: Option<Arc<dyn PermissionSource>>,
}

/// Identity, grant and watch caches built once and shared by handle.
#[derive(Clone)]
pub struct AuthzCache {
    pub identity: Arc<IdentityCache>,
    pub shared: Arc<SharedGrantCache>,
    pub users: Arc<UserGrantCache>,
    pub watch: Arc<WatchPermissionCache>,
    cluster_api: Arc<dyn ClusterApi>,
}

impl AuthzCache {
    pub fn new(services: ExternalServices, config: &CacheConfig) -> Self {
        let identity = Arc::new(IdentityCache::new(services.identity_provider, config));
        let shared = Arc::new(SharedGrantCache::new(
            services.grant_reader,
            services.cluster_api.clone(),
            config,
        ));
        let users = Arc::new(UserGrantCache::new(
            shared.clone(),
            services.access_reviewer.clone(),
            services.permission_source,
            config,
        ));
        let watch = Arc::new(WatchPermissionCache::new(
            identity.clone(),
            services.access_reviewer,
            config,
        ));

        Self {
            identity,
            shared,
            users,
            watch,
            cluster_api: services.cluster_api,
        }
    }

    pub async fn verify(&self, token: &str) -> DomainResult<IdentityRecord> {
        self.identity.verify(token).await
    }

    pub async fn shared_grant(&self) -> DomainResult<SharedGrant> {
        self.shared.shared_grant().await
    }

    /// Resolves the caller behind `token` and returns their grant.
    pub async fn user_grant(&self, token: &str) -> DomainResult<UserGrant> {
        let user = self.identity.verify_user(token).await?;
        self.users.user_grant(&user).await
    }

    pub async fn check_permission_and_cache(
        &self,
        token: &str,
        verb: &str,
        api_group: &str,
        kind: &str,
        namespace: &str,
    ) -> bool {
        self.watch
            .check_permission_and_cache(token, verb, api_group, kind, namespace)
            .await
    }

    /// Builds the invalidator that keeps this cache in step with the cluster.
    pub fn invalidator(&self, config: InvalidatorConfig) -> Arc<BackgroundInvalidator> {
        BackgroundInvalidator::new(
            self.shared.clone(),
            self.users.clone(),
            self.cluster_api.clone(),
            config,
        )
    }
}

/// Registers metric descriptions for every cache tier.
pub fn register_cache_metrics() {
    crate::identity::register_identity_cache_metrics();
    crate::watch::register_watch_cache_metrics();
    crate::invalidation::register_invalidation_metrics();
    metrics::describe_counter!(
        "searchgate_user_grant_refreshes_total",
        "Per-user grant parts resolved through live reviews"
    );
}
