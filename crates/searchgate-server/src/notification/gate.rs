//! Per-subscription authorization of individual change events.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

use searchgate_domain::{AuthzCache, DomainResult, FineGrainedGrant, UserInfo, WatchPermissionCache};

use super::event::ChangeEvent;

const CLUSTER_VIEW_GROUP: &str = "view.open-cluster-management.io";
const CLUSTER_VIEW_KIND: &str = "managedclusterviews";

/// Decides whether one subscriber may see one event.
#[async_trait]
pub trait EventGate: Send + Sync + 'static {
    async fn allows(&self, event: &ChangeEvent) -> bool;
}

/// A single watch permission lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessCheck {
    pub verb: &'static str,
    pub api_group: String,
    pub kind: String,
    pub namespace: String,
}

/// The watch permission an event needs, or `None` when it cannot be authorized.
///
/// Hub resources need `watch` on the resource itself. Managed-cluster
/// resources need `create` on managed cluster views in the cluster's namespace.
pub fn required_check(event: &ChangeEvent) -> Option<AccessCheck> {
    event.data()?;
    if event.is_hub_resource() {
        return Some(AccessCheck {
            verb: "watch",
            api_group: event.api_group().to_string(),
            kind: event.kind_plural()?.to_string(),
            namespace: event.namespace().unwrap_or_default().to_string(),
        });
    }
    if event.cluster.is_empty() {
        return None;
    }
    Some(AccessCheck {
        verb: "create",
        api_group: CLUSTER_VIEW_GROUP.to_string(),
        kind: CLUSTER_VIEW_KIND.to_string(),
        namespace: event.cluster.clone(),
    })
}

/// Gate backed by the watch permission cache for one verified user.
pub struct WatchPermissionGate {
    watch: Arc<WatchPermissionCache>,
    user: UserInfo,
    fine_grained: Option<Arc<FineGrainedGrant>>,
}

impl WatchPermissionGate {
    pub fn new(watch: Arc<WatchPermissionCache>, user: UserInfo) -> Self {
        Self {
            watch,
            user,
            fine_grained: None,
        }
    }

    /// Managed-cluster resources are checked against `grant` instead of a review.
    pub fn with_fine_grained(mut self, grant: Option<Arc<FineGrainedGrant>>) -> Self {
        self.fine_grained = grant;
        self
    }

    /// Verifies `token` and builds a gate for its user.
    ///
    /// With fine-grained mode on, the user's `watch` grant is loaded here.
    /// The listable grant is never resolved.
    pub async fn for_token(cache: &AuthzCache, token: &str) -> DomainResult<Self> {
        let user = cache.identity.verify_user(token).await?;
        let grant = cache.users.watch_grant(&user).await?;
        Ok(Self::new(cache.watch.clone(), user).with_fine_grained(grant))
    }

    pub fn user(&self) -> &UserInfo {
        &self.user
    }
}

#[async_trait]
impl EventGate for WatchPermissionGate {
    async fn allows(&self, event: &ChangeEvent) -> bool {
        if let Some(grant) = &self.fine_grained {
            if !event.is_hub_resource() {
                let Some(kind) = event.kind_plural() else {
                    return false;
                };
                return grant.allows(&event.cluster, event.namespace(), event.api_group(), kind);
            }
        }

        let Some(check) = required_check(event) else {
            debug!(uid = %event.uid, "event lacks the fields needed for authorization; denying");
            return false;
        };
        self.watch
            .check(&self.user, check.verb, &check.api_group, &check.kind, &check.namespace)
            .await
    }
}
