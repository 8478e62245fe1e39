//! Traits for the external systems the caches sit in front of.
//!
//! Implementations live outside this crate: the server wires Kubernetes
//! clients and the relational store behind them, and tests use counting mocks.

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::collections::HashMap;

use crate::error::DomainResult;
use crate::grants::fine_grained::UserPermission;
use crate::model::{ManagedCluster, Resource, ResourceAttributes, ResourceRule, TokenReview, UserInfo, WatchEvent, WatchedKind};

/// Stream of events from a long-lived watch.
pub type WatchStream = BoxStream<'static, DomainResult<WatchEvent>>;

/// Verifies opaque bearer tokens.
#[async_trait]
pub trait IdentityProvider: Send + Sync + 'static {
    /// Reviews a token. Must be idempotent and safe to retry.
    async fn review_token(&self, token: &str) -> DomainResult<TokenReview>;
}

/// Runs live authorization checks on behalf of a principal.
#[async_trait]
pub trait AccessReviewer: Send + Sync + 'static {
    /// Returns whether `principal` may perform the described action.
    async fn review_access(&self, principal: &UserInfo, attributes: &ResourceAttributes) -> DomainResult<bool>;

    /// Returns the rules `principal` holds in `namespace`.
    async fn review_rules(&self, principal: &UserInfo, namespace: &str) -> DomainResult<Vec<ResourceRule>>;
}

/// Read and watch access to cluster objects that shape authorization.
#[async_trait]
pub trait ClusterApi: Send + Sync + 'static {
    async fn list_namespaces(&self) -> DomainResult<Vec<String>>;

    async fn list_managed_clusters(&self) -> DomainResult<Vec<ManagedCluster>>;

    /// Opens a watch on `kind`. The stream ends when the server closes it.
    async fn watch(&self, kind: WatchedKind) -> DomainResult<WatchStream>;
}

/// Cluster-wide facts kept in the relational store.
#[async_trait]
pub trait GrantReader: Send + Sync + 'static {
    /// Distinct (group, kind) pairs of cluster-scoped resources on the hub.
    async fn cluster_scoped_resources(&self) -> DomainResult<Vec<Resource>>;

    /// Managed clusters that do not run the search add-on.
    async fn disabled_clusters(&self) -> DomainResult<Vec<String>>;

    /// Property name to data type.
    async fn property_types(&self) -> DomainResult<HashMap<String, String>>;
}

/// Source of structured fine-grained permission records.
#[async_trait]
pub trait PermissionSource: Send + Sync + 'static {
    async fn user_permissions(&self, principal: &UserInfo) -> DomainResult<Vec<UserPermission>>;
}
