//! Kubernetes-backed implementations of the domain traits.
//!
//! ```text
//! TokenReviewProvider   -> authentication.k8s.io/v1 TokenReview
//! ImpersonatingReviewer -> authorization.k8s.io/v1 SelfSubject{Access,Rules}Review
//! KubeClusterApi        -> namespaces, managed clusters, RBAC and group watches
//! KubePermissionSource  -> clusterview.open-cluster-management.io/v1alpha1 UserPermission
//! ```

mod access;
mod cluster;
mod identity;
mod permissions;

pub use access::{ClientCacheLimits, ImpersonatingReviewer};
pub use cluster::{map_watch_event, KubeClusterApi};
pub use identity::{token_review_from_status, TokenReviewProvider};
pub use permissions::{parse_user_permission, KubePermissionSource};

use kube::{Client, Config};
use std::sync::Arc;

use searchgate_domain::DomainError;

/// Label carried by the hub's own managed cluster.
pub const LOCAL_CLUSTER_LABEL: &str = "local-cluster";

pub(crate) fn cluster_api_error(e: kube::Error) -> DomainError {
    DomainError::ClusterApiError {
        message: e.to_string(),
    }
}

/// All Kubernetes adapters built from one client configuration.
#[derive(Clone)]
pub struct KubeAdapters {
    pub identity_provider: Arc<TokenReviewProvider>,
    pub access_reviewer: Arc<ImpersonatingReviewer>,
    pub cluster_api: Arc<KubeClusterApi>,
    pub permission_source: Arc<KubePermissionSource>,
}

impl KubeAdapters {
    /// Builds the adapters from the ambient kubeconfig or in-cluster service account.
    pub async fn infer(limits: ClientCacheLimits) -> anyhow::Result<Self> {
        let config = Config::infer().await?;
        Self::from_config(config, limits)
    }

    pub fn from_config(config: Config, limits: ClientCacheLimits) -> anyhow::Result<Self> {
        let client = Client::try_from(config.clone())?;
        let access_reviewer = Arc::new(ImpersonatingReviewer::new(config, limits));
        Ok(Self {
            identity_provider: Arc::new(TokenReviewProvider::new(client.clone())),
            cluster_api: Arc::new(KubeClusterApi::new(client)),
            permission_source: Arc::new(KubePermissionSource::new(access_reviewer.clone())),
            access_reviewer,
        })
    }
}
