//! Cluster-wide grant data shared by every user.
//!
//! Each field refreshes on its own schedule behind its own lock, so a slow
//! store query for one field never delays readers of another.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument};

use crate::config::{with_deadline, CacheConfig};
use crate::error::DomainResult;
use crate::freshness::{CachedField, FieldStatus};
use crate::grants::rules::is_builtin_cluster_scoped;
use crate::grants::user::UserGrant;
use crate::model::Resource;
use crate::traits::{ClusterApi, GrantReader};

/// Snapshot of all cluster-wide grant data.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SharedGrant {
    pub cluster_scoped_resources: Arc<HashSet<Resource>>,
    pub namespaces: Arc<Vec<String>>,
    pub managed_clusters: Arc<HashSet<String>>,
    pub disabled_clusters: Arc<HashSet<String>>,
}

/// Lazily refreshed cache of [`SharedGrant`] fields plus property types.
pub struct SharedGrantCache {
    reader: Arc<dyn GrantReader>,
    cluster_api: Arc<dyn ClusterApi>,
    timeout: Duration,
    cluster_scoped: CachedField<HashSet<Resource>>,
    namespaces: CachedField<Vec<String>>,
    managed_clusters: CachedField<HashSet<String>>,
    disabled_clusters: CachedField<HashSet<String>>,
    property_types: CachedField<HashMap<String, String>>,
}

impl SharedGrantCache {
    pub fn new(reader: Arc<dyn GrantReader>, cluster_api: Arc<dyn ClusterApi>, config: &CacheConfig) -> Self {
        let ttl = config.shared_ttl;
        Self {
            reader,
            cluster_api,
            timeout: config.external_call_timeout,
            cluster_scoped: CachedField::new(HashSet::new(), ttl),
            namespaces: CachedField::new(Vec::new(), ttl),
            managed_clusters: CachedField::new(HashSet::new(), ttl),
            disabled_clusters: CachedField::new(HashSet::new(), ttl),
            property_types: CachedField::new(HashMap::new(), ttl),
        }
    }

    /// Returns every shared field, refreshing stale ones concurrently.
    ///
    /// Fails if any field could not be refreshed; callers deny on error.
    pub async fn shared_grant(&self) -> DomainResult<SharedGrant> {
        let (cluster_scoped_resources, namespaces, managed_clusters, disabled_clusters) = tokio::try_join!(
            self.cluster_scoped_resources(),
            self.namespaces(),
            self.managed_clusters(),
            self.disabled_clusters(),
        )?;

        Ok(SharedGrant {
            cluster_scoped_resources,
            namespaces,
            managed_clusters,
            disabled_clusters,
        })
    }

    #[instrument(skip(self))]
    pub async fn cluster_scoped_resources(&self) -> DomainResult<Arc<HashSet<Resource>>> {
        self.cluster_scoped
            .get_or_refresh(|| async {
                let resources = with_deadline(
                    "cluster-scoped resources query",
                    self.timeout,
                    self.reader.cluster_scoped_resources(),
                )
                .await?;
                debug!(count = resources.len(), "refreshed cluster-scoped resources");
                Ok(resources.into_iter().collect())
            })
            .await
    }

    #[instrument(skip(self))]
    pub async fn namespaces(&self) -> DomainResult<Arc<Vec<String>>> {
        self.namespaces
            .get_or_refresh(|| async {
                let mut namespaces =
                    with_deadline("namespace list", self.timeout, self.cluster_api.list_namespaces()).await?;
                namespaces.sort();
                namespaces.dedup();
                debug!(count = namespaces.len(), "refreshed namespaces");
                Ok(namespaces)
            })
            .await
    }

    /// Managed clusters, excluding the hub's own `local-cluster`.
    #[instrument(skip(self))]
    pub async fn managed_clusters(&self) -> DomainResult<Arc<HashSet<String>>> {
        self.managed_clusters
            .get_or_refresh(|| async {
                let clusters = with_deadline(
                    "managed cluster list",
                    self.timeout,
                    self.cluster_api.list_managed_clusters(),
                )
                .await?;
                let clusters: HashSet<String> = clusters
                    .into_iter()
                    .filter(|cluster| !cluster.is_local)
                    .map(|cluster| cluster.name)
                    .collect();
                debug!(count = clusters.len(), "refreshed managed clusters");
                Ok(clusters)
            })
            .await
    }

    /// Managed clusters where the search add-on is not installed.
    #[instrument(skip(self))]
    pub async fn disabled_clusters(&self) -> DomainResult<Arc<HashSet<String>>> {
        self.disabled_clusters
            .get_or_refresh(|| async {
                let clusters =
                    with_deadline("disabled clusters query", self.timeout, self.reader.disabled_clusters())
                        .await?;
                debug!(count = clusters.len(), "refreshed search-disabled clusters");
                Ok(clusters.into_iter().collect())
            })
            .await
    }

    #[instrument(skip(self))]
    pub async fn property_types(&self) -> DomainResult<Arc<HashMap<String, String>>> {
        self.property_types
            .get_or_refresh(|| async {
                with_deadline("property types query", self.timeout, self.reader.property_types()).await
            })
            .await
    }

    /// Disabled clusters visible to the owner of `grant`.
    pub async fn disabled_clusters_for(&self, grant: &UserGrant) -> DomainResult<HashSet<String>> {
        let disabled = self.disabled_clusters().await?;
        if grant.managed_cluster_all_access {
            return Ok((*disabled).clone());
        }
        Ok(disabled
            .iter()
            .filter(|cluster| grant.managed_clusters.contains(*cluster))
            .cloned()
            .collect())
    }

    /// Returns true if `kind` in `api_group` is not namespaced.
    ///
    /// Falls back to the built-in list when the store cannot be queried.
    pub async fn is_cluster_scoped(&self, api_group: &str, kind: &str) -> bool {
        let resource = Resource::new(api_group, kind);
        match self.cluster_scoped_resources().await {
            Ok(resources) if resources.contains(&resource) => true,
            _ => is_builtin_cluster_scoped(&resource),
        }
    }

    /// Records a new namespace without waiting for the next refresh.
    ///
    /// Managed and disabled clusters are expired because a namespace usually
    /// appears just before the managed cluster that owns it.
    pub async fn add_namespace(&self, namespace: &str) -> bool {
        let added = self
            .namespaces
            .update(|namespaces| match namespaces.binary_search_by(|n| n.as_str().cmp(namespace)) {
                Ok(_) => false,
                Err(position) => {
                    namespaces.insert(position, namespace.to_string());
                    true
                }
            })
            .await;
        if added {
            self.managed_clusters.expire().await;
            self.disabled_clusters.expire().await;
            info!(namespace, "namespace added to shared cache");
        }
        added
    }

    /// Removes a namespace and any managed cluster of the same name.
    pub async fn remove_namespace(&self, namespace: &str) -> bool {
        let removed = self
            .namespaces
            .update(|namespaces| {
                let before = namespaces.len();
                namespaces.retain(|n| n != namespace);
                namespaces.len() != before
            })
            .await;
        self.managed_clusters.update(|clusters| clusters.remove(namespace)).await;
        self.disabled_clusters.update(|clusters| clusters.remove(namespace)).await;
        if removed {
            info!(namespace, "namespace removed from shared cache");
        }
        removed
    }

    pub async fn add_managed_cluster(&self, cluster: &str) -> bool {
        let added = self
            .managed_clusters
            .update(|clusters| clusters.insert(cluster.to_string()))
            .await;
        if added {
            self.disabled_clusters.expire().await;
            info!(cluster, "managed cluster added to shared cache");
        }
        added
    }

    pub async fn remove_managed_cluster(&self, cluster: &str) -> bool {
        let removed = self.managed_clusters.update(|clusters| clusters.remove(cluster)).await;
        self.disabled_clusters.update(|clusters| clusters.remove(cluster)).await;
        if removed {
            info!(cluster, "managed cluster removed from shared cache");
        }
        removed
    }

    /// Forces every field to refresh on next read.
    pub async fn expire_all(&self) {
        self.cluster_scoped.expire().await;
        self.namespaces.expire().await;
        self.managed_clusters.expire().await;
        self.disabled_clusters.expire().await;
        self.property_types.expire().await;
    }

    pub async fn status(&self) -> Vec<(&'static str, FieldStatus)> {
        vec![
            ("cluster_scoped_resources", self.cluster_scoped.status().await),
            ("namespaces", self.namespaces.status().await),
            ("managed_clusters", self.managed_clusters.status().await),
            ("disabled_clusters", self.disabled_clusters.status().await),
            ("property_types", self.property_types.status().await),
        ]
    }
}
