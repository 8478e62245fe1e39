//! Per-user grants resolved through impersonated access reviews.
//!
//! A user's entry is created on first request and never removed; the
//! background invalidator only expires it. Entries are keyed by UID in
//! `UserGrantCache::users`, which is where an idle-entry sweep would hook in.

use futures::stream::{self, StreamExt};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, instrument, warn};

use crate::config::{with_deadline, CacheConfig};
use crate::error::DomainResult;
use crate::freshness::CachedField;
use crate::grants::fine_grained::FineGrainedGrant;
use crate::grants::rules::{evaluate_namespace_rules, is_builtin_cluster_scoped};
use crate::grants::shared::SharedGrantCache;
use crate::model::{Resource, ResourceAttributes, UserInfo, WILDCARD};
use crate::traits::{AccessReviewer, PermissionSource};

/// Everything one user may list, as of the last refresh.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserGrant {
    pub is_cluster_admin: bool,
    pub cluster_scoped_resources: BTreeSet<Resource>,
    /// Namespace to listable resources. The `*` namespace applies everywhere.
    pub namespaced_resources: BTreeMap<String, BTreeSet<Resource>>,
    pub managed_clusters: HashSet<String>,
    pub managed_cluster_all_access: bool,
    pub fine_grained: Option<Arc<FineGrainedGrant>>,
}

impl UserGrant {
    /// Returns true if the user may list `resource` in `namespace`, or
    /// cluster-wide when `namespace` is `None`.
    pub fn can_list(&self, namespace: Option<&str>, resource: &Resource) -> bool {
        let covered = |grants: Option<&BTreeSet<Resource>>| grants.is_some_and(|set| set.iter().any(|g| g.covers(resource)));
        match namespace {
            Some(ns) => covered(self.namespaced_resources.get(WILDCARD)) || covered(self.namespaced_resources.get(ns)),
            None => self.cluster_scoped_resources.iter().any(|g| g.covers(resource)),
        }
    }

    pub fn can_access_cluster(&self, cluster: &str) -> bool {
        self.managed_cluster_all_access || self.managed_clusters.contains(cluster)
    }

    /// Groups namespaces that share an identical resource set.
    pub fn consolidated_namespaces(&self) -> Vec<(Vec<String>, BTreeSet<Resource>)> {
        let mut groups: BTreeMap<&BTreeSet<Resource>, Vec<String>> = BTreeMap::new();
        for (namespace, resources) in &self.namespaced_resources {
            groups.entry(resources).or_default().push(namespace.clone());
        }
        groups
            .into_iter()
            .map(|(resources, namespaces)| (namespaces, resources.clone()))
            .collect()
    }

    fn cluster_admin(managed_clusters: HashSet<String>) -> Self {
        Self {
            is_cluster_admin: true,
            cluster_scoped_resources: BTreeSet::from([Resource::wildcard()]),
            namespaced_resources: BTreeMap::from([(WILDCARD.to_string(), BTreeSet::from([Resource::wildcard()]))]),
            managed_clusters,
            managed_cluster_all_access: true,
            fine_grained: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
struct NamespacedGrant {
    resources: BTreeMap<String, BTreeSet<Resource>>,
    clusters: HashSet<String>,
}

struct UserGrantEntry {
    admin: CachedField<bool>,
    cluster_scoped: CachedField<BTreeSet<Resource>>,
    namespaced: CachedField<NamespacedGrant>,
    fine_grained: CachedField<FineGrainedGrant>,
    fine_grained_watch: CachedField<FineGrainedGrant>,
}

impl UserGrantEntry {
    fn new(ttl: Duration) -> Self {
        Self {
            admin: CachedField::new(false, ttl),
            cluster_scoped: CachedField::new(BTreeSet::new(), ttl),
            namespaced: CachedField::new(NamespacedGrant::default(), ttl),
            fine_grained: CachedField::new(FineGrainedGrant::default(), ttl),
            fine_grained_watch: CachedField::new(FineGrainedGrant::default(), ttl),
        }
    }

    async fn expire(&self) {
        self.admin.expire().await;
        self.cluster_scoped.expire().await;
        self.namespaced.expire().await;
        self.fine_grained.expire().await;
        self.fine_grained_watch.expire().await;
    }
}

/// Lazily resolved [`UserGrant`]s keyed by user UID.
pub struct UserGrantCache {
    shared: Arc<SharedGrantCache>,
    reviewer: Arc<dyn AccessReviewer>,
    permissions: Option<Arc<dyn PermissionSource>>,
    users: RwLock<HashMap<String, Arc<UserGrantEntry>>>,
    ttl: Duration,
    timeout: Duration,
    review_concurrency: usize,
    fine_grained: bool,
}

impl UserGrantCache {
    pub fn new(
        shared: Arc<SharedGrantCache>,
        reviewer: Arc<dyn AccessReviewer>,
        permissions: Option<Arc<dyn PermissionSource>>,
        config: &CacheConfig,
    ) -> Self {
        Self {
            shared,
            reviewer,
            permissions,
            users: RwLock::new(HashMap::new()),
            ttl: config.user_ttl,
            timeout: config.external_call_timeout,
            review_concurrency: config.review_concurrency.max(1),
            fine_grained: config.fine_grained,
        }
    }

    /// Returns the user's grant, refreshing any stale part first.
    #[instrument(skip_all, fields(uid = %user.uid))]
    pub async fn user_grant(&self, user: &UserInfo) -> DomainResult<UserGrant> {
        let entry = self.entry(&user.uid);

        let fine_grained = self.fine_grained_for(&entry.fine_grained, user, "list").await?;

        if self.is_cluster_admin(&entry, user).await {
            let managed = self.shared.managed_clusters().await?;
            let mut grant = UserGrant::cluster_admin((*managed).clone());
            grant.fine_grained = fine_grained;
            return Ok(grant);
        }

        let (cluster_scoped, namespaced) = tokio::try_join!(
            entry
                .cluster_scoped
                .get_or_refresh(|| self.resolve_cluster_scoped(user)),
            entry.namespaced.get_or_refresh(|| self.resolve_namespaced(user)),
        )?;

        Ok(UserGrant {
            is_cluster_admin: false,
            cluster_scoped_resources: (*cluster_scoped).clone(),
            namespaced_resources: namespaced.resources.clone(),
            managed_clusters: namespaced.clusters.clone(),
            managed_cluster_all_access: false,
            fine_grained,
        })
    }

    /// The user's fine-grained grant for the `watch` verb, used to gate live
    /// events. Resolves nothing else, and is `None` unless fine-grained mode is on.
    #[instrument(skip_all, fields(uid = %user.uid))]
    pub async fn watch_grant(&self, user: &UserInfo) -> DomainResult<Option<Arc<FineGrainedGrant>>> {
        let entry = self.entry(&user.uid);
        self.fine_grained_for(&entry.fine_grained_watch, user, "watch").await
    }

    async fn fine_grained_for(
        &self,
        field: &CachedField<FineGrainedGrant>,
        user: &UserInfo,
        verb: &'static str,
    ) -> DomainResult<Option<Arc<FineGrainedGrant>>> {
        let (Some(source), true) = (&self.permissions, self.fine_grained) else {
            return Ok(None);
        };
        let grant = field
            .get_or_refresh(|| async {
                let permissions =
                    with_deadline("user permission list", self.timeout, source.user_permissions(user)).await?;
                Ok(FineGrainedGrant::from_permissions(&permissions, verb))
            })
            .await?;
        Ok(Some(grant))
    }

    /// Expires every part of every user's grant. Returns the number of users.
    pub async fn invalidate_all(&self) -> usize {
        let entries = self.entries();
        for entry in &entries {
            entry.expire().await;
        }
        entries.len()
    }

    /// Drops a deleted namespace (and the cluster of the same name) from every grant.
    pub async fn forget_namespace(&self, namespace: &str) {
        for entry in self.entries() {
            entry
                .namespaced
                .update(|grant| {
                    grant.resources.remove(namespace);
                    grant.clusters.remove(namespace);
                })
                .await;
        }
    }

    /// Drops a deleted managed cluster from every grant.
    pub async fn forget_cluster(&self, cluster: &str) {
        for entry in self.entries() {
            entry
                .namespaced
                .update(|grant| {
                    grant.clusters.remove(cluster);
                })
                .await;
        }
    }

    pub fn user_count(&self) -> usize {
        self.users.read().map(|users| users.len()).unwrap_or_default()
    }

    fn entry(&self, uid: &str) -> Arc<UserGrantEntry> {
        if let Ok(users) = self.users.read() {
            if let Some(entry) = users.get(uid) {
                return entry.clone();
            }
        }
        let mut users = self.users.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        users
            .entry(uid.to_string())
            .or_insert_with(|| Arc::new(UserGrantEntry::new(self.ttl)))
            .clone()
    }

    fn entries(&self) -> Vec<Arc<UserGrantEntry>> {
        self.users
            .read()
            .map(|users| users.values().cloned().collect())
            .unwrap_or_default()
    }

    /// A failed probe is not cached as "not admin"; the next read retries it.
    async fn is_cluster_admin(&self, entry: &UserGrantEntry, user: &UserInfo) -> bool {
        let probe = entry
            .admin
            .get_or_refresh(|| async {
                let attributes = ResourceAttributes::new("list", WILDCARD, WILDCARD);
                with_deadline(
                    "cluster admin review",
                    self.timeout,
                    self.reviewer.review_access(user, &attributes),
                )
                .await
            })
            .await;
        match probe {
            Ok(admin) => *admin,
            Err(error) => {
                warn!(error = %error, "cluster admin review failed; resolving grants individually");
                false
            }
        }
    }

    async fn resolve_cluster_scoped(&self, user: &UserInfo) -> DomainResult<BTreeSet<Resource>> {
        metrics::counter!("searchgate_user_grant_refreshes_total", "part" => "cluster_scoped").increment(1);
        let resources = self.shared.cluster_scoped_resources().await?;
        let reviewer = &self.reviewer;
        let timeout = self.timeout;

        let decisions: Vec<(Resource, DomainResult<bool>)> = stream::iter(resources.iter().cloned())
            .map(|resource| async move {
                let attributes = ResourceAttributes::new("list", resource.api_group.clone(), resource.kind.clone());
                let allowed = with_deadline(
                    "cluster-scoped access review",
                    timeout,
                    reviewer.review_access(user, &attributes),
                )
                .await;
                (resource, allowed)
            })
            .buffer_unordered(self.review_concurrency)
            .collect()
            .await;

        let mut allowed = BTreeSet::new();
        for (resource, decision) in decisions {
            match decision {
                Ok(true) => {
                    allowed.insert(resource);
                }
                Ok(false) => {}
                Err(error) => warn!(%resource, error = %error, "access review failed; denying resource"),
            }
        }
        debug!(count = allowed.len(), "resolved cluster-scoped grants");
        Ok(allowed)
    }

    async fn resolve_namespaced(&self, user: &UserInfo) -> DomainResult<NamespacedGrant> {
        metrics::counter!("searchgate_user_grant_refreshes_total", "part" => "namespaced").increment(1);
        let (namespaces, managed, cluster_scoped) = tokio::try_join!(
            self.shared.namespaces(),
            self.shared.managed_clusters(),
            self.shared.cluster_scoped_resources(),
        )?;
        let reviewer = &self.reviewer;
        let timeout = self.timeout;

        let reviews: Vec<_> = stream::iter(namespaces.iter().cloned())
            .map(|namespace| async move {
                let rules = with_deadline(
                    "namespace rules review",
                    timeout,
                    reviewer.review_rules(user, &namespace),
                )
                .await;
                (namespace, rules)
            })
            .buffer_unordered(self.review_concurrency)
            .collect()
            .await;

        let is_cluster_scoped =
            |resource: &Resource| cluster_scoped.contains(resource) || is_builtin_cluster_scoped(resource);
        let mut grant = NamespacedGrant::default();
        for (namespace, rules) in reviews {
            let rules = match rules {
                Ok(rules) => rules,
                Err(error) => {
                    warn!(%namespace, error = %error, "rules review failed; denying namespace");
                    continue;
                }
            };
            let access = evaluate_namespace_rules(&rules, is_cluster_scoped);
            if access.can_view_cluster && managed.contains(&namespace) {
                grant.clusters.insert(namespace.clone());
            }
            if !access.resources.is_empty() {
                grant.resources.insert(namespace, access.resources);
            }
        }
        debug!(
            namespaces = grant.resources.len(),
            clusters = grant.clusters.len(),
            "resolved namespaced grants"
        );
        Ok(grant)
    }
}
