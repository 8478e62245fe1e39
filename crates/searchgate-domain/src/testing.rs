//! Counting mocks of the external-system traits for unit tests.

use async_trait::async_trait;
use futures::StreamExt;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::error::{DomainError, DomainResult};
use crate::grants::fine_grained::UserPermission;
use crate::model::{
    ManagedCluster, Resource, ResourceAttributes, ResourceRule, TokenReview, UserInfo, WatchEvent, WatchedKind,
};
use crate::traits::{AccessReviewer, ClusterApi, GrantReader, IdentityProvider, PermissionSource, WatchStream};

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ============================================================================
// Identity provider
// ============================================================================

#[derive(Default)]
pub struct MockIdentityProvider {
    pub calls: AtomicUsize,
    pub fail: AtomicBool,
    delay: Duration,
    reviews: Mutex<HashMap<String, TokenReview>>,
}

impl MockIdentityProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_user(self, token: &str, user: UserInfo) -> Self {
        lock(&self.reviews).insert(
            token.to_string(),
            TokenReview {
                authenticated: true,
                user,
            },
        );
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl IdentityProvider for MockIdentityProvider {
    async fn review_token(&self, token: &str) -> DomainResult<TokenReview> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(DomainError::IdentityProviderError {
                message: "identity provider unreachable".to_string(),
            });
        }
        Ok(lock(&self.reviews).get(token).cloned().unwrap_or(TokenReview {
            authenticated: false,
            user: UserInfo::default(),
        }))
    }
}

// ============================================================================
// Access reviewer
// ============================================================================

type AccessKey = (String, String, String, String, Option<String>);

#[derive(Default)]
pub struct MockAccessReviewer {
    pub access_calls: AtomicUsize,
    pub rules_calls: AtomicUsize,
    pub fail_access: AtomicBool,
    admins: Mutex<HashSet<String>>,
    allowed: Mutex<HashSet<AccessKey>>,
    rules: Mutex<HashMap<(String, String), Vec<ResourceRule>>>,
    failing_namespaces: Mutex<HashSet<String>>,
}

impl MockAccessReviewer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn admin(&self, uid: &str) {
        lock(&self.admins).insert(uid.to_string());
    }

    pub fn allow(&self, uid: &str, verb: &str, group: &str, kind: &str, namespace: Option<&str>) {
        lock(&self.allowed).insert((
            uid.to_string(),
            verb.to_string(),
            group.to_string(),
            kind.to_string(),
            namespace.map(str::to_string),
        ));
    }

    pub fn rules(&self, uid: &str, namespace: &str, rules: Vec<ResourceRule>) {
        lock(&self.rules).insert((uid.to_string(), namespace.to_string()), rules);
    }

    pub fn fail_namespace(&self, namespace: &str) {
        lock(&self.failing_namespaces).insert(namespace.to_string());
    }

    pub fn access_call_count(&self) -> usize {
        self.access_calls.load(Ordering::SeqCst)
    }

    pub fn rules_call_count(&self) -> usize {
        self.rules_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AccessReviewer for MockAccessReviewer {
    async fn review_access(&self, principal: &UserInfo, attributes: &ResourceAttributes) -> DomainResult<bool> {
        self.access_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_access.load(Ordering::SeqCst) {
            return Err(DomainError::AuthorizationReviewError {
                message: "review failed".to_string(),
            });
        }
        if lock(&self.admins).contains(&principal.uid) {
            return Ok(true);
        }
        let key = (
            principal.uid.clone(),
            attributes.verb.clone(),
            attributes.api_group.clone(),
            attributes.kind.clone(),
            attributes.namespace.clone(),
        );
        Ok(lock(&self.allowed).contains(&key))
    }

    async fn review_rules(&self, principal: &UserInfo, namespace: &str) -> DomainResult<Vec<ResourceRule>> {
        self.rules_calls.fetch_add(1, Ordering::SeqCst);
        if lock(&self.failing_namespaces).contains(namespace) {
            return Err(DomainError::AuthorizationReviewError {
                message: format!("rules review failed in {namespace}"),
            });
        }
        Ok(lock(&self.rules)
            .get(&(principal.uid.clone(), namespace.to_string()))
            .cloned()
            .unwrap_or_default())
    }
}

pub fn rule(verbs: &[&str], groups: &[&str], resources: &[&str]) -> ResourceRule {
    ResourceRule {
        verbs: verbs.iter().map(|s| s.to_string()).collect(),
        api_groups: groups.iter().map(|s| s.to_string()).collect(),
        resources: resources.iter().map(|s| s.to_string()).collect(),
        resource_names: Vec::new(),
    }
}

// ============================================================================
// Cluster API
// ============================================================================

#[derive(Default)]
pub struct MockClusterApi {
    pub namespace_calls: AtomicUsize,
    pub cluster_calls: AtomicUsize,
    pub watch_opens: AtomicUsize,
    namespaces: Mutex<Vec<String>>,
    clusters: Mutex<Vec<ManagedCluster>>,
    watchers: Mutex<HashMap<WatchedKind, mpsc::UnboundedSender<DomainResult<WatchEvent>>>>,
}

impl MockClusterApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_namespaces(self, namespaces: &[&str]) -> Self {
        *lock(&self.namespaces) = namespaces.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_clusters(self, clusters: &[&str]) -> Self {
        *lock(&self.clusters) = clusters
            .iter()
            .map(|name| ManagedCluster {
                name: name.to_string(),
                is_local: *name == "local-cluster",
            })
            .collect();
        self
    }

    /// Pushes an event into the currently open watch for `kind`.
    pub fn emit(&self, kind: WatchedKind, event: WatchEvent) -> bool {
        lock(&self.watchers)
            .get(&kind)
            .is_some_and(|tx| tx.send(Ok(event)).is_ok())
    }

    /// Ends the currently open watch for `kind`.
    pub fn close_watch(&self, kind: WatchedKind) {
        lock(&self.watchers).remove(&kind);
    }

    pub fn is_watching(&self, kind: WatchedKind) -> bool {
        lock(&self.watchers).get(&kind).is_some_and(|tx| !tx.is_closed())
    }
}

#[async_trait]
impl ClusterApi for MockClusterApi {
    async fn list_namespaces(&self) -> DomainResult<Vec<String>> {
        self.namespace_calls.fetch_add(1, Ordering::SeqCst);
        Ok(lock(&self.namespaces).clone())
    }

    async fn list_managed_clusters(&self) -> DomainResult<Vec<ManagedCluster>> {
        self.cluster_calls.fetch_add(1, Ordering::SeqCst);
        Ok(lock(&self.clusters).clone())
    }

    async fn watch(&self, kind: WatchedKind) -> DomainResult<WatchStream> {
        self.watch_opens.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.watchers).insert(kind, tx);
        Ok(futures::stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|event| (event, rx)) }).boxed())
    }
}

// ============================================================================
// Grant reader
// ============================================================================

#[derive(Default)]
pub struct MockGrantReader {
    pub resource_calls: AtomicUsize,
    pub disabled_calls: AtomicUsize,
    pub property_calls: AtomicUsize,
    pub fail: AtomicBool,
    resources: Mutex<Vec<Resource>>,
    disabled: Mutex<Vec<String>>,
}

impl MockGrantReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_resources(self, resources: &[(&str, &str)]) -> Self {
        *lock(&self.resources) = resources.iter().map(|(g, k)| Resource::new(*g, *k)).collect();
        self
    }

    pub fn with_disabled(self, clusters: &[&str]) -> Self {
        *lock(&self.disabled) = clusters.iter().map(|s| s.to_string()).collect();
        self
    }

    fn check(&self) -> DomainResult<()> {
        if self.fail.load(Ordering::SeqCst) {
            Err(DomainError::StoreQueryError {
                message: "store unavailable".to_string(),
            })
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl GrantReader for MockGrantReader {
    async fn cluster_scoped_resources(&self) -> DomainResult<Vec<Resource>> {
        self.resource_calls.fetch_add(1, Ordering::SeqCst);
        self.check()?;
        Ok(lock(&self.resources).clone())
    }

    async fn disabled_clusters(&self) -> DomainResult<Vec<String>> {
        self.disabled_calls.fetch_add(1, Ordering::SeqCst);
        self.check()?;
        Ok(lock(&self.disabled).clone())
    }

    async fn property_types(&self) -> DomainResult<HashMap<String, String>> {
        self.property_calls.fetch_add(1, Ordering::SeqCst);
        self.check()?;
        Ok(HashMap::from([
            ("kind".to_string(), "string".to_string()),
            ("cpu".to_string(), "number".to_string()),
        ]))
    }
}

// ============================================================================
// Permission source
// ============================================================================

#[derive(Default)]
pub struct MockPermissionSource {
    pub calls: AtomicUsize,
    permissions: Mutex<HashMap<String, Vec<UserPermission>>>,
}

impl MockPermissionSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn grant(&self, uid: &str, permissions: Vec<UserPermission>) {
        lock(&self.permissions).insert(uid.to_string(), permissions);
    }
}

#[async_trait]
impl PermissionSource for MockPermissionSource {
    async fn user_permissions(&self, principal: &UserInfo) -> DomainResult<Vec<UserPermission>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(lock(&self.permissions).get(&principal.uid).cloned().unwrap_or_default())
    }
}
