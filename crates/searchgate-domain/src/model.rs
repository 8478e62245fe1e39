//! Value types shared by the cache tiers.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Wildcard used by Kubernetes RBAC for "any group", "any kind" and "any namespace".
pub const WILDCARD: &str = "*";

/// A resource kind identified by API group and plural kind name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Resource {
    pub api_group: String,
    pub kind: String,
}

impl Resource {
    pub fn new(api_group: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            api_group: api_group.into(),
            kind: kind.into(),
        }
    }

    /// The `*`/`*` resource, meaning every kind in every group.
    pub fn wildcard() -> Self {
        Self::new(WILDCARD, WILDCARD)
    }

    pub fn is_wildcard(&self) -> bool {
        self.api_group == WILDCARD && self.kind == WILDCARD
    }

    /// Returns true if this grant entry covers `other`.
    pub fn covers(&self, other: &Resource) -> bool {
        (self.api_group == WILDCARD || self.api_group == other.api_group)
            && (self.kind == WILDCARD || self.kind == other.kind)
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.api_group.is_empty() {
            write!(f, "{}", self.kind)
        } else {
            write!(f, "{}.{}", self.kind, self.api_group)
        }
    }
}

/// The principal behind a verified token.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    pub uid: String,
    pub username: String,
    pub groups: Vec<String>,
    pub extra: BTreeMap<String, Vec<String>>,
}

impl UserInfo {
    pub fn new(uid: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            uid: uid.into(),
            username: username.into(),
            ..Default::default()
        }
    }

    pub fn with_groups<I, S>(mut self, groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.groups = groups.into_iter().map(Into::into).collect();
        self
    }
}

/// Response of the identity provider for a single token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenReview {
    pub authenticated: bool,
    pub user: UserInfo,
}

/// Attributes of a single "can this principal do X" check.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceAttributes {
    pub verb: String,
    pub api_group: String,
    pub kind: String,
    /// `None` checks across all namespaces (or a cluster-scoped kind).
    pub namespace: Option<String>,
}

impl ResourceAttributes {
    pub fn new(verb: impl Into<String>, api_group: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            verb: verb.into(),
            api_group: api_group.into(),
            kind: kind.into(),
            namespace: None,
        }
    }

    pub fn in_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }
}

/// One rule returned by a rules review for a namespace.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceRule {
    pub verbs: Vec<String>,
    pub api_groups: Vec<String>,
    pub resources: Vec<String>,
    pub resource_names: Vec<String>,
}

/// A managed cluster as reported by the cluster API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagedCluster {
    pub name: String,
    /// Set when the cluster carries the `local-cluster` label.
    pub is_local: bool,
}

/// Resource types whose changes can affect authorization decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WatchedKind {
    Namespaces,
    Roles,
    ClusterRoles,
    RoleBindings,
    ClusterRoleBindings,
    Groups,
    ManagedClusters,
}

impl WatchedKind {
    pub const ALL: [WatchedKind; 7] = [
        WatchedKind::Namespaces,
        WatchedKind::Roles,
        WatchedKind::ClusterRoles,
        WatchedKind::RoleBindings,
        WatchedKind::ClusterRoleBindings,
        WatchedKind::Groups,
        WatchedKind::ManagedClusters,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            WatchedKind::Namespaces => "namespaces",
            WatchedKind::Roles => "roles",
            WatchedKind::ClusterRoles => "clusterroles",
            WatchedKind::RoleBindings => "rolebindings",
            WatchedKind::ClusterRoleBindings => "clusterrolebindings",
            WatchedKind::Groups => "groups",
            WatchedKind::ManagedClusters => "managedclusters",
        }
    }
}

impl fmt::Display for WatchedKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Event type of a watch stream item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEventType {
    Added,
    Modified,
    Deleted,
    /// Bookmarks, server-side errors and anything else the stream produces.
    Other(String),
}

/// A single event from a cluster API watch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub event_type: WatchEventType,
    /// Name of the object the event refers to, empty for non-object events.
    pub name: String,
    /// Set for managed clusters that carry the `local-cluster` label.
    pub is_local: bool,
}

impl WatchEvent {
    pub fn added(name: impl Into<String>) -> Self {
        Self::object(WatchEventType::Added, name)
    }

    pub fn modified(name: impl Into<String>) -> Self {
        Self::object(WatchEventType::Modified, name)
    }

    pub fn deleted(name: impl Into<String>) -> Self {
        Self::object(WatchEventType::Deleted, name)
    }

    pub fn other(kind: impl Into<String>) -> Self {
        Self {
            event_type: WatchEventType::Other(kind.into()),
            name: String::new(),
            is_local: false,
        }
    }

    fn object(event_type: WatchEventType, name: impl Into<String>) -> Self {
        Self {
            event_type,
            name: name.into(),
            is_local: false,
        }
    }
}
