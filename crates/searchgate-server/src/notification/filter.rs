//! Subscription filters evaluated against every change event.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

use searchgate_domain::model::WILDCARD;
use searchgate_domain::UserGrant;

use super::error::{NotificationError, NotificationResult};
use super::event::{ChangeEvent, Operation};

/// The hub cluster's name as it appears in change payloads.
pub const HUB_CLUSTER: &str = "local-cluster";

const FORBIDDEN_LABEL_CHARS: [char; 4] = ['*', '!', '<', '>'];

/// What a subscriber wants to see. Empty fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubscriptionFilter {
    pub kinds: Vec<String>,
    pub namespaces: Vec<String>,
    pub clusters: Vec<String>,
    pub labels: BTreeMap<String, String>,
    pub properties: BTreeMap<String, Value>,
    pub operations: Vec<String>,
}

impl SubscriptionFilter {
    pub fn builder() -> FilterBuilder {
        FilterBuilder::default()
    }

    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
            && self.namespaces.is_empty()
            && self.clusters.is_empty()
            && self.labels.is_empty()
            && self.properties.is_empty()
            && self.operations.is_empty()
    }

    /// Returns true if `event` passes every populated criterion.
    pub fn matches(&self, event: &ChangeEvent) -> bool {
        if !self.operations.is_empty()
            && !self
                .operations
                .iter()
                .any(|op| op == event.operation.as_str())
        {
            return false;
        }

        if !self.clusters.is_empty() && !self.clusters.iter().any(|c| *c == event.cluster) {
            return false;
        }

        let Some(data) = event.data() else {
            return false;
        };

        if !self.kinds.is_empty() {
            let Some(kind) = event.kind() else {
                return false;
            };
            if !self.kinds.iter().any(|k| k.eq_ignore_ascii_case(kind)) {
                return false;
            }
        }

        if !self.namespaces.is_empty() {
            let namespace = event.namespace().unwrap_or_default();
            if !self.namespaces.iter().any(|ns| ns == namespace) {
                return false;
            }
        }

        if !self.labels.is_empty() {
            let Some(labels) = event.labels() else {
                return false;
            };
            let all_present = self.labels.iter().all(|(key, expected)| {
                labels
                    .get(key)
                    .and_then(Value::as_str)
                    .is_some_and(|actual| actual == expected)
            });
            if !all_present {
                return false;
            }
        }

        self.properties
            .iter()
            .all(|(key, expected)| data.get(key) == Some(expected))
    }

    pub fn validate(&self) -> NotificationResult<()> {
        for op in &self.operations {
            if op.parse::<Operation>().is_err() {
                return Err(NotificationError::InvalidFilter {
                    message: format!("invalid operation: {op} (must be INSERT, UPDATE, or DELETE)"),
                });
            }
        }

        for (key, value) in &self.labels {
            if key.is_empty() {
                return Err(NotificationError::InvalidFilter {
                    message: "label key must not be empty".to_string(),
                });
            }
            if value.contains(FORBIDDEN_LABEL_CHARS) {
                return Err(NotificationError::InvalidFilter {
                    message: format!("label {key} must be an exact value, got {value}"),
                });
            }
        }

        Ok(())
    }

    /// Restricts the filter to what `grant` may see. Cluster admins keep the filter as is.
    ///
    /// Clusters are intersected with the user's managed clusters (or set to
    /// them when the filter names none). The hub stays reachable when the user
    /// has any namespaced grant there. Namespaces are only intersected when the
    /// filter already names some. Returns `None` when nothing visible remains,
    /// since an emptied criterion would otherwise match everything.
    pub fn narrow_to_grant(&self, grant: &UserGrant) -> Option<SubscriptionFilter> {
        if grant.is_cluster_admin {
            return Some(self.clone());
        }

        let mut narrowed = self.clone();

        if !grant.managed_cluster_all_access {
            let hub_visible = !grant.namespaced_resources.is_empty();
            let allowed = |cluster: &str| {
                grant.managed_clusters.contains(cluster) || (hub_visible && cluster == HUB_CLUSTER)
            };

            narrowed.clusters = if self.clusters.is_empty() {
                let mut clusters: Vec<String> = grant.managed_clusters.iter().cloned().collect();
                if hub_visible {
                    clusters.push(HUB_CLUSTER.to_string());
                }
                clusters.sort();
                clusters
            } else {
                self.clusters
                    .iter()
                    .filter(|cluster| allowed(cluster.as_str()))
                    .cloned()
                    .collect()
            };
            if narrowed.clusters.is_empty() {
                return None;
            }
        }

        if !self.namespaces.is_empty() && !grant.namespaced_resources.contains_key(WILDCARD) {
            narrowed.namespaces = self
                .namespaces
                .iter()
                .filter(|ns| grant.namespaced_resources.contains_key(ns.as_str()))
                .cloned()
                .collect();
            if narrowed.namespaces.is_empty() {
                return None;
            }
        }

        Some(narrowed)
    }
}

impl fmt::Display for SubscriptionFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if !self.operations.is_empty() {
            parts.push(format!("operations:{:?}", self.operations));
        }
        if !self.kinds.is_empty() {
            parts.push(format!("kinds:{:?}", self.kinds));
        }
        if !self.namespaces.is_empty() {
            parts.push(format!("namespaces:{:?}", self.namespaces));
        }
        if !self.clusters.is_empty() {
            parts.push(format!("clusters:{:?}", self.clusters));
        }
        if !self.labels.is_empty() {
            parts.push(format!("labels:{:?}", self.labels));
        }
        if !self.properties.is_empty() {
            let properties: BTreeMap<&str, String> = self
                .properties
                .iter()
                .map(|(key, value)| (key.as_str(), value.to_string()))
                .collect();
            parts.push(format!("properties:{properties:?}"));
        }

        if parts.is_empty() {
            f.write_str("no-filters")
        } else {
            f.write_str(&parts.join(","))
        }
    }
}

/// Fluent construction of a [`SubscriptionFilter`].
#[derive(Debug, Default)]
pub struct FilterBuilder {
    filter: SubscriptionFilter,
}

impl FilterBuilder {
    pub fn kinds<I, S>(mut self, kinds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.filter.kinds.extend(kinds.into_iter().map(Into::into));
        self
    }

    pub fn namespaces<I, S>(mut self, namespaces: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.filter
            .namespaces
            .extend(namespaces.into_iter().map(Into::into));
        self
    }

    pub fn clusters<I, S>(mut self, clusters: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.filter
            .clusters
            .extend(clusters.into_iter().map(Into::into));
        self
    }

    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.filter.labels.insert(key.into(), value.into());
        self
    }

    pub fn property(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filter.properties.insert(key.into(), value.into());
        self
    }

    pub fn operations(mut self, operations: impl IntoIterator<Item = Operation>) -> Self {
        self.filter
            .operations
            .extend(operations.into_iter().map(|op| op.as_str().to_string()));
        self
    }

    pub fn build(self) -> SubscriptionFilter {
        self.filter
    }
}
