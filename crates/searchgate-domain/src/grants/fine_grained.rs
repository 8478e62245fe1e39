//! Fine-grained permissions resolved per (cluster, namespace, group, kind).
//!
//! Permission records bind policy rules to clusters and namespaces. Rules
//! are filtered to the verb of interest, then consolidated per cluster:
//! an admin rule overrides everything else on its cluster and identical
//! rules on the same cluster merge their namespaces.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::warn;

use crate::model::WILDCARD;

/// Verbs, groups and plural kinds granted by one rule.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PolicyRule {
    pub verbs: Vec<String>,
    pub api_groups: Vec<String>,
    pub resources: Vec<String>,
}

impl PolicyRule {
    pub fn new(verbs: &[&str], api_groups: &[&str], resources: &[&str]) -> Self {
        let owned = |values: &[&str]| values.iter().map(|v| v.to_string()).collect();
        Self {
            verbs: owned(verbs),
            api_groups: owned(api_groups),
            resources: owned(resources),
        }
    }

    /// `*` verbs on `*` resources in `*` groups.
    pub fn admin() -> Self {
        Self::new(&[WILDCARD], &[WILDCARD], &[WILDCARD])
    }

    pub fn is_admin(&self) -> bool {
        *self == Self::admin()
    }

    fn covers(&self, api_group: &str, kind: &str) -> bool {
        let matches = |values: &[String], wanted: &str| values.iter().any(|v| v == WILDCARD || v == wanted);
        matches(&self.api_groups, api_group) && matches(&self.resources, kind)
    }
}

/// Where a permission record applies.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionBinding {
    pub cluster: String,
    /// Namespaces on the cluster; `*` means every namespace and cluster-scoped kinds.
    pub namespaces: Vec<String>,
}

/// One permission record as published by the permission source.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserPermission {
    pub name: String,
    pub rules: Vec<PolicyRule>,
    pub bindings: Vec<PermissionBinding>,
}

/// A consolidated rule and every cluster it applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermissionRule {
    pub rule: PolicyRule,
    pub clusters: BTreeSet<String>,
    pub namespaces: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ClusterRule {
    rule: PolicyRule,
    namespaces: BTreeSet<String>,
}

impl ClusterRule {
    fn covers_namespace(&self, namespace: Option<&str>) -> bool {
        self.namespaces.contains(WILDCARD) || namespace.is_some_and(|ns| self.namespaces.contains(ns))
    }
}

/// Consolidated allow-set for one user.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FineGrainedGrant {
    clusters: BTreeMap<String, Vec<ClusterRule>>,
}

impl FineGrainedGrant {
    /// Builds the grant from permission records, keeping rules that allow `verb`.
    pub fn from_permissions(permissions: &[UserPermission], verb: &str) -> Self {
        let mut grant = Self::default();
        for permission in permissions {
            for rule in &permission.rules {
                if rule.api_groups.is_empty() || rule.resources.is_empty() {
                    warn!(permission = %permission.name, ?rule, "skipping malformed permission rule");
                    continue;
                }
                let Some(rule) = narrow_to_verb(rule, verb) else {
                    continue;
                };
                for binding in &permission.bindings {
                    if binding.cluster.is_empty() {
                        warn!(permission = %permission.name, "skipping binding without a cluster");
                        continue;
                    }
                    grant.add(&binding.cluster, rule.clone(), binding.namespaces.iter().cloned().collect());
                }
            }
        }
        grant
    }

    fn add(&mut self, cluster: &str, rule: PolicyRule, namespaces: BTreeSet<String>) {
        let existing = self.clusters.entry(cluster.to_string()).or_default();

        if rule.is_admin() {
            *existing = vec![ClusterRule { rule, namespaces }];
            return;
        }
        if existing.iter().any(|current| current.rule.is_admin()) {
            return;
        }
        if let Some(current) = existing.iter_mut().find(|current| current.rule == rule) {
            current.namespaces.extend(namespaces);
            return;
        }
        existing.push(ClusterRule { rule, namespaces });
    }

    /// Returns true if the grant allows `kind` in `api_group` at the given location.
    ///
    /// `namespace == None` denotes a cluster-scoped object, which needs a `*`
    /// namespace binding.
    pub fn allows(&self, cluster: &str, namespace: Option<&str>, api_group: &str, kind: &str) -> bool {
        self.clusters.get(cluster).is_some_and(|rules| {
            rules
                .iter()
                .any(|rule| rule.covers_namespace(namespace) && rule.rule.covers(api_group, kind))
        })
    }

    pub fn is_cluster_admin(&self, cluster: &str) -> bool {
        self.clusters
            .get(cluster)
            .is_some_and(|rules| rules.iter().any(|rule| rule.rule.is_admin() && rule.namespaces.contains(WILDCARD)))
    }

    pub fn clusters(&self) -> impl Iterator<Item = &str> {
        self.clusters.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.clusters.is_empty()
    }

    /// Merges identical (rule, namespaces) pairs across clusters.
    pub fn consolidated(&self) -> Vec<PermissionRule> {
        let mut merged: BTreeMap<(PolicyRule, BTreeSet<String>), BTreeSet<String>> = BTreeMap::new();
        for (cluster, rules) in &self.clusters {
            for rule in rules {
                merged
                    .entry((rule.rule.clone(), rule.namespaces.clone()))
                    .or_default()
                    .insert(cluster.clone());
            }
        }
        merged
            .into_iter()
            .map(|((rule, namespaces), clusters)| PermissionRule {
                rule,
                clusters,
                namespaces,
            })
            .collect()
    }
}

/// Returns the rule restricted to `verb`, or `None` if it does not grant it.
fn narrow_to_verb(rule: &PolicyRule, verb: &str) -> Option<PolicyRule> {
    if rule.verbs.iter().any(|v| v == WILDCARD) {
        return Some(rule.clone());
    }
    if rule.verbs.iter().any(|v| v == verb) {
        return Some(PolicyRule {
            verbs: vec![verb.to_string()],
            ..rule.clone()
        });
    }
    None
}
