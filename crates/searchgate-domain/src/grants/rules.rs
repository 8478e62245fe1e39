//! Interpretation of RBAC rules returned by a namespace rules review.

use std::collections::BTreeSet;
use tracing::trace;

use crate::model::{Resource, ResourceRule, WILDCARD};

/// API group of the resource that grants access to a managed cluster.
pub const MANAGED_CLUSTER_VIEW_GROUP: &str = "view.open-cluster-management.io";

/// Plural kind of the resource that grants access to a managed cluster.
pub const MANAGED_CLUSTER_VIEWS: &str = "managedclusterviews";

/// Name and label of the hub's own cluster.
pub const LOCAL_CLUSTER: &str = "local-cluster";

const CONSOLE_GROUP: &str = "console.openshift.io";

/// Platform kinds that are cluster-scoped even when absent from the store.
const BUILTIN_CLUSTER_SCOPED: &[(&str, &str)] = &[
    ("authorization.openshift.io", "clusterroles"),
    ("", "clusterroles"),
    (CONSOLE_GROUP, "consoleexternalloglinks"),
    (CONSOLE_GROUP, "consolelinks"),
    (CONSOLE_GROUP, "consolenotifications"),
    (CONSOLE_GROUP, "consoleyamlsamples"),
    ("project.openshift.io", "projects"),
    ("", "projects"),
    ("project.openshift.io", "projectrequests"),
    ("", "projectrequests"),
    ("oauth.openshift.io", "useroauthaccesstokens"),
];

pub fn is_builtin_cluster_scoped(resource: &Resource) -> bool {
    BUILTIN_CLUSTER_SCOPED
        .iter()
        .any(|(group, kind)| resource.api_group == *group && resource.kind == *kind)
}

/// What a user may do in one namespace, derived from its rules.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NamespaceAccess {
    /// Listable namespaced resources, or just `*`/`*` for full access.
    pub resources: BTreeSet<Resource>,
    /// The rules grant every verb on every resource in the namespace.
    pub full_access: bool,
    /// The rules allow creating managed cluster views in the namespace.
    pub can_view_cluster: bool,
}

fn lists(verb: &str) -> bool {
    verb == "list" || verb == WILDCARD
}

fn creates(verb: &str) -> bool {
    verb == "create" || verb == WILDCARD
}

fn unrestricted_names(rule: &ResourceRule) -> bool {
    rule.resource_names.first().map_or(true, |name| name == WILDCARD)
}

/// Evaluates the rules a user holds in a namespace.
///
/// A rule contributes a resource when it allows `list` (or `*`), does not
/// restrict to specific object names, and the resource is namespaced. A
/// `*`/`*` rule grants the whole namespace and stops evaluation.
pub fn evaluate_namespace_rules(
    rules: &[ResourceRule],
    is_cluster_scoped: impl Fn(&Resource) -> bool,
) -> NamespaceAccess {
    let mut access = NamespaceAccess::default();

    for rule in rules {
        if rule.verbs.iter().any(|verb| lists(verb)) && unrestricted_names(rule) {
            for kind in &rule.resources {
                for group in &rule.api_groups {
                    let resource = Resource::new(group.as_str(), kind.as_str());
                    if resource.is_wildcard() {
                        access.resources = BTreeSet::from([Resource::wildcard()]);
                        access.full_access = true;
                        access.can_view_cluster = true;
                        return access;
                    }
                    if is_cluster_scoped(&resource) {
                        trace!(%resource, "skipping cluster-scoped resource from rules review");
                        continue;
                    }
                    access.resources.insert(resource);
                }
            }
        }

        let views_clusters = rule.verbs.iter().any(|verb| creates(verb))
            && rule.resources.iter().any(|kind| kind == MANAGED_CLUSTER_VIEWS || kind == WILDCARD)
            && rule
                .api_groups
                .iter()
                .any(|group| group == MANAGED_CLUSTER_VIEW_GROUP || group == WILDCARD);
        if views_clusters {
            access.can_view_cluster = true;
        }
    }

    access
}
