//! Fine-grained permission records read through the caller's own identity.
//!
//! `UserPermission` objects are computed per caller by the cluster-view API,
//! so they are listed with an impersonating client.

use async_trait::async_trait;
use kube::api::{Api, ApiResource, DynamicObject, GroupVersionKind, ListParams};
use kube::ResourceExt;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{instrument, warn};

use searchgate_domain::grants::{PermissionBinding, PolicyRule};
use searchgate_domain::{DomainError, DomainResult, PermissionSource, UserInfo, UserPermission};

use super::ImpersonatingReviewer;

fn user_permission_resource() -> ApiResource {
    ApiResource::from_gvk(&GroupVersionKind::gvk(
        "clusterview.open-cluster-management.io",
        "v1alpha1",
        "UserPermission",
    ))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UserPermissionStatus {
    #[serde(default)]
    cluster_role_definition: ClusterRoleDefinition,
    #[serde(default)]
    bindings: Vec<BindingDoc>,
}

#[derive(Debug, Default, Deserialize)]
struct ClusterRoleDefinition {
    #[serde(default)]
    rules: Vec<RuleDoc>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RuleDoc {
    #[serde(default)]
    verbs: Vec<String>,
    #[serde(default)]
    api_groups: Vec<String>,
    #[serde(default)]
    resources: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct BindingDoc {
    cluster: String,
    #[serde(default)]
    namespaces: Vec<String>,
}

/// Converts one `UserPermission` object. Objects without a readable status yield `None`.
pub fn parse_user_permission(object: &DynamicObject) -> Option<UserPermission> {
    let name = object.name_any();
    let status = object.data.get("status")?;
    let status: UserPermissionStatus = match serde_json::from_value(status.clone()) {
        Ok(status) => status,
        Err(e) => {
            warn!(permission = %name, error = %e, "Skipping UserPermission with unreadable status");
            return None;
        }
    };

    Some(UserPermission {
        name,
        rules: status
            .cluster_role_definition
            .rules
            .into_iter()
            .map(|r| PolicyRule {
                verbs: r.verbs,
                api_groups: r.api_groups,
                resources: r.resources,
            })
            .collect(),
        bindings: status
            .bindings
            .into_iter()
            .map(|b| PermissionBinding {
                cluster: b.cluster,
                namespaces: b.namespaces,
            })
            .collect(),
    })
}

pub struct KubePermissionSource {
    reviewer: Arc<ImpersonatingReviewer>,
}

impl KubePermissionSource {
    pub fn new(reviewer: Arc<ImpersonatingReviewer>) -> Self {
        Self { reviewer }
    }
}

#[async_trait]
impl PermissionSource for KubePermissionSource {
    #[instrument(skip(self, principal), fields(uid = %principal.uid))]
    async fn user_permissions(&self, principal: &UserInfo) -> DomainResult<Vec<UserPermission>> {
        let client = self.reviewer.client_for(principal).await?;
        let api: Api<DynamicObject> = Api::all_with(client, &user_permission_resource());
        let list = api
            .list(&ListParams::default())
            .await
            .map_err(|e| DomainError::PermissionSourceError {
                message: e.to_string(),
            })?;
        Ok(list.items.iter().filter_map(parse_user_permission).collect())
    }
}
