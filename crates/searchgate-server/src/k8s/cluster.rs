//! Namespace, managed cluster and RBAC object access for the shared cache and invalidator.

use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use k8s_openapi::api::core::v1::Namespace;
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, Role, RoleBinding};
use kube::api::{
    Api, ApiResource, DynamicObject, GroupVersionKind, ListParams, WatchEvent as KubeWatchEvent,
    WatchParams,
};
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use std::fmt::Debug;
use tracing::{debug, instrument};

use searchgate_domain::model::ManagedCluster;
use searchgate_domain::{ClusterApi, DomainResult, WatchEvent, WatchEventType, WatchStream, WatchedKind};

use super::{cluster_api_error, LOCAL_CLUSTER_LABEL};

/// Resource version "0" makes the server replay current objects as ADDED first.
const REPLAY_FROM_START: &str = "0";

fn managed_cluster_resource() -> ApiResource {
    ApiResource::from_gvk(&GroupVersionKind::gvk(
        "cluster.open-cluster-management.io",
        "v1",
        "ManagedCluster",
    ))
}

fn group_resource() -> ApiResource {
    ApiResource::from_gvk(&GroupVersionKind::gvk("user.openshift.io", "v1", "Group"))
}

fn is_local<K: Resource>(object: &K) -> bool {
    object
        .labels()
        .get(LOCAL_CLUSTER_LABEL)
        .is_some_and(|value| value == "true")
}

fn object_event<K: Resource>(event_type: WatchEventType, object: &K) -> WatchEvent {
    WatchEvent {
        event_type,
        name: object.name_any(),
        is_local: is_local(object),
    }
}

/// Maps a raw watch event. Bookmarks carry no object change and are dropped.
pub fn map_watch_event<K: Resource>(event: KubeWatchEvent<K>) -> Option<WatchEvent> {
    match event {
        KubeWatchEvent::Added(object) => Some(object_event(WatchEventType::Added, &object)),
        KubeWatchEvent::Modified(object) => Some(object_event(WatchEventType::Modified, &object)),
        KubeWatchEvent::Deleted(object) => Some(object_event(WatchEventType::Deleted, &object)),
        KubeWatchEvent::Bookmark(_) => None,
        KubeWatchEvent::Error(error) => Some(WatchEvent::other(format!(
            "ERROR {}: {}",
            error.code, error.message
        ))),
    }
}

async fn open_watch<K>(api: Api<K>) -> DomainResult<WatchStream>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + 'static,
{
    let stream = api
        .watch(&WatchParams::default(), REPLAY_FROM_START)
        .await
        .map_err(cluster_api_error)?;

    Ok(stream
        .map_err(cluster_api_error)
        .try_filter_map(|event| futures::future::ready(Ok(map_watch_event(event))))
        .boxed())
}

/// Cluster API access through the service account's own client.
pub struct KubeClusterApi {
    client: Client,
}

impl KubeClusterApi {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ClusterApi for KubeClusterApi {
    #[instrument(skip(self))]
    async fn list_namespaces(&self) -> DomainResult<Vec<String>> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let list = api
            .list(&ListParams::default())
            .await
            .map_err(cluster_api_error)?;
        Ok(list.items.iter().map(ResourceExt::name_any).collect())
    }

    #[instrument(skip(self))]
    async fn list_managed_clusters(&self) -> DomainResult<Vec<ManagedCluster>> {
        let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &managed_cluster_resource());
        let list = api
            .list(&ListParams::default())
            .await
            .map_err(cluster_api_error)?;
        Ok(list
            .items
            .iter()
            .map(|cluster| ManagedCluster {
                name: cluster.name_any(),
                is_local: is_local(cluster),
            })
            .collect())
    }

    async fn watch(&self, kind: WatchedKind) -> DomainResult<WatchStream> {
        debug!(%kind, "Opening watch");
        let client = self.client.clone();
        match kind {
            WatchedKind::Namespaces => open_watch(Api::<Namespace>::all(client)).await,
            WatchedKind::Roles => open_watch(Api::<Role>::all(client)).await,
            WatchedKind::ClusterRoles => open_watch(Api::<ClusterRole>::all(client)).await,
            WatchedKind::RoleBindings => open_watch(Api::<RoleBinding>::all(client)).await,
            WatchedKind::ClusterRoleBindings => {
                open_watch(Api::<ClusterRoleBinding>::all(client)).await
            }
            WatchedKind::Groups => {
                open_watch(Api::<DynamicObject>::all_with(client, &group_resource())).await
            }
            WatchedKind::ManagedClusters => {
                open_watch(Api::<DynamicObject>::all_with(
                    client,
                    &managed_cluster_resource(),
                ))
                .await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::collections::BTreeMap;

    fn namespace(name: &str) -> Namespace {
        Namespace {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_object_events_carry_name() {
        let added = map_watch_event(KubeWatchEvent::Added(namespace("ns-a"))).unwrap();
        let deleted = map_watch_event(KubeWatchEvent::Deleted(namespace("ns-b"))).unwrap();

        assert_eq!(added, WatchEvent::added("ns-a"));
        assert_eq!(deleted, WatchEvent::deleted("ns-b"));
    }

    #[test]
    fn test_local_cluster_label_is_detected() {
        let mut cluster = DynamicObject::new("local-cluster", &managed_cluster_resource());
        cluster.metadata.labels = Some(BTreeMap::from([(
            LOCAL_CLUSTER_LABEL.to_string(),
            "true".to_string(),
        )]));

        let event = map_watch_event(KubeWatchEvent::Added(cluster)).unwrap();

        assert!(event.is_local);
        assert_eq!(event.name, "local-cluster");
    }

    #[test]
    fn test_plural_names_for_dynamic_resources() {
        assert_eq!(managed_cluster_resource().plural, "managedclusters");
        assert_eq!(group_resource().plural, "groups");
    }
}
