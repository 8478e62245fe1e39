//! Storage abstraction traits.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::StorageResult;

/// Well-known channel carrying resource change notifications.
pub const DEFAULT_NOTIFICATION_CHANNEL: &str = "search_resources_changes";

/// A resource kind as stored in the index: API group plus plural kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceKind {
    pub api_group: String,
    pub kind: String,
}

impl ResourceKind {
    pub fn new(api_group: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            api_group: api_group.into(),
            kind: kind.into(),
        }
    }
}

/// Read queries against the resource index that feed authorization caches.
#[async_trait]
pub trait ResourceStore: Send + Sync + 'static {
    /// Distinct hub resources that carry no namespace.
    async fn cluster_scoped_resources(&self) -> StorageResult<Vec<ResourceKind>>;

    /// Managed clusters without a `search-collector` add-on, excluding the hub.
    async fn search_addon_disabled_clusters(&self) -> StorageResult<Vec<String>>;

    /// Property name to data type across all indexed resources.
    async fn property_types(&self) -> StorageResult<HashMap<String, String>>;

    async fn health_check(&self) -> StorageResult<()>;
}

/// One notification received on a listen connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub channel: String,
    pub payload: String,
}

/// Opens dedicated listen connections. These never come from the query pool.
#[async_trait]
pub trait NotificationSource: Send + Sync + 'static {
    /// Connects and subscribes to `channel`.
    async fn connect(&self, channel: &str) -> StorageResult<Box<dyn NotificationConnection>>;
}

/// A live listen connection.
#[async_trait]
pub trait NotificationConnection: Send {
    /// Waits for the next notification. An error means the connection is unusable.
    async fn recv(&mut self) -> StorageResult<Notification>;

    /// Unsubscribes and releases the connection.
    async fn close(self: Box<Self>);
}
