//! In-memory storage implementation for tests and local development.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, RwLock};

use crate::error::{StorageError, StorageResult};
use crate::traits::{
    Notification, NotificationConnection, NotificationSource, ResourceKind, ResourceStore,
};

/// In-memory [`ResourceStore`] with canned query results.
#[derive(Debug, Default)]
pub struct MemoryResourceStore {
    cluster_scoped: RwLock<Vec<ResourceKind>>,
    disabled_clusters: RwLock<Vec<String>>,
    property_types: RwLock<HashMap<String, String>>,
    unavailable: AtomicBool,
}

impl MemoryResourceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_cluster_scoped_resources(&self, resources: Vec<ResourceKind>) {
        *self.cluster_scoped.write().await = resources;
    }

    pub async fn set_disabled_clusters(&self, clusters: Vec<String>) {
        *self.disabled_clusters.write().await = clusters;
    }

    pub async fn set_property_types(&self, types: HashMap<String, String>) {
        *self.property_types.write().await = types;
    }

    /// Makes every query fail with a connection error until cleared.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> StorageResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StorageError::ConnectionError {
                message: "memory store marked unavailable".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ResourceStore for MemoryResourceStore {
    async fn cluster_scoped_resources(&self) -> StorageResult<Vec<ResourceKind>> {
        self.check_available()?;
        Ok(self.cluster_scoped.read().await.clone())
    }

    async fn search_addon_disabled_clusters(&self) -> StorageResult<Vec<String>> {
        self.check_available()?;
        Ok(self.disabled_clusters.read().await.clone())
    }

    async fn property_types(&self) -> StorageResult<HashMap<String, String>> {
        self.check_available()?;
        let mut types = self.property_types.read().await.clone();
        types.insert("cluster".to_string(), "string".to_string());
        Ok(types)
    }

    async fn health_check(&self) -> StorageResult<()> {
        self.check_available()
    }
}

#[derive(Default)]
struct Bus {
    listeners: Mutex<Vec<(String, mpsc::UnboundedSender<Notification>)>>,
    connects: AtomicUsize,
    failing_connects: AtomicUsize,
    refuse: AtomicBool,
}

/// In-process notification bus. Clones share the same bus.
#[derive(Clone, Default)]
pub struct MemoryNotificationSource {
    bus: Arc<Bus>,
}

impl std::fmt::Debug for MemoryNotificationSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryNotificationSource")
            .field("open_connections", &self.open_connections())
            .field("connect_count", &self.connect_count())
            .finish()
    }
}

impl MemoryNotificationSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delivers `payload` to every open listener of `channel`. Returns the receiver count.
    pub fn publish(&self, channel: &str, payload: impl Into<String>) -> usize {
        let payload = payload.into();
        let mut listeners = self.lock_listeners();
        listeners.retain(|(_, tx)| !tx.is_closed());
        listeners
            .iter()
            .filter(|(name, _)| name == channel)
            .filter(|(name, tx)| {
                tx.send(Notification {
                    channel: name.clone(),
                    payload: payload.clone(),
                })
                .is_ok()
            })
            .count()
    }

    /// Serializes `value` and publishes it.
    pub fn publish_json(&self, channel: &str, value: &serde_json::Value) -> usize {
        self.publish(channel, value.to_string())
    }

    /// Severs every open connection; pending `recv` calls fail.
    pub fn drop_connections(&self) {
        self.lock_listeners().clear();
    }

    /// The next `n` connect attempts fail.
    pub fn fail_next_connects(&self, n: usize) {
        self.bus.failing_connects.store(n, Ordering::SeqCst);
    }

    /// Refuses all connects until cleared.
    pub fn refuse_connections(&self, refuse: bool) {
        self.bus.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Total connect attempts, successful or not.
    pub fn connect_count(&self) -> usize {
        self.bus.connects.load(Ordering::SeqCst)
    }

    pub fn open_connections(&self) -> usize {
        self.lock_listeners()
            .iter()
            .filter(|(_, tx)| !tx.is_closed())
            .count()
    }

    fn lock_listeners(
        &self,
    ) -> std::sync::MutexGuard<'_, Vec<(String, mpsc::UnboundedSender<Notification>)>> {
        // A poisoned bus only means a test panicked mid-publish; the data is still usable.
        self.bus
            .listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl NotificationSource for MemoryNotificationSource {
    async fn connect(&self, channel: &str) -> StorageResult<Box<dyn NotificationConnection>> {
        self.bus.connects.fetch_add(1, Ordering::SeqCst);

        if self.bus.refuse.load(Ordering::SeqCst) {
            return Err(StorageError::ConnectionError {
                message: "connection refused".to_string(),
            });
        }
        let failing = self
            .bus
            .failing_connects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(StorageError::ConnectionError {
                message: "injected connect failure".to_string(),
            });
        }

        let (tx, rx) = mpsc::unbounded_channel();
        self.lock_listeners().push((channel.to_string(), tx));
        Ok(Box::new(MemoryConnection { rx }))
    }
}

struct MemoryConnection {
    rx: mpsc::UnboundedReceiver<Notification>,
}

#[async_trait]
impl NotificationConnection for MemoryConnection {
    async fn recv(&mut self) -> StorageResult<Notification> {
        self.rx.recv().await.ok_or_else(|| StorageError::ConnectionLost {
            message: "memory bus connection dropped".to_string(),
        })
    }

    async fn close(self: Box<Self>) {
        drop(self);
    }
}
