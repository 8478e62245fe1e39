//! Adapters that bridge the storage layer to the domain layer.
//!
//! The domain crate reads shared grant facts through `GrantReader`; the
//! storage crate answers them with `ResourceStore` queries.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use searchgate_domain::{DomainError, DomainResult, GrantReader, Resource};
use searchgate_storage::{ResourceStore, StorageError};

fn storage_error_to_domain(err: StorageError) -> DomainError {
    match err {
        StorageError::QueryTimeout { operation, timeout } => DomainError::Timeout {
            operation,
            duration_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        },
        other => DomainError::StoreQueryError {
            message: other.to_string(),
        },
    }
}

/// Serves shared grant facts from a [`ResourceStore`].
pub struct StoreGrantReader<S: ?Sized> {
    store: Arc<S>,
}

impl<S: ResourceStore + ?Sized> StoreGrantReader<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl<S: ResourceStore + ?Sized> GrantReader for StoreGrantReader<S> {
    async fn cluster_scoped_resources(&self) -> DomainResult<Vec<Resource>> {
        let kinds = self
            .store
            .cluster_scoped_resources()
            .await
            .map_err(storage_error_to_domain)?;
        Ok(kinds
            .into_iter()
            .map(|k| Resource::new(k.api_group, k.kind))
            .collect())
    }

    async fn disabled_clusters(&self) -> DomainResult<Vec<String>> {
        self.store
            .search_addon_disabled_clusters()
            .await
            .map_err(storage_error_to_domain)
    }

    async fn property_types(&self) -> DomainResult<HashMap<String, String>> {
        self.store
            .property_types()
            .await
            .map_err(storage_error_to_domain)
    }
}
