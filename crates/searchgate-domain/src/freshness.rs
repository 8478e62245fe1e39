//! Freshness metadata for lazily refreshed cache fields.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::error::{DomainError, DomainResult};

/// Tracks when a value was last refreshed and whether that refresh failed.
///
/// A value is fresh iff it was refreshed less than `ttl` ago and the refresh
/// did not record an error. `updated_at == None` is the "expired" sentinel:
/// it is older than any TTL.
#[derive(Debug, Clone)]
pub struct Freshness {
    updated_at: Option<Instant>,
    error: Option<DomainError>,
    ttl: Duration,
}

impl Freshness {
    pub fn new(ttl: Duration) -> Self {
        Self {
            updated_at: None,
            error: None,
            ttl,
        }
    }

    pub fn is_fresh(&self) -> bool {
        self.error.is_none()
            && self
                .updated_at
                .is_some_and(|updated_at| Instant::now() < updated_at + self.ttl)
    }

    pub fn record_success(&mut self) {
        self.updated_at = Some(Instant::now());
        self.error = None;
    }

    pub fn record_error(&mut self, error: DomainError) {
        self.updated_at = Some(Instant::now());
        self.error = Some(error);
    }

    /// Resets the timestamp to the sentinel so the next reader refreshes.
    pub fn expire(&mut self) {
        self.updated_at = None;
    }

    pub fn error(&self) -> Option<&DomainError> {
        self.error.as_ref()
    }

    pub fn updated_at(&self) -> Option<Instant> {
        self.updated_at
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }
}

/// Point-in-time view of a field's freshness, for diagnostics.
#[derive(Debug, Clone)]
pub struct FieldStatus {
    pub fresh: bool,
    pub updated_at: Option<Instant>,
    pub error: Option<DomainError>,
}

struct FieldState<T> {
    value: Arc<T>,
    freshness: Freshness,
}

/// A cached value with its own lock and freshness metadata.
///
/// Readers of one field never wait on another field. Readers of the same
/// stale field queue behind a single refresh instead of each issuing one.
pub struct CachedField<T> {
    state: Mutex<FieldState<T>>,
}

impl<T> CachedField<T>
where
    T: Send + Sync,
{
    pub fn new(initial: T, ttl: Duration) -> Self {
        Self {
            state: Mutex::new(FieldState {
                value: Arc::new(initial),
                freshness: Freshness::new(ttl),
            }),
        }
    }

    /// Returns the cached value, running `load` first if the field is stale.
    ///
    /// A failed load is recorded on the field and returned; the previous
    /// value is kept but not served, and the next reader retries. If the
    /// caller is dropped mid-load the field is left untouched.
    pub async fn get_or_refresh<F, Fut>(&self, load: F) -> DomainResult<Arc<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = DomainResult<T>>,
    {
        let mut state = self.state.lock().await;
        if state.freshness.is_fresh() {
            return Ok(state.value.clone());
        }

        match load().await {
            Ok(value) => {
                state.value = Arc::new(value);
                state.freshness.record_success();
                Ok(state.value.clone())
            }
            Err(error) => {
                state.freshness.record_error(error.clone());
                Err(error)
            }
        }
    }

    /// Returns the fresh value, or `None` without refreshing.
    pub async fn get_if_fresh(&self) -> Option<Arc<T>> {
        let state = self.state.lock().await;
        state.freshness.is_fresh().then(|| state.value.clone())
    }

    /// Returns the current value regardless of freshness.
    pub async fn peek(&self) -> Arc<T> {
        self.state.lock().await.value.clone()
    }

    /// Stores `value` as freshly loaded.
    pub async fn set(&self, value: T) {
        let mut state = self.state.lock().await;
        state.value = Arc::new(value);
        state.freshness.record_success();
    }

    pub async fn expire(&self) {
        self.state.lock().await.freshness.expire();
    }

    pub async fn is_fresh(&self) -> bool {
        self.state.lock().await.freshness.is_fresh()
    }

    pub async fn status(&self) -> FieldStatus {
        let state = self.state.lock().await;
        FieldStatus {
            fresh: state.freshness.is_fresh(),
            updated_at: state.freshness.updated_at(),
            error: state.freshness.error().cloned(),
        }
    }
}

impl<T> CachedField<T>
where
    T: Clone + Send + Sync,
{
    /// Applies a structural change in place without touching freshness.
    ///
    /// Returns whatever `change` returns, typically whether anything changed.
    pub async fn update<R>(&self, change: impl FnOnce(&mut T) -> R) -> R {
        let mut state = self.state.lock().await;
        change(Arc::make_mut(&mut state.value))
    }
}
