//! Background invalidation of cached grants driven by cluster watches.
//!
//! One supervised watch loop runs per [`WatchedKind`]. Every add, modify or
//! delete event calls [`BackgroundInvalidator::invalidate_cache`], which is
//! debounced so a burst of changes costs one invalidation pass. Namespace
//! and managed-cluster events also patch the shared cache immediately.
//!
//! A loop that sees any other event, a stream error, or the end of its
//! stream logs a warning, waits `restart_delay`, schedules an invalidation
//! to cover whatever it missed, and watches again.

pub mod debounce;

use futures::future::join_all;
use futures::StreamExt;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::DomainError;
use crate::grants::{SharedGrantCache, UserGrantCache};
use crate::model::{WatchEvent, WatchEventType, WatchedKind};
use crate::traits::ClusterApi;

pub use debounce::DebouncedTrigger;

/// Registers metric descriptions for the invalidator.
pub fn register_invalidation_metrics() {
    metrics::describe_counter!(
        "searchgate_invalidation_passes_total",
        "Debounced passes that expired every per-user grant"
    );
    metrics::describe_counter!(
        "searchgate_watch_restarts_total",
        "Authorization watch loops restarted after an unexpected exit"
    );
}

#[derive(Debug, Clone)]
pub struct InvalidatorConfig {
    /// Quiet period between the first trigger and the invalidation pass.
    pub quiet_period: Duration,
    /// Pause before re-opening a watch that exited unexpectedly.
    pub restart_delay: Duration,
    pub kinds: Vec<WatchedKind>,
}

impl Default for InvalidatorConfig {
    fn default() -> Self {
        Self {
            quiet_period: Duration::from_secs(5),
            restart_delay: Duration::from_secs(5),
            kinds: WatchedKind::ALL.to_vec(),
        }
    }
}

impl InvalidatorConfig {
    pub fn with_quiet_period(mut self, quiet_period: Duration) -> Self {
        self.quiet_period = quiet_period;
        self
    }

    pub fn with_restart_delay(mut self, restart_delay: Duration) -> Self {
        self.restart_delay = restart_delay;
        self
    }

    pub fn with_kinds(mut self, kinds: Vec<WatchedKind>) -> Self {
        self.kinds = kinds;
        self
    }
}

/// Why a single watch loop iteration ended.
#[derive(Debug)]
enum WatchExit {
    OpenFailed(DomainError),
    StreamError(DomainError),
    UnexpectedEvent(String),
    StreamEnded,
}

impl fmt::Display for WatchExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WatchExit::OpenFailed(error) => write!(f, "failed to open watch: {error}"),
            WatchExit::StreamError(error) => write!(f, "watch stream error: {error}"),
            WatchExit::UnexpectedEvent(kind) => write!(f, "unexpected watch event: {kind}"),
            WatchExit::StreamEnded => f.write_str("watch stream ended"),
        }
    }
}

/// Watches authorization-relevant resources and expires cached grants.
pub struct BackgroundInvalidator {
    shared: Arc<SharedGrantCache>,
    users: Arc<UserGrantCache>,
    cluster_api: Arc<dyn ClusterApi>,
    trigger: DebouncedTrigger,
    config: InvalidatorConfig,
    passes: Arc<AtomicU64>,
}

impl BackgroundInvalidator {
    pub fn new(
        shared: Arc<SharedGrantCache>,
        users: Arc<UserGrantCache>,
        cluster_api: Arc<dyn ClusterApi>,
        config: InvalidatorConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            shared,
            users,
            cluster_api,
            trigger: DebouncedTrigger::new(config.quiet_period),
            config,
            passes: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Schedules an invalidation pass unless one is already pending.
    pub fn invalidate_cache(&self) -> bool {
        let users = self.users.clone();
        let passes = self.passes.clone();
        let armed = self.trigger.arm(move || async move {
            let count = users.invalidate_all().await;
            passes.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("searchgate_invalidation_passes_total").increment(1);
            info!(users = count, "expired cached user grants");
        });
        if armed {
            debug!(quiet_period = ?self.trigger.quiet_period(), "invalidation scheduled");
        }
        armed
    }

    pub fn is_pending(&self) -> bool {
        self.trigger.is_pending()
    }

    /// Number of invalidation passes completed.
    pub fn pass_count(&self) -> u64 {
        self.passes.load(Ordering::Relaxed)
    }

    /// Runs every watch loop until `shutdown` turns true.
    pub async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) {
        info!(kinds = self.config.kinds.len(), "starting authorization watches");
        let loops = self
            .config
            .kinds
            .iter()
            .map(|kind| self.clone().supervise(*kind, shutdown.clone()));
        join_all(loops).await;
        self.trigger.reset();
        info!("authorization watches stopped");
    }

    async fn supervise(self: Arc<Self>, kind: WatchedKind, mut shutdown: watch::Receiver<bool>) {
        loop {
            let exit = tokio::select! {
                exit = self.watch_once(kind) => exit,
                _ = stopped(&mut shutdown) => return,
            };

            metrics::counter!("searchgate_watch_restarts_total", "kind" => kind.as_str()).increment(1);
            warn!(%kind, reason = %exit, delay = ?self.config.restart_delay, "watch exited; restarting");

            tokio::select! {
                _ = tokio::time::sleep(self.config.restart_delay) => {}
                _ = stopped(&mut shutdown) => return,
            }
            // Events may have been missed while the watch was down.
            self.invalidate_cache();
        }
    }

    async fn watch_once(&self, kind: WatchedKind) -> WatchExit {
        let mut stream = match self.cluster_api.watch(kind).await {
            Ok(stream) => stream,
            Err(error) => return WatchExit::OpenFailed(error),
        };
        debug!(%kind, "watch opened");

        while let Some(item) = stream.next().await {
            let event = match item {
                Ok(event) => event,
                Err(error) => return WatchExit::StreamError(error),
            };
            match &event.event_type {
                WatchEventType::Added | WatchEventType::Modified | WatchEventType::Deleted => {
                    self.apply(kind, &event).await;
                }
                WatchEventType::Other(other) => return WatchExit::UnexpectedEvent(other.clone()),
            }
        }
        WatchExit::StreamEnded
    }

    async fn apply(&self, kind: WatchedKind, event: &WatchEvent) {
        debug!(%kind, name = %event.name, event = ?event.event_type, "authorization change");
        match (kind, &event.event_type) {
            (WatchedKind::Namespaces, WatchEventType::Added) => {
                self.shared.add_namespace(&event.name).await;
            }
            (WatchedKind::Namespaces, WatchEventType::Deleted) => {
                self.shared.remove_namespace(&event.name).await;
                self.users.forget_namespace(&event.name).await;
            }
            (WatchedKind::ManagedClusters, WatchEventType::Added) if !event.is_local => {
                self.shared.add_managed_cluster(&event.name).await;
            }
            (WatchedKind::ManagedClusters, WatchEventType::Deleted) => {
                self.shared.remove_managed_cluster(&event.name).await;
                self.users.forget_cluster(&event.name).await;
            }
            _ => {}
        }
        self.invalidate_cache();
    }
}

/// Resolves once the stop flag is set or its sender is gone.
async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use crate::model::UserInfo;
    use crate::testing::{MockAccessReviewer, MockClusterApi, MockGrantReader};

    struct Fixture {
        api: Arc<MockClusterApi>,
        reviewer: Arc<MockAccessReviewer>,
        shared: Arc<SharedGrantCache>,
        users: Arc<UserGrantCache>,
        invalidator: Arc<BackgroundInvalidator>,
        stop: watch::Sender<bool>,
    }

    fn fixture(kinds: Vec<WatchedKind>) -> Fixture {
        let config = CacheConfig::default();
        let api = Arc::new(
            MockClusterApi::new()
                .with_namespaces(&["ns-a"])
                .with_clusters(&["cluster-a"]),
        );
        let reader = Arc::new(MockGrantReader::new());
        let shared = Arc::new(SharedGrantCache::new(reader, api.clone(), &config));
        let reviewer = Arc::new(MockAccessReviewer::new());
        let users = Arc::new(UserGrantCache::new(shared.clone(), reviewer.clone(), None, &config));
        let invalidator = BackgroundInvalidator::new(
            shared.clone(),
            users.clone(),
            api.clone(),
            InvalidatorConfig::default()
                .with_quiet_period(Duration::from_secs(5))
                .with_restart_delay(Duration::from_secs(2))
                .with_kinds(kinds),
        );
        let (stop, _) = watch::channel(false);
        Fixture {
            api,
            reviewer,
            shared,
            users,
            invalidator,
            stop,
        }
    }

    fn start(fx: &Fixture) -> tokio::task::JoinHandle<()> {
        tokio::spawn(fx.invalidator.clone().run(fx.stop.subscribe()))
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    // ==========================================================================
    // Section 1: Debounced invalidation
    // ==========================================================================

    #[tokio::test(start_paused = true)]
    async fn test_burst_of_events_runs_one_pass() {
        // Arrange
        let fx = fixture(vec![WatchedKind::RoleBindings]);
        let user = UserInfo::new("uid-u", "u");
        fx.users.user_grant(&user).await.unwrap();
        let reviews_before = fx.reviewer.rules_call_count();
        let handle = start(&fx);
        settle().await;

        // Act
        for i in 0..20 {
            assert!(fx.api.emit(WatchedKind::RoleBindings, WatchEvent::modified(format!("rb-{i}"))));
        }
        settle().await;
        tokio::time::sleep(Duration::from_secs(6)).await;
        fx.users.user_grant(&user).await.unwrap();

        // Assert
        assert_eq!(fx.invalidator.pass_count(), 1);
        assert_eq!(fx.reviewer.rules_call_count(), reviews_before * 2);

        fx.stop.send_replace(true);
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_direct_invalidate_is_debounced() {
        let fx = fixture(Vec::new());

        assert!(fx.invalidator.invalidate_cache());
        assert!(!fx.invalidator.invalidate_cache());
        assert!(fx.invalidator.is_pending());
        tokio::time::sleep(Duration::from_secs(6)).await;

        assert_eq!(fx.invalidator.pass_count(), 1);
        assert!(!fx.invalidator.is_pending());
    }

    // ==========================================================================
    // Section 2: Structural mutations
    // ==========================================================================

    #[tokio::test(start_paused = true)]
    async fn test_namespace_events_patch_shared_cache_immediately() {
        // Arrange
        let fx = fixture(vec![WatchedKind::Namespaces]);
        fx.shared.namespaces().await.unwrap();
        let handle = start(&fx);
        settle().await;

        // Act
        fx.api.emit(WatchedKind::Namespaces, WatchEvent::added("ns-new"));
        fx.api.emit(WatchedKind::Namespaces, WatchEvent::deleted("ns-a"));
        settle().await;

        // Assert
        let namespaces = fx.shared.namespaces().await.unwrap();
        assert_eq!(*namespaces, vec!["ns-new".to_string()]);
        assert!(fx.invalidator.is_pending());

        fx.stop.send_replace(true);
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_managed_cluster_events_patch_shared_cache() {
        let fx = fixture(vec![WatchedKind::ManagedClusters]);
        fx.shared.managed_clusters().await.unwrap();
        let handle = start(&fx);
        settle().await;

        fx.api.emit(WatchedKind::ManagedClusters, WatchEvent::added("cluster-b"));
        fx.api.emit(WatchedKind::ManagedClusters, WatchEvent::deleted("cluster-a"));
        settle().await;

        let clusters = fx.shared.managed_clusters().await.unwrap();
        assert!(clusters.contains("cluster-b"));
        assert!(!clusters.contains("cluster-a"));

        fx.stop.send_replace(true);
        handle.await.unwrap();
    }

    // ==========================================================================
    // Section 3: Supervision
    // ==========================================================================

    #[tokio::test(start_paused = true)]
    async fn test_unexpected_event_restarts_watch_after_delay() {
        // Arrange
        let fx = fixture(vec![WatchedKind::Roles]);
        let handle = start(&fx);
        settle().await;
        assert_eq!(fx.api.watch_opens.load(std::sync::atomic::Ordering::SeqCst), 1);

        // Act
        fx.api.emit(WatchedKind::Roles, WatchEvent::other("BOOKMARK"));
        settle().await;
        let opens_during_delay = fx.api.watch_opens.load(std::sync::atomic::Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(3)).await;

        // Assert
        assert_eq!(opens_during_delay, 1);
        assert_eq!(fx.api.watch_opens.load(std::sync::atomic::Ordering::SeqCst), 2);
        assert!(fx.invalidator.is_pending());
        assert!(fx.api.is_watching(WatchedKind::Roles));

        fx.stop.send_replace(true);
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_end_restarts_watch() {
        let fx = fixture(vec![WatchedKind::Groups]);
        let handle = start(&fx);
        settle().await;

        fx.api.close_watch(WatchedKind::Groups);
        tokio::time::sleep(Duration::from_secs(3)).await;

        assert_eq!(fx.api.watch_opens.load(std::sync::atomic::Ordering::SeqCst), 2);

        fx.stop.send_replace(true);
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_all_loops() {
        let fx = fixture(WatchedKind::ALL.to_vec());
        let handle = start(&fx);
        settle().await;

        fx.stop.send_replace(true);
        handle.await.unwrap();

        assert_eq!(fx.api.watch_opens.load(std::sync::atomic::Ordering::SeqCst), 7);
    }
}
