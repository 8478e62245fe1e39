//! searchgate binary
//!
//! Runs the authorization caches, the background invalidator and the change
//! notification engine until interrupted.
//!
//! # Usage
//!
//! ```bash
//! # With config file
//! searchgate --config config.yaml
//!
//! # With environment variables only
//! SEARCHGATE_STORAGE__BACKEND=memory searchgate
//! ```

use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};

use searchgate_domain::{AuthzCache, ExternalServices, PermissionSource};
use searchgate_server::adapters::StoreGrantReader;
use searchgate_server::k8s::KubeAdapters;
use searchgate_server::notification::NotificationEngine;
use searchgate_server::observability::{init_logging, register_metrics, LoggingConfig};
use searchgate_server::ServerConfig;
use searchgate_storage::{
    MemoryNotificationSource, MemoryResourceStore, NotificationSource, PostgresNotificationSource,
    PostgresResourceStore, ResourceStore,
};

/// searchgate - access-control caches and live updates for multi-cluster search
#[derive(Parser, Debug)]
#[command(name = "searchgate")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file (YAML)
    #[arg(short, long)]
    config: Option<String>,
}

struct Backend {
    store: Arc<dyn ResourceStore>,
    notifications: Arc<dyn NotificationSource>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = if let Some(config_path) = args.config {
        ServerConfig::load(&config_path)?
    } else {
        ServerConfig::from_env()?
    };

    init_logging(&LoggingConfig::from(&config.logging));
    register_metrics();

    info!(version = env!("CARGO_PKG_VERSION"), "Starting searchgate");

    let backend = build_backend(&config).await?;
    if let Err(e) = backend.store.health_check().await {
        warn!(error = %e, "Store health check failed; grant facts will be retried on demand");
    }

    let kube = KubeAdapters::infer(config.client_cache_limits()).await?;
    info!("Kubernetes client configured");

    let permission_source: Option<Arc<dyn PermissionSource>> = config
        .features
        .fine_grained_rbac
        .then(|| kube.permission_source.clone() as Arc<dyn PermissionSource>);
    let services = ExternalServices {
        identity_provider: kube.identity_provider.clone(),
        access_reviewer: kube.access_reviewer.clone(),
        cluster_api: kube.cluster_api.clone(),
        grant_reader: Arc::new(StoreGrantReader::new(backend.store.clone())),
        permission_source,
    };
    let cache = AuthzCache::new(services, &config.cache_config());

    let (stop_tx, stop_rx) = watch::channel(false);
    let invalidator = if config.invalidation.enabled {
        let invalidator = cache.invalidator(config.invalidator_config());
        Some(tokio::spawn(invalidator.run(stop_rx)))
    } else {
        info!("Background invalidation disabled");
        None
    };

    let engine = if config.notification.enabled {
        info!(channel = %config.notification.channel, "Live updates enabled");
        Some(NotificationEngine::new(
            backend.notifications.clone(),
            config.engine_config(),
        ))
    } else {
        info!("Live updates disabled");
        None
    };

    shutdown_signal().await;
    info!("Shutdown signal received, stopping");

    let _ = stop_tx.send(true);
    if let Some(engine) = engine {
        engine.shutdown().await;
    }
    if let Some(task) = invalidator {
        if let Err(e) = task.await {
            error!(error = %e, "Invalidator task failed");
        }
    }

    info!("Shutdown complete");
    Ok(())
}

async fn build_backend(config: &ServerConfig) -> anyhow::Result<Backend> {
    match config.storage.backend.as_str() {
        "memory" => {
            info!("Using in-memory storage backend");
            Ok(Backend {
                store: Arc::new(MemoryResourceStore::new()),
                notifications: Arc::new(MemoryNotificationSource::new()),
            })
        }
        "postgres" => {
            let pg_config = config.postgres_config().ok_or_else(|| {
                anyhow::anyhow!("storage.database_url is required for postgres backend")
            })?;

            info!("Connecting to PostgreSQL database");
            let store = PostgresResourceStore::from_config(&pg_config).await?;
            info!("PostgreSQL connection established");

            if config.notification.install_trigger {
                store
                    .install_notification_trigger(&config.notification.channel)
                    .await?;
                info!(channel = %config.notification.channel, "Notification trigger installed");
            }

            Ok(Backend {
                store: Arc::new(store),
                notifications: Arc::new(PostgresNotificationSource::new(&pg_config)),
            })
        }
        other => anyhow::bail!("Unknown storage backend: {}", other),
    }
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_args_parsing() {
        // Test with no args
        let args = Args::try_parse_from(["searchgate"]).unwrap();
        assert!(args.config.is_none());

        // Test with config
        let args = Args::try_parse_from(["searchgate", "--config", "config.yaml"]).unwrap();
        assert_eq!(args.config, Some("config.yaml".to_string()));

        // Test with short flag
        let args = Args::try_parse_from(["searchgate", "-c", "test.yaml"]).unwrap();
        assert_eq!(args.config, Some("test.yaml".to_string()));
    }

    #[tokio::test]
    async fn test_memory_backend_is_built_without_a_database() {
        let config = ServerConfig::default();

        let backend = build_backend(&config).await.unwrap();

        assert!(backend.store.health_check().await.is_ok());
    }
}
