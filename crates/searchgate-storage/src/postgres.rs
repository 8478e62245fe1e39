//! PostgreSQL storage implementation.

use async_trait::async_trait;
use sqlx::postgres::{PgListener, PgPool, PgPoolOptions};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use crate::error::{StorageError, StorageResult};
use crate::traits::{
    Notification, NotificationConnection, NotificationSource, ResourceKind, ResourceStore,
};

/// Default health check timeout in seconds.
const DEFAULT_HEALTH_CHECK_TIMEOUT_SECS: u64 = 5;

/// Default query timeout in seconds.
const DEFAULT_QUERY_TIMEOUT_SECS: u64 = 30;

/// Hub cluster the collector always runs on.
const HUB_CLUSTER: &str = "local-cluster";

/// Name of the trigger that publishes row changes.
pub const NOTIFY_TRIGGER_NAME: &str = "search_resources_notify_trigger";

const CLUSTER_SCOPED_RESOURCES_SQL: &str = r#"
SELECT DISTINCT
    COALESCE(data->>'apigroup', '') AS apigroup,
    COALESCE(data->>'kind_plural', '') AS kind
FROM search.resources
WHERE data ? '_hubClusterResource'
  AND (data ? 'namespace') IS FALSE
"#;

const SEARCH_ADDON_DISABLED_CLUSTERS_SQL: &str = r#"
SELECT DISTINCT mci.data->>'name' AS cluster
FROM search.resources AS mci
LEFT OUTER JOIN search.resources AS addon
    ON mci.data->>'name' = addon.data->>'namespace'
   AND addon.data->>'kind' = 'ManagedClusterAddOn'
   AND addon.data->>'name' = 'search-collector'
WHERE mci.data->>'kind' = 'ManagedClusterInfo'
  AND addon.uid IS NULL
  AND mci.data->>'name' != $1
"#;

const PROPERTY_TYPES_SQL: &str = r#"
SELECT DISTINCT
    key,
    CASE
        WHEN jsonb_typeof(value) = 'string'
         AND value::text ~ '^"\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}' THEN 'timestamp'
        ELSE jsonb_typeof(value)
    END AS datatype
FROM search.resources, jsonb_each(data)
"#;

/// pg_notify rejects payloads of 8000 bytes or more. Larger rows are sent
/// without their data documents.
const NOTIFY_FUNCTION_TEMPLATE: &str = r#"
CREATE OR REPLACE FUNCTION search.notify_resources_change() RETURNS trigger AS $$
DECLARE
    payload text;
BEGIN
    IF TG_OP = 'DELETE' THEN
        payload := json_build_object('operation', TG_OP, 'table', TG_TABLE_NAME,
            'uid', OLD.uid, 'cluster', OLD.cluster, 'old_data', OLD.data,
            'timestamp', now())::text;
    ELSIF TG_OP = 'UPDATE' THEN
        payload := json_build_object('operation', TG_OP, 'table', TG_TABLE_NAME,
            'uid', NEW.uid, 'cluster', NEW.cluster, 'old_data', OLD.data,
            'new_data', NEW.data, 'timestamp', now())::text;
    ELSE
        payload := json_build_object('operation', TG_OP, 'table', TG_TABLE_NAME,
            'uid', NEW.uid, 'cluster', NEW.cluster, 'new_data', NEW.data,
            'timestamp', now())::text;
    END IF;
    IF octet_length(payload) >= 7900 THEN
        payload := json_build_object('operation', TG_OP, 'table', TG_TABLE_NAME,
            'uid', COALESCE(NEW.uid, OLD.uid), 'cluster', COALESCE(NEW.cluster, OLD.cluster),
            'timestamp', now())::text;
    END IF;
    PERFORM pg_notify('{channel}', payload);
    RETURN NULL;
END;
$$ LANGUAGE plpgsql
"#;

/// Channel names are spliced into SQL, so only plain identifiers are accepted.
pub fn validate_channel_name(channel: &str) -> StorageResult<()> {
    let valid = !channel.is_empty()
        && channel.len() <= 63
        && channel
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        && !channel.starts_with(|c: char| c.is_ascii_digit());
    if valid {
        Ok(())
    } else {
        Err(StorageError::InvalidInput {
            message: format!("invalid notification channel name: {channel:?}"),
        })
    }
}

/// PostgreSQL configuration options.
#[derive(Clone)]
pub struct PostgresConfig {
    /// Database connection URL.
    pub database_url: String,
    /// Maximum number of connections in the pool.
    pub max_connections: u32,
    /// Minimum number of connections in the pool.
    pub min_connections: u32,
    /// Connection timeout in seconds.
    pub connect_timeout_secs: u64,
    /// Maximum time to wait for a query before returning `StorageError::QueryTimeout`.
    pub query_timeout_secs: u64,
    /// Timeout for health checks in seconds.
    pub health_check_timeout_secs: u64,
}

// Custom Debug implementation to hide credentials in database_url
impl std::fmt::Debug for PostgresConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresConfig")
            .field("database_url", &"[REDACTED]")
            .field("max_connections", &self.max_connections)
            .field("min_connections", &self.min_connections)
            .field("connect_timeout_secs", &self.connect_timeout_secs)
            .field("query_timeout_secs", &self.query_timeout_secs)
            .field("health_check_timeout_secs", &self.health_check_timeout_secs)
            .finish()
    }
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            database_url: "postgres://localhost/search".to_string(),
            max_connections: 10,
            min_connections: 1,
            connect_timeout_secs: 30,
            query_timeout_secs: DEFAULT_QUERY_TIMEOUT_SECS,
            health_check_timeout_secs: DEFAULT_HEALTH_CHECK_TIMEOUT_SECS,
        }
    }
}

/// PostgreSQL implementation of [`ResourceStore`].
pub struct PostgresResourceStore {
    pool: PgPool,
    query_timeout: Duration,
    health_check_timeout: Duration,
}

impl PostgresResourceStore {
    /// Creates a new store with the given configuration.
    #[instrument(skip(config))]
    pub async fn from_config(config: &PostgresConfig) -> StorageResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .connect(&config.database_url)
            .await
            .map_err(|e| StorageError::ConnectionError {
                message: e.to_string(),
            })?;

        Ok(Self::from_pool(pool, config))
    }

    /// Creates a new store from a database URL.
    pub async fn from_url(database_url: &str) -> StorageResult<Self> {
        let config = PostgresConfig {
            database_url: database_url.to_string(),
            ..Default::default()
        };
        Self::from_config(&config).await
    }

    /// Wraps an existing pool.
    pub fn from_pool(pool: PgPool, config: &PostgresConfig) -> Self {
        Self {
            pool,
            query_timeout: Duration::from_secs(config.query_timeout_secs),
            health_check_timeout: Duration::from_secs(config.health_check_timeout_secs),
        }
    }

    /// Returns a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Wraps an async operation with timeout and records metrics.
    async fn execute_with_timeout_and_metrics<T, F>(
        &self,
        operation: &str,
        timeout: Duration,
        future: F,
    ) -> StorageResult<T>
    where
        F: std::future::Future<Output = StorageResult<T>>,
    {
        let start = std::time::Instant::now();
        let result = tokio::time::timeout(timeout, future).await;
        let duration = start.elapsed().as_secs_f64();

        let (status, final_result) = match result {
            Ok(Ok(value)) => ("success", Ok(value)),
            Ok(Err(e)) => ("error", Err(e)),
            Err(_elapsed) => (
                "timeout",
                Err(StorageError::QueryTimeout {
                    operation: operation.to_string(),
                    timeout,
                }),
            ),
        };

        metrics::histogram!(
            "searchgate_storage_query_duration_seconds",
            "operation" => operation.to_string(),
            "status" => status.to_string()
        )
        .record(duration);

        if status == "timeout" {
            metrics::counter!(
                "searchgate_storage_query_timeout_total",
                "operation" => operation.to_string()
            )
            .increment(1);
        }

        final_result
    }

    /// Installs the row-change trigger that publishes on `channel`.
    ///
    /// Runs in one transaction so a failed install leaves any previous trigger in place.
    #[instrument(skip(self))]
    pub async fn install_notification_trigger(&self, channel: &str) -> StorageResult<()> {
        validate_channel_name(channel)?;
        let function_sql = NOTIFY_FUNCTION_TEMPLATE.replace("{channel}", channel);
        let drop_sql = format!("DROP TRIGGER IF EXISTS {NOTIFY_TRIGGER_NAME} ON search.resources");
        let create_sql = format!(
            "CREATE TRIGGER {NOTIFY_TRIGGER_NAME} \
             AFTER INSERT OR UPDATE OR DELETE ON search.resources \
             FOR EACH ROW EXECUTE FUNCTION search.notify_resources_change()"
        );

        let future = async {
            let mut tx = self.pool.begin().await.map_err(query_error)?;
            for sql in [function_sql.as_str(), drop_sql.as_str(), create_sql.as_str()] {
                sqlx::query(sql).execute(&mut *tx).await.map_err(query_error)?;
            }
            tx.commit().await.map_err(query_error)
        };
        self.execute_with_timeout_and_metrics("install_notification_trigger", self.query_timeout, future)
            .await?;
        info!(channel, trigger = NOTIFY_TRIGGER_NAME, "Installed notification trigger");
        Ok(())
    }

    /// Drops the trigger and its functions. Missing objects are ignored.
    #[instrument(skip(self))]
    pub async fn remove_notification_trigger(&self) -> StorageResult<()> {
        let statements = [
            format!("DROP TRIGGER IF EXISTS {NOTIFY_TRIGGER_NAME} ON search.resources"),
            "DROP FUNCTION IF EXISTS search.notify_resources_change()".to_string(),
            "DROP FUNCTION IF EXISTS search.notify_resources_change_filtered()".to_string(),
        ];
        let future = async {
            let mut tx = self.pool.begin().await.map_err(query_error)?;
            for sql in &statements {
                sqlx::query(sql).execute(&mut *tx).await.map_err(query_error)?;
            }
            tx.commit().await.map_err(query_error)
        };
        self.execute_with_timeout_and_metrics("remove_notification_trigger", self.query_timeout, future)
            .await?;
        info!(trigger = NOTIFY_TRIGGER_NAME, "Removed notification trigger");
        Ok(())
    }
}

fn query_error(e: sqlx::Error) -> StorageError {
    StorageError::QueryError {
        message: e.to_string(),
    }
}

#[async_trait]
impl ResourceStore for PostgresResourceStore {
    #[instrument(skip(self))]
    async fn cluster_scoped_resources(&self) -> StorageResult<Vec<ResourceKind>> {
        let future = async {
            let rows: Vec<(String, String)> = sqlx::query_as(CLUSTER_SCOPED_RESOURCES_SQL)
                .fetch_all(&self.pool)
                .await
                .map_err(query_error)?;
            Ok(rows
                .into_iter()
                .map(|(api_group, kind)| ResourceKind { api_group, kind })
                .collect::<Vec<_>>())
        };
        let resources = self
            .execute_with_timeout_and_metrics("cluster_scoped_resources", self.query_timeout, future)
            .await?;
        debug!(count = resources.len(), "Loaded cluster-scoped resources");
        Ok(resources)
    }

    #[instrument(skip(self))]
    async fn search_addon_disabled_clusters(&self) -> StorageResult<Vec<String>> {
        let future = async {
            let rows: Vec<Option<String>> = sqlx::query_scalar(SEARCH_ADDON_DISABLED_CLUSTERS_SQL)
                .bind(HUB_CLUSTER)
                .fetch_all(&self.pool)
                .await
                .map_err(query_error)?;
            Ok(rows.into_iter().flatten().collect::<Vec<_>>())
        };
        self.execute_with_timeout_and_metrics("search_addon_disabled_clusters", self.query_timeout, future)
            .await
    }

    #[instrument(skip(self))]
    async fn property_types(&self) -> StorageResult<HashMap<String, String>> {
        let future = async {
            let rows: Vec<(String, Option<String>)> = sqlx::query_as(PROPERTY_TYPES_SQL)
                .fetch_all(&self.pool)
                .await
                .map_err(query_error)?;
            let mut types: HashMap<String, String> = rows
                .into_iter()
                .filter_map(|(key, datatype)| datatype.map(|t| (key, t)))
                .collect();
            // Cluster lives in its own column, not in the data document.
            types.insert("cluster".to_string(), "string".to_string());
            Ok(types)
        };
        self.execute_with_timeout_and_metrics("property_types", self.query_timeout, future)
            .await
    }

    async fn health_check(&self) -> StorageResult<()> {
        let future = async {
            sqlx::query("SELECT 1")
                .execute(&self.pool)
                .await
                .map(|_| ())
                .map_err(|e| StorageError::ConnectionError {
                    message: e.to_string(),
                })
        };
        self.execute_with_timeout_and_metrics("health_check", self.health_check_timeout, future)
            .await
    }
}

/// Opens dedicated `LISTEN` connections outside the query pool.
pub struct PostgresNotificationSource {
    database_url: String,
    connect_timeout: Duration,
}

impl PostgresNotificationSource {
    pub fn new(config: &PostgresConfig) -> Self {
        Self {
            database_url: config.database_url.clone(),
            connect_timeout: Duration::from_secs(config.connect_timeout_secs),
        }
    }
}

impl std::fmt::Debug for PostgresNotificationSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresNotificationSource")
            .field("database_url", &"[REDACTED]")
            .field("connect_timeout", &self.connect_timeout)
            .finish()
    }
}

#[async_trait]
impl NotificationSource for PostgresNotificationSource {
    #[instrument(skip(self))]
    async fn connect(&self, channel: &str) -> StorageResult<Box<dyn NotificationConnection>> {
        validate_channel_name(channel)?;

        let mut listener = tokio::time::timeout(
            self.connect_timeout,
            PgListener::connect(&self.database_url),
        )
        .await
        .map_err(|_| StorageError::ConnectionError {
            message: format!("listen connection timed out after {:?}", self.connect_timeout),
        })?
        .map_err(|e| StorageError::ConnectionError {
            message: e.to_string(),
        })?;

        listener
            .listen(channel)
            .await
            .map_err(|e| StorageError::ListenError {
                channel: channel.to_string(),
                message: e.to_string(),
            })?;

        debug!(channel, "Listening for notifications");
        Ok(Box::new(PgNotificationConnection { listener }))
    }
}

struct PgNotificationConnection {
    listener: PgListener,
}

#[async_trait]
impl NotificationConnection for PgNotificationConnection {
    async fn recv(&mut self) -> StorageResult<Notification> {
        // try_recv yields None when the connection drops; the caller owns reconnects.
        match self.listener.try_recv().await {
            Ok(Some(notification)) => Ok(Notification {
                channel: notification.channel().to_string(),
                payload: notification.payload().to_string(),
            }),
            Ok(None) => Err(StorageError::ConnectionLost {
                message: "listen connection closed by server".to_string(),
            }),
            Err(e) => Err(StorageError::ConnectionLost {
                message: e.to_string(),
            }),
        }
    }

    async fn close(self: Box<Self>) {
        let mut this = self;
        if let Err(e) = this.listener.unlisten_all().await {
            warn!(error = %e, "Failed to unlisten while closing notification connection");
        }
    }
}
