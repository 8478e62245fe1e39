//! searchgate-storage: relational store access and change notification listeners.
//!
//! Two backends are provided:
//! - [`PostgresResourceStore`] / [`PostgresNotificationSource`]: sqlx-backed, production
//! - [`MemoryResourceStore`] / [`MemoryNotificationSource`]: in-process, for tests
//!
//! Listen connections are opened per [`NotificationSource::connect`] call and
//! are never borrowed from the query pool.

pub mod error;
pub mod memory;
pub mod postgres;
pub mod traits;

pub use error::{StorageError, StorageResult};
pub use memory::{MemoryNotificationSource, MemoryResourceStore};
pub use postgres::{
    validate_channel_name, PostgresConfig, PostgresNotificationSource, PostgresResourceStore,
    NOTIFY_TRIGGER_NAME,
};
pub use traits::{
    Notification, NotificationConnection, NotificationSource, ResourceKind, ResourceStore,
    DEFAULT_NOTIFICATION_CHANNEL,
};
