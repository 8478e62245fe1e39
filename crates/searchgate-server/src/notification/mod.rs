//! Live change notifications.
//!
//! A single LISTEN connection on the store feeds [`NotificationEngine`],
//! which matches each [`ChangeEvent`] against every subscriber's
//! [`SubscriptionFilter`] and, for gated subscriptions, an [`EventGate`].

pub mod engine;
pub mod error;
pub mod event;
pub mod filter;
pub mod gate;

pub use engine::{EngineConfig, EngineState, NotificationEngine, Subscription, SubscriptionInfo};
pub use error::{NotificationError, NotificationResult};
pub use event::{ChangeEvent, Operation};
pub use filter::{FilterBuilder, SubscriptionFilter};
pub use gate::{EventGate, WatchPermissionGate};

/// Registers metric descriptions for the notification engine.
pub fn register_notification_metrics() {
    metrics::describe_counter!(
        "searchgate_notifications_received_total",
        "Notifications read from the listen connection"
    );
    metrics::describe_counter!(
        "searchgate_notifications_delivered_total",
        "Events placed on a subscriber queue"
    );
    metrics::describe_counter!(
        "searchgate_notifications_dropped_total",
        "Events not delivered to a subscriber, by reason"
    );
    metrics::describe_counter!(
        "searchgate_notifications_malformed_total",
        "Notification payloads that could not be parsed"
    );
    metrics::describe_counter!(
        "searchgate_notification_reconnects_total",
        "Reconnect attempts of the listen connection"
    );
}
