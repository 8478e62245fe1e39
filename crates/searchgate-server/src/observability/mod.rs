//! Observability setup: structured logging and metric descriptions.

mod logging;

pub use logging::{init_logging, LoggingConfig};

/// Describes every metric family emitted by the server once at startup.
pub fn register_metrics() {
    searchgate_domain::register_cache_metrics();
    crate::notification::register_notification_metrics();
}
