//! searchgate-server: wiring for the searchgate service
//!
//! This crate connects the caches in `searchgate-domain` to the outside world:
//! - Layered configuration (defaults, YAML file, environment)
//! - Structured logging and metric descriptions
//! - Kubernetes adapters for token, access and rules reviews and watches
//! - Store-backed grant facts
//! - The change notification engine for live updates
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────┐
//! │                 searchgate-server                │
//! ├──────────────────────────────────────────────────┤
//! │  config.rs      - Configuration management       │
//! │  observability/ - Logging + metric descriptions  │
//! │  k8s/           - Cluster API adapters           │
//! │  adapters.rs    - Store to domain adapters       │
//! │  notification/  - Live change fan-out            │
//! └──────────────────────────────────────────────────┘
//! ```

pub mod adapters;
pub mod config;
pub mod k8s;
pub mod notification;
pub mod observability;

// Re-exports for convenience
pub use config::{ConfigLoadError, ServerConfig};
pub use notification::{NotificationEngine, SubscriptionFilter};
