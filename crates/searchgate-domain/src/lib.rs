//! searchgate-domain: identity and authorization caching
//!
//! This crate decides what a caller may see without hammering the identity
//! provider, the cluster API or the relational store:
//! - Coalesced identity verification
//! - Shared and per-user grant caches with per-field freshness
//! - Per-tuple watch permission decisions for live updates
//! - Debounced background invalidation driven by cluster watches
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────┐
//! │                 searchgate-domain                │
//! ├──────────────────────────────────────────────────┤
//! │  identity/      - Coalesced token verification   │
//! │  grants/        - Shared + per-user grants       │
//! │  watch/         - Per-tuple watch decisions      │
//! │  invalidation/  - Debounced watch-driven expiry  │
//! │  service        - AuthzCache wiring              │
//! └──────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod error;
pub mod freshness;
pub mod grants;
pub mod identity;
pub mod invalidation;
pub mod model;
pub mod service;
pub mod singleflight;
pub mod traits;
pub mod watch;

#[cfg(test)]
pub(crate) mod testing;

// Re-export commonly used types at the crate root
pub use config::CacheConfig;
pub use error::{DomainError, DomainResult};
pub use grants::{FineGrainedGrant, SharedGrant, UserGrant, UserPermission};
pub use identity::{IdentityCache, IdentityRecord};
pub use invalidation::{BackgroundInvalidator, DebouncedTrigger, InvalidatorConfig};
pub use model::{Resource, UserInfo, WatchEvent, WatchEventType, WatchedKind};
pub use service::{register_cache_metrics, AuthzCache, ExternalServices};
pub use traits::{AccessReviewer, ClusterApi, GrantReader, IdentityProvider, PermissionSource, WatchStream};
pub use watch::WatchPermissionCache;
