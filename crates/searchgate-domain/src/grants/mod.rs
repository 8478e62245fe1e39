//! Shared and per-user authorization grants.
//!
//! ```text
//! ┌────────────────────┐   namespaces, clusters,   ┌────────────────────┐
//! │  SharedGrantCache  │── cluster-scoped kinds ──>│   UserGrantCache   │
//! │ (store + cluster)  │                           │ (impersonated      │
//! └────────────────────┘                           │  access reviews)   │
//!                                                  └────────────────────┘
//! ```

pub mod fine_grained;
pub mod rules;
pub mod shared;
pub mod user;

pub use fine_grained::{FineGrainedGrant, PermissionBinding, PermissionRule, PolicyRule, UserPermission};
pub use shared::{SharedGrant, SharedGrantCache};
pub use user::{UserGrant, UserGrantCache};
