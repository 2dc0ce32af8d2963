//! `stockroom-auth` — permission matrix resolution and caching.
//!
//! This crate is intentionally decoupled from HTTP and storage: the backing
//! store is reached through [`PermissionSource`].

pub mod cache;
pub mod check;
pub mod permissions;
pub mod source;

pub use cache::{CacheStats, PermissionCache, PermissionCacheEntry, DEFAULT_PERMISSION_TTL};
pub use check::PermissionCheckResult;
pub use permissions::{Action, PermissionMatrix, RawPermissionRow, Resource, ResourcePermissions};
pub use source::{InMemoryPermissionSource, PermissionSource, PermissionSourceError};
