//! Infrastructure layer: Postgres adapters, schema wiring and configuration.
//!
//! The domain crates only know the [`PermissionSource`](stockroom_auth::PermissionSource)
//! and [`ChangeFeed`](stockroom_realtime::ChangeFeed) traits; this crate
//! provides the Postgres-backed implementations.

pub mod change_feed;
pub mod config;
pub mod permissions;
pub mod schema;


pub use change_feed::{PostgresChangeFeed, notify_channel};
pub use config::{Settings, SettingsError};
pub use permissions::PostgresPermissionSource;
