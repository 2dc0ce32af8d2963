//! Change feeds backed by infrastructure.

pub mod postgres;

pub use postgres::{PostgresChangeFeed, notify_channel};
