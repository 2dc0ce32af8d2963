//! Permission sources backed by infrastructure.

pub mod postgres;

pub use postgres::PostgresPermissionSource;
