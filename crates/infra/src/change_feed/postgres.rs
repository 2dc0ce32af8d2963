//! Postgres `LISTEN/NOTIFY` change feed.
//!
//! Row triggers (see [`crate::schema`]) publish one JSON notification per row
//! change on the channel `<schema>_changes`:
//!
//! ```json
//! {"schema": "public", "table": "stock_items", "type": "UPDATE", "record": {...}}
//! ```
//!
//! Each opened channel runs a listener task on the tokio runtime and forwards
//! matching notifications into the subscription. When connecting, `LISTEN` or
//! receiving fails, the task sends the cause as a [`FeedError::Unavailable`]
//! item and ends; reconnecting is left to the owner of the feed.
//!
//! Note: `NOTIFY` is not durable. Changes made while no listener is connected
//! are not replayed.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Mutex, mpsc};

use sqlx::PgPool;
use sqlx::postgres::PgListener;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use stockroom_realtime::{
    ChangeEvent, ChangeFeed, ChannelKey, FeedError, FeedItem, RealtimeDomainConfig, Subscription,
};

/// Postgres notification channel carrying changes for `schema`.
pub fn notify_channel(schema: &str) -> String {
    format!("{schema}_changes")
}

/// Change feed over Postgres `LISTEN/NOTIFY`.
pub struct PostgresChangeFeed {
    pool: PgPool,
    runtime: Handle,
    listeners: Mutex<HashMap<ChannelKey, JoinHandle<()>>>,
}

impl PostgresChangeFeed {
    /// Create a feed that spawns listeners on the current tokio runtime.
    pub fn new(pool: PgPool) -> Result<Self, FeedError> {
        let runtime = Handle::try_current()
            .map_err(|e| FeedError::Unavailable(format!("no tokio runtime: {e}")))?;
        Ok(Self::with_runtime(pool, runtime))
    }

    pub fn with_runtime(pool: PgPool, runtime: Handle) -> Self {
        Self {
            pool,
            runtime,
            listeners: Mutex::new(HashMap::new()),
        }
    }
}

impl ChangeFeed for PostgresChangeFeed {
    fn open(&self, config: &RealtimeDomainConfig) -> Result<Subscription<FeedItem>, FeedError> {
        let (tx, rx) = mpsc::channel();

        let pool = self.pool.clone();
        let channel = notify_channel(config.schema());
        let schema = config.schema().to_string();
        let tables: BTreeSet<String> = config.tables().clone();
        let key = config.channel_key().clone();

        let mut listeners = self
            .listeners
            .lock()
            .map_err(|_| FeedError::Unavailable("listener registry lock poisoned".to_string()))?;

        // Background task that receives notifications and forwards them.
        let task_key = key.clone();
        let task = self.runtime.spawn(async move {
            let mut listener = match PgListener::connect_with(&pool).await {
                Ok(l) => l,
                Err(e) => {
                    warn!(channel = %task_key, error = %e, "postgres listener connect failed");
                    let _ = tx.send(Err(FeedError::Unavailable(format!("listener connect failed: {e}"))));
                    return;
                }
            };
            if let Err(e) = listener.listen(&channel).await {
                warn!(channel = %task_key, pg_channel = %channel, error = %e, "LISTEN failed");
                let _ = tx.send(Err(FeedError::Unavailable(format!("LISTEN {channel} failed: {e}"))));
                return;
            }
            debug!(channel = %task_key, pg_channel = %channel, "postgres listener ready");

            loop {
                let notification = match listener.recv().await {
                    Ok(n) => n,
                    Err(e) => {
                        warn!(channel = %task_key, error = %e, "postgres listener failed");
                        let _ = tx.send(Err(FeedError::Unavailable(format!("listener failed: {e}"))));
                        return;
                    }
                };

                let event: ChangeEvent = match serde_json::from_str(notification.payload()) {
                    Ok(ev) => ev,
                    Err(e) => {
                        warn!(channel = %task_key, error = %e, "malformed change notification dropped");
                        continue;
                    }
                };

                if event.schema != schema || !tables.contains(&event.table) {
                    continue;
                }

                // Receiver gone: the channel was closed.
                if tx.send(Ok(event)).is_err() {
                    return;
                }
            }
        });

        if let Some(previous) = listeners.insert(key, task) {
            previous.abort();
        }

        Ok(Subscription::new(rx))
    }

    fn close(&self, channel_key: &ChannelKey) {
        if let Ok(mut listeners) = self.listeners.lock() {
            if let Some(task) = listeners.remove(channel_key) {
                task.abort();
            }
        }
    }
}

impl Drop for PostgresChangeFeed {
    fn drop(&mut self) {
        if let Ok(mut listeners) = self.listeners.lock() {
            for (_, task) in listeners.drain() {
                task.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use sqlx::postgres::PgPoolOptions;

    #[test]
    fn channel_name_is_schema_scoped() {
        assert_eq!(notify_channel("public"), "public_changes");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unreachable_database_reports_cause_then_disconnects() {
        let pool = PgPoolOptions::new()
            .acquire_timeout(Duration::from_millis(200))
            .connect_lazy("postgres://nobody@127.0.0.1:1/stockroom")
            .unwrap();
        let feed = PostgresChangeFeed::new(pool).unwrap();
        let config = RealtimeDomainConfig::builder("realtime:stock")
            .table("stock_items")
            .query_key(["inventory"])
            .build()
            .unwrap();

        let sub = feed.open(&config).unwrap();
        let (first, second) = tokio::task::spawn_blocking(move || {
            let first = sub.recv_timeout(Duration::from_secs(10));
            let second = sub.recv_timeout(Duration::from_secs(10));
            (first, second)
        })
        .await
        .unwrap();

        match first {
            Ok(Err(FeedError::Unavailable(reason))) => {
                assert!(reason.starts_with("listener connect failed"), "{reason}")
            }
            other => panic!("expected connect failure, got {other:?}"),
        }
        assert_eq!(second, Err(mpsc::RecvTimeoutError::Disconnected));
    }
}
