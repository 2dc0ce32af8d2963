//! Async driver: ticks a dispatcher on an interval until shut down.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use crate::dispatcher::RealtimeDispatcher;
use crate::feed::ChangeFeed;
use crate::query_cache::QueryCache;

/// Tick `dispatcher` every `every` until `shutdown` turns `true` (or its
/// sender is dropped). Returns the number of ticks performed.
///
/// The driver only stops ticking; channels stay open so the owner can decide
/// between [`RealtimeDispatcher::shutdown`] and handing the dispatcher on.
pub async fn run_dispatcher<F, Q>(
    dispatcher: Arc<RealtimeDispatcher<F, Q>>,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> u64
where
    F: ChangeFeed + 'static,
    Q: QueryCache + 'static,
{
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut ticks = 0u64;

    info!(tick_ms = every.as_millis() as u64, "realtime driver started");

    loop {
        if *shutdown.borrow() {
            break;
        }

        tokio::select! {
            _ = interval.tick() => {
                ticks += 1;
                match dispatcher.tick() {
                    Ok(report) if !report.is_empty() => debug!(
                        notifications = report.notifications,
                        fired = report.fired.len(),
                        channel_errors = report.channel_errors.len(),
                        "realtime tick"
                    ),
                    Ok(_) => {}
                    Err(err) => {
                        error!(error = %err, "realtime dispatcher unusable; stopping driver");
                        break;
                    }
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }

    info!(ticks, "realtime driver stopped");
    ticks
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use stockroom_core::ManualClock;

    use crate::{ChangeEvent, ChangeKind, InMemoryChangeFeed, InMemoryQueryCache, QueryKey, RealtimeDomainConfig};

    #[tokio::test(start_paused = true)]
    async fn driver_applies_invalidations_and_stops_on_shutdown() {
        let feed = Arc::new(InMemoryChangeFeed::new());
        let cache = Arc::new(InMemoryQueryCache::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let dispatcher = Arc::new(RealtimeDispatcher::new(feed.clone(), cache.clone(), clock.clone()));

        let config = RealtimeDomainConfig::builder("realtime:notifications")
            .table("notifications")
            .query_key(["notifications"])
            .build()
            .unwrap();
        let lease = dispatcher.subscribe(&config).unwrap();
        cache.set(["notifications", "unread"], json!(3));

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(run_dispatcher(
            Arc::clone(&dispatcher),
            Duration::from_millis(50),
            rx,
        ));

        feed.publish(ChangeEvent::new("public", "notifications", ChangeKind::Insert));
        tokio::time::sleep(Duration::from_millis(120)).await;

        assert!(cache.is_stale(&QueryKey::from(["notifications", "unread"])));
        assert_eq!(cache.invalidation_count(), 1);

        tx.send(true).unwrap();
        let ticks = handle.await.unwrap();
        assert!(ticks >= 2);

        // Channels outlive the driver.
        assert_eq!(dispatcher.ref_count(config.channel_key()), 1);
        dispatcher.release(lease).unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn driver_stops_when_sender_is_dropped() {
        let dispatcher = Arc::new(RealtimeDispatcher::new(
            InMemoryChangeFeed::new(),
            InMemoryQueryCache::new(),
            Arc::new(ManualClock::new(Utc::now())),
        ));

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(run_dispatcher(dispatcher, Duration::from_millis(10), rx));
        drop(tx);

        handle.await.unwrap();
    }
}
