//! Per-component subscription handle.
//!
//! A UI component (or any other consumer) owns one [`RealtimeConsumer`] for
//! its domain and flips it on and off with [`RealtimeConsumer::set_enabled`].
//!
//! The handle shares the dispatcher, so dropping it returns its lease: a
//! component that goes away without unmounting still lets the channel tear
//! down. [`RealtimeConsumer::unmount`] does the same but reports release
//! errors instead of logging them.

use std::sync::Arc;

use tracing::warn;

use crate::config::RealtimeDomainConfig;
use crate::dispatcher::{Lease, RealtimeDispatcher, RealtimeError};
use crate::feed::ChangeFeed;
use crate::query_cache::QueryCache;

pub struct RealtimeConsumer<F: ChangeFeed, Q: QueryCache> {
    dispatcher: Arc<RealtimeDispatcher<F, Q>>,
    config: RealtimeDomainConfig,
    lease: Option<Lease>,
}

impl<F: ChangeFeed, Q: QueryCache> RealtimeConsumer<F, Q> {
    /// A disabled consumer of `config`'s channel.
    pub fn new(dispatcher: Arc<RealtimeDispatcher<F, Q>>, config: RealtimeDomainConfig) -> Self {
        Self {
            dispatcher,
            config,
            lease: None,
        }
    }

    pub fn config(&self) -> &RealtimeDomainConfig {
        &self.config
    }

    /// Whether this consumer currently holds a reference on its channel.
    pub fn is_active(&self) -> bool {
        self.lease.is_some()
    }

    /// Acquire or release this consumer's reference.
    ///
    /// Idempotent: enabling an enabled consumer (or disabling a disabled one)
    /// does nothing. On a subscribe error the consumer stays disabled.
    pub fn set_enabled(&mut self, enabled: bool) -> Result<(), RealtimeError> {
        match (enabled, self.lease.take()) {
            (true, Some(lease)) => {
                self.lease = Some(lease);
                Ok(())
            }
            (true, None) => {
                self.lease = Some(self.dispatcher.subscribe(&self.config)?);
                Ok(())
            }
            (false, Some(lease)) => self.dispatcher.release(lease),
            (false, None) => Ok(()),
        }
    }

    /// Release the reference (if any) and consume the consumer.
    pub fn unmount(mut self) -> Result<(), RealtimeError> {
        self.set_enabled(false)
    }
}

impl<F: ChangeFeed, Q: QueryCache> Drop for RealtimeConsumer<F, Q> {
    fn drop(&mut self) {
        if let Some(lease) = self.lease.take() {
            let channel = lease.channel_key().clone();
            if let Err(err) = self.dispatcher.release(lease) {
                warn!(%channel, error = %err, "realtime consumer dropped; lease release failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use chrono::{Duration, Utc};
    use serde_json::json;
    use stockroom_core::ManualClock;

    use crate::config::preset;
    use crate::{ChangeEvent, ChangeKind, InMemoryChangeFeed, InMemoryQueryCache, QueryKey};

    type TestDispatcher = RealtimeDispatcher<Arc<InMemoryChangeFeed>, Arc<InMemoryQueryCache>>;

    fn setup() -> (
        Arc<TestDispatcher>,
        Arc<InMemoryChangeFeed>,
        Arc<InMemoryQueryCache>,
        Arc<ManualClock>,
    ) {
        let feed = Arc::new(InMemoryChangeFeed::new());
        let cache = Arc::new(InMemoryQueryCache::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let dispatcher = Arc::new(RealtimeDispatcher::new(feed.clone(), cache.clone(), clock.clone()));
        (dispatcher, feed, cache, clock)
    }

    #[test]
    fn toggling_enabled_acquires_and_releases() {
        let (dispatcher, feed, cache, clock) = setup();
        let config = preset("orders").unwrap();
        let key = config.channel_key().clone();

        let mut list_page = RealtimeConsumer::new(Arc::clone(&dispatcher), config.clone());
        let mut detail_page = RealtimeConsumer::new(Arc::clone(&dispatcher), config);

        list_page.set_enabled(true).unwrap();
        list_page.set_enabled(true).unwrap();
        detail_page.set_enabled(true).unwrap();
        assert_eq!(dispatcher.ref_count(&key), 2);
        assert_eq!(feed.open_calls(), 1);

        list_page.set_enabled(false).unwrap();
        assert!(!list_page.is_active());
        assert_eq!(dispatcher.ref_count(&key), 1);

        cache.set(["orders", "list"], json!([]));
        feed.publish(ChangeEvent::new("public", "sales_orders", ChangeKind::Insert));
        dispatcher.tick().unwrap();
        clock.advance(Duration::milliseconds(300));
        dispatcher.tick().unwrap();
        assert!(cache.is_stale(&QueryKey::from(["orders", "list"])));

        detail_page.unmount().unwrap();
        list_page.unmount().unwrap();
        assert_eq!(dispatcher.ref_count(&key), 0);
        assert!(!feed.is_open(&key));
    }

    #[test]
    fn dropping_without_unmount_releases_the_lease() {
        let (dispatcher, feed, _cache, _clock) = setup();
        let config = preset("notifications").unwrap();
        let key = config.channel_key().clone();

        let mut kept = RealtimeConsumer::new(Arc::clone(&dispatcher), config.clone());
        kept.set_enabled(true).unwrap();
        {
            let mut dropped = RealtimeConsumer::new(Arc::clone(&dispatcher), config);
            dropped.set_enabled(true).unwrap();
            assert_eq!(dispatcher.ref_count(&key), 2);
        }
        assert_eq!(dispatcher.ref_count(&key), 1);

        drop(kept);
        assert_eq!(dispatcher.ref_count(&key), 0);
        assert!(!feed.is_open(&key));
    }

    #[test]
    fn subscribe_error_leaves_consumer_disabled() {
        let (dispatcher, feed, _cache, _clock) = setup();
        let config = preset("pos").unwrap();
        feed.reject(config.channel_key(), "realtime disabled for pos");

        let mut consumer = RealtimeConsumer::new(dispatcher, config);
        assert!(consumer.set_enabled(true).is_err());
        assert!(!consumer.is_active());

        feed.accept(consumer.config().channel_key());
        consumer.set_enabled(true).unwrap();
        assert!(consumer.is_active());
        consumer.unmount().unwrap();
    }
}
