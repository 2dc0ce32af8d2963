//! In-memory change feed for tests/dev.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, mpsc};

use crate::config::{ChannelKey, RealtimeDomainConfig};
use crate::feed::{ChangeEvent, ChangeFeed, FeedError, FeedItem, Subscription};

#[derive(Debug)]
struct OpenChannel {
    schema: String,
    tables: BTreeSet<String>,
    sender: mpsc::Sender<FeedItem>,
}

/// In-memory change feed.
///
/// - No IO / no async
/// - Fans each published event out to every open channel covering its table
/// - Can reject subscriptions and drop channels to exercise error paths
#[derive(Debug, Default)]
pub struct InMemoryChangeFeed {
    channels: Mutex<HashMap<ChannelKey, OpenChannel>>,
    rejections: Mutex<HashMap<ChannelKey, String>>,
    opened: AtomicUsize,
}

impl InMemoryChangeFeed {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver `event` to every matching open channel. Returns the number of
    /// channels it reached.
    pub fn publish(&self, event: ChangeEvent) -> usize {
        let Ok(mut channels) = self.channels.lock() else {
            return 0;
        };

        let mut delivered = 0;
        // Drop channels whose receiver is gone while publishing.
        channels.retain(|_, ch| {
            if ch.schema != event.schema || !ch.tables.contains(&event.table) {
                return true;
            }
            let ok = ch.sender.send(Ok(event.clone())).is_ok();
            if ok {
                delivered += 1;
            }
            ok
        });
        delivered
    }

    /// Refuse future `open` calls for `channel_key` with `reason`.
    pub fn reject(&self, channel_key: &ChannelKey, reason: impl Into<String>) {
        if let Ok(mut rejections) = self.rejections.lock() {
            rejections.insert(channel_key.clone(), reason.into());
        }
    }

    /// Accept `open` calls for `channel_key` again.
    pub fn accept(&self, channel_key: &ChannelKey) {
        if let Ok(mut rejections) = self.rejections.lock() {
            rejections.remove(channel_key);
        }
    }

    /// Drop the sending side of a channel, as a broken connection would.
    pub fn disconnect(&self, channel_key: &ChannelKey) {
        if let Ok(mut channels) = self.channels.lock() {
            channels.remove(channel_key);
        }
    }

    /// Fail a channel with `reason`, as a lost listener connection would:
    /// the cause is delivered, then the sending side is dropped.
    pub fn fail(&self, channel_key: &ChannelKey, reason: impl Into<String>) {
        if let Ok(mut channels) = self.channels.lock() {
            if let Some(ch) = channels.remove(channel_key) {
                let _ = ch.sender.send(Err(FeedError::Unavailable(reason.into())));
            }
        }
    }

    pub fn is_open(&self, channel_key: &ChannelKey) -> bool {
        self.channels
            .lock()
            .map(|channels| channels.contains_key(channel_key))
            .unwrap_or(false)
    }

    pub fn open_channels(&self) -> usize {
        self.channels.lock().map(|c| c.len()).unwrap_or(0)
    }

    /// Total number of successful `open` calls over the feed's lifetime.
    pub fn open_calls(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }
}

impl ChangeFeed for InMemoryChangeFeed {
    fn open(&self, config: &RealtimeDomainConfig) -> Result<Subscription<FeedItem>, FeedError> {
        let key = config.channel_key();

        if let Ok(rejections) = self.rejections.lock() {
            if let Some(reason) = rejections.get(key) {
                return Err(FeedError::Rejected(reason.clone()));
            }
        }

        let (tx, rx) = mpsc::channel();
        let mut channels = self
            .channels
            .lock()
            .map_err(|_| FeedError::Unavailable("in-memory feed lock poisoned".to_string()))?;
        channels.insert(
            key.clone(),
            OpenChannel {
                schema: config.schema().to_string(),
                tables: config.tables().clone(),
                sender: tx,
            },
        );
        self.opened.fetch_add(1, Ordering::SeqCst);

        Ok(Subscription::new(rx))
    }

    fn close(&self, channel_key: &ChannelKey) {
        self.disconnect(channel_key);
    }
}
