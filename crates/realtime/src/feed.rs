//! Change feed abstraction (change-data-capture transport).
//!
//! A change feed delivers row-change events for `(schema, table)` pairs. The
//! dispatcher opens one feed channel per channel key and drains it on every
//! tick; the feed itself never calls back into the dispatcher.
//!
//! ## Delivery
//!
//! - Events on one channel are received in the order the feed produced them.
//! - A feed that loses its connection sends the cause as an `Err` item and
//!   then drops the sender. A sender that disappears without a cause is
//!   reported as "change feed channel closed".
//! - Either way the dispatcher marks the channel errored and does **not**
//!   reopen it. Reconnect policy belongs to whoever owns the connection.

use std::sync::Arc;
use std::sync::mpsc::{Receiver, TryRecvError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::{ChangeKind, ChannelKey, RealtimeDomainConfig};

/// A single row change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub schema: String,
    pub table: String,
    #[serde(rename = "type")]
    pub kind: ChangeKind,
    #[serde(default)]
    pub record: serde_json::Value,
}

impl ChangeEvent {
    pub fn new(schema: impl Into<String>, table: impl Into<String>, kind: ChangeKind) -> Self {
        Self {
            schema: schema.into(),
            table: table.into(),
            kind,
            record: serde_json::Value::Null,
        }
    }

    pub fn with_record(mut self, record: serde_json::Value) -> Self {
        self.record = record;
        self
    }
}

/// One item delivered on a feed channel: a change, or the reason the channel
/// stopped.
pub type FeedItem = Result<ChangeEvent, FeedError>;

/// Receiving end of one feed channel.
///
/// Designed for single-consumer use: the dispatcher owns it for as long as the
/// channel is live.
#[derive(Debug)]
pub struct Subscription<M> {
    receiver: Receiver<M>,
}

impl<M> Subscription<M> {
    pub fn new(receiver: Receiver<M>) -> Self {
        Self { receiver }
    }

    /// Try to receive a message without blocking.
    pub fn try_recv(&self) -> Result<M, TryRecvError> {
        self.receiver.try_recv()
    }

    /// Block for up to `timeout` waiting for a message.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<M, std::sync::mpsc::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FeedError {
    /// The feed refused the subscription (permissions, unknown table, ...).
    #[error("subscription rejected: {0}")]
    Rejected(String),

    /// The feed could not be reached.
    #[error("change feed unavailable: {0}")]
    Unavailable(String),
}

/// Source of change events, keyed by channel.
pub trait ChangeFeed: Send + Sync {
    /// Open a channel delivering changes for `config`'s schema and tables.
    fn open(&self, config: &RealtimeDomainConfig) -> Result<Subscription<FeedItem>, FeedError>;

    /// Close the channel opened for `channel_key`. Unknown keys are ignored.
    fn close(&self, channel_key: &ChannelKey);
}

impl<F> ChangeFeed for Arc<F>
where
    F: ChangeFeed + ?Sized,
{
    fn open(&self, config: &RealtimeDomainConfig) -> Result<Subscription<FeedItem>, FeedError> {
        (**self).open(config)
    }

    fn close(&self, channel_key: &ChannelKey) {
        (**self).close(channel_key)
    }
}
