//! Realtime invalidation dispatcher.
//!
//! Coalesces consumers onto one feed channel per channel key, debounces their
//! change notifications and invalidates the configured query keys.
//!
//! ## Lifecycle
//!
//! - [`RealtimeDispatcher::subscribe`] opens the feed channel on first use and
//!   hands out a [`Lease`]. Later subscribers to the same key only add a lease.
//! - [`RealtimeDispatcher::release`] gives a lease back; the last release
//!   closes the feed channel and cancels any pending invalidation.
//! - Feed `open`/`close` run under the registry lock, so a subscribe racing
//!   the last release either joins the old channel or opens a fresh one
//!   after the old one is gone; it never ends up on a closed channel.
//! - [`RealtimeDispatcher::tick`] drains every channel (in receive order) and
//!   applies invalidations whose quiet period has elapsed. A driver calls it
//!   periodically (see [`crate::run_dispatcher`]) or tests call it directly.
//!
//! ## Failure handling
//!
//! - Subscribe errors go back to the caller and leave no registry state.
//! - A failed channel is marked errored (with the feed's cause when it sent
//!   one) and reported once in the tick report; it is never reopened here.
//!   Invalidations already pending still fire. New subscribers to an errored
//!   channel get [`RealtimeError::ChannelErrored`]; once its last lease is
//!   released, the next subscribe opens it afresh.
//! - A failing query cache is logged; the channel goes back to idle and keeps
//!   processing later notifications.

use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, info, warn};

use stockroom_core::Clock;

use crate::config::{ChannelKey, QueryKey, RealtimeDomainConfig};
use crate::feed::{ChangeFeed, FeedError};
use crate::query_cache::{QueryCache, QueryCacheError};
use crate::registry::{ChannelRegistry, ChannelStatus, Released};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RealtimeError {
    #[error("subscribe to channel '{channel_key}' failed: {source}")]
    Subscribe {
        channel_key: ChannelKey,
        #[source]
        source: FeedError,
    },

    #[error("channel '{channel_key}' has failed: {reason}")]
    ChannelErrored { channel_key: ChannelKey, reason: String },

    #[error("channel '{0}' is already live with a different configuration")]
    ConflictingConfig(ChannelKey),

    #[error("channel '{0}' holds no such lease")]
    UnknownLease(ChannelKey),

    #[error("dispatcher registry lock poisoned")]
    Poisoned,
}

/// Proof of one reference on a live channel.
///
/// Not `Clone`: giving it back through [`RealtimeDispatcher::release`] is the
/// only way to drop the reference.
#[derive(Debug, PartialEq, Eq)]
#[must_use = "a lease keeps its channel open until released"]
pub struct Lease {
    channel_key: ChannelKey,
    id: u64,
}

impl Lease {
    pub fn channel_key(&self) -> &ChannelKey {
        &self.channel_key
    }
}

/// One invalidation applied during a tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FiredInvalidation {
    pub channel_key: ChannelKey,
    pub query_keys: Vec<QueryKey>,
    /// Notifications collapsed into this invalidation.
    pub coalesced: u32,
    /// Number of cached queries affected, or the cache's error.
    pub outcome: Result<usize, QueryCacheError>,
}

/// A channel that failed during a tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelError {
    pub channel_key: ChannelKey,
    pub reason: String,
}

/// What a single tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Notifications that matched their channel's tables and change kinds.
    pub notifications: usize,
    /// Events received but filtered out.
    pub ignored: usize,
    pub fired: Vec<FiredInvalidation>,
    pub channel_errors: Vec<ChannelError>,
}

impl TickReport {
    pub fn is_empty(&self) -> bool {
        self.notifications == 0
            && self.ignored == 0
            && self.fired.is_empty()
            && self.channel_errors.is_empty()
    }
}

/// Dispatcher over a change feed `F` and a query cache `Q`.
pub struct RealtimeDispatcher<F, Q> {
    feed: F,
    cache: Q,
    clock: Arc<dyn Clock>,
    registry: Mutex<ChannelRegistry>,
}

impl<F, Q> RealtimeDispatcher<F, Q>
where
    F: ChangeFeed,
    Q: QueryCache,
{
    pub fn new(feed: F, cache: Q, clock: Arc<dyn Clock>) -> Self {
        Self {
            feed,
            cache,
            clock,
            registry: Mutex::new(ChannelRegistry::default()),
        }
    }

    pub fn feed(&self) -> &F {
        &self.feed
    }

    pub fn query_cache(&self) -> &Q {
        &self.cache
    }

    fn registry(&self) -> Result<MutexGuard<'_, ChannelRegistry>, RealtimeError> {
        self.registry.lock().map_err(|_| RealtimeError::Poisoned)
    }

    /// Take a reference on `config`'s channel, opening it if needed.
    pub fn subscribe(&self, config: &RealtimeDomainConfig) -> Result<Lease, RealtimeError> {
        let key = config.channel_key();
        let mut registry = self.registry()?;

        if let Some(slot) = registry.get(key) {
            if slot.config != *config {
                return Err(RealtimeError::ConflictingConfig(key.clone()));
            }
            if let ChannelStatus::Errored(reason) = &slot.status {
                return Err(RealtimeError::ChannelErrored {
                    channel_key: key.clone(),
                    reason: reason.clone(),
                });
            }
            let id = registry
                .add_lease(key)
                .ok_or_else(|| RealtimeError::UnknownLease(key.clone()))?;
            debug!(channel = %key, refs = registry.get(key).map_or(0, |s| s.leases.len()), "realtime channel shared");
            return Ok(Lease {
                channel_key: key.clone(),
                id,
            });
        }

        let subscription = self.feed.open(config).map_err(|source| {
            warn!(channel = %key, error = %source, "realtime subscribe failed");
            RealtimeError::Subscribe {
                channel_key: key.clone(),
                source,
            }
        })?;

        let id = registry.insert(config.clone(), subscription);
        info!(
            channel = %key,
            schema = config.schema(),
            tables = ?config.tables(),
            debounce_ms = config.debounce().num_milliseconds(),
            "realtime channel opened"
        );

        Ok(Lease {
            channel_key: key.clone(),
            id,
        })
    }

    /// Give back a lease. The last lease on a channel closes it.
    pub fn release(&self, lease: Lease) -> Result<(), RealtimeError> {
        let mut registry = self.registry()?;
        match registry.release(&lease.channel_key, lease.id) {
            Some(Released::Retained(refs)) => {
                debug!(channel = %lease.channel_key, refs, "realtime lease released");
                Ok(())
            }
            Some(Released::TornDown { cancelled_pending }) => {
                self.feed.close(&lease.channel_key);
                drop(registry);
                info!(channel = %lease.channel_key, cancelled_pending, "realtime channel closed");
                Ok(())
            }
            None => Err(RealtimeError::UnknownLease(lease.channel_key)),
        }
    }

    /// Drain pending change events, then apply due invalidations.
    pub fn tick(&self) -> Result<TickReport, RealtimeError> {
        let now = self.clock.now();
        let mut report = TickReport::default();

        let due = {
            let mut registry = self.registry()?;
            for (channel_key, drained) in registry.drain(now) {
                report.notifications += drained.matched;
                report.ignored += drained.ignored;
                if let Some(reason) = drained.error {
                    warn!(channel = %channel_key, %reason, "realtime channel errored; not resubscribing");
                    report.channel_errors.push(ChannelError { channel_key, reason });
                }
            }
            registry.take_due(now)
        };

        // Cache calls happen outside the registry lock.
        for due in due {
            let outcome = self.cache.invalidate(&due.query_keys);
            match &outcome {
                Ok(affected) => info!(
                    channel = %due.channel_key,
                    coalesced = due.coalesced,
                    affected,
                    "queries invalidated"
                ),
                Err(err) => warn!(
                    channel = %due.channel_key,
                    coalesced = due.coalesced,
                    error = %err,
                    "query invalidation failed"
                ),
            }
            report.fired.push(FiredInvalidation {
                channel_key: due.channel_key,
                query_keys: due.query_keys,
                coalesced: due.coalesced,
                outcome,
            });
        }

        Ok(report)
    }

    /// Earliest pending invalidation deadline across all channels.
    pub fn next_deadline(&self) -> Option<DateTime<Utc>> {
        self.registry().ok()?.next_deadline()
    }

    /// Number of leases held on `channel_key` (0 when not live).
    pub fn ref_count(&self, channel_key: &ChannelKey) -> usize {
        self.registry()
            .ok()
            .and_then(|r| r.get(channel_key).map(|s| s.leases.len()))
            .unwrap_or(0)
    }

    pub fn channel_status(&self, channel_key: &ChannelKey) -> Option<ChannelStatus> {
        self.registry().ok()?.get(channel_key).map(|s| s.status.clone())
    }

    pub fn active_channels(&self) -> Vec<ChannelKey> {
        self.registry().map(|r| r.keys()).unwrap_or_default()
    }

    /// Close every channel and forget all leases (process teardown).
    ///
    /// Leases handed out earlier become unknown afterwards.
    pub fn shutdown(&self) -> Result<(), RealtimeError> {
        let mut registry = self.registry()?;
        let keys = registry.clear();
        for key in &keys {
            self.feed.close(key);
        }
        drop(registry);
        info!(channels = keys.len(), "realtime dispatcher shut down");
        Ok(())
    }
}
