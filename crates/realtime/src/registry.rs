//! Arena of live channels keyed by channel key.
//!
//! Each slot owns the feed subscription, the debouncer and the set of leases
//! currently holding it. The slot's reference count is the number of leases.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::mpsc::TryRecvError;

use chrono::{DateTime, Utc};

use crate::config::{ChannelKey, QueryKey, RealtimeDomainConfig};
use crate::debounce::Debouncer;
use crate::feed::{FeedItem, Subscription};

/// Health of a live channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelStatus {
    Live,
    /// The feed side went away. The channel is not reopened automatically.
    Errored(String),
}

#[derive(Debug)]
pub(crate) struct ChannelSlot {
    pub(crate) config: RealtimeDomainConfig,
    pub(crate) subscription: Subscription<FeedItem>,
    pub(crate) debouncer: Debouncer,
    pub(crate) status: ChannelStatus,
    pub(crate) leases: BTreeSet<u64>,
}

impl ChannelSlot {
    /// First failure wins; later ones (e.g. the disconnect that follows a
    /// reported cause) are not reported again.
    fn mark_errored(&mut self, reason: String, drained: &mut Drained) {
        if self.status == ChannelStatus::Live {
            self.status = ChannelStatus::Errored(reason.clone());
            drained.error = Some(reason);
        }
    }
}

/// What draining one channel produced.
#[derive(Debug, Default)]
pub(crate) struct Drained {
    pub(crate) matched: usize,
    pub(crate) ignored: usize,
    /// Set when the channel transitioned to `Errored` during this drain.
    pub(crate) error: Option<String>,
}

/// A firing that is due: which keys to invalidate and how many notifications
/// it stands for.
#[derive(Debug)]
pub(crate) struct Due {
    pub(crate) channel_key: ChannelKey,
    pub(crate) query_keys: Vec<QueryKey>,
    pub(crate) coalesced: u32,
}

pub(crate) enum Released {
    Retained(usize),
    TornDown { cancelled_pending: bool },
}

#[derive(Debug, Default)]
pub(crate) struct ChannelRegistry {
    slots: BTreeMap<ChannelKey, ChannelSlot>,
    next_lease: u64,
}

impl ChannelRegistry {
    pub(crate) fn get(&self, key: &ChannelKey) -> Option<&ChannelSlot> {
        self.slots.get(key)
    }

    pub(crate) fn keys(&self) -> Vec<ChannelKey> {
        self.slots.keys().cloned().collect()
    }

    fn next_lease_id(&mut self) -> u64 {
        self.next_lease += 1;
        self.next_lease
    }

    /// Add a lease to an existing slot. Caller has checked the slot exists.
    pub(crate) fn add_lease(&mut self, key: &ChannelKey) -> Option<u64> {
        let id = self.next_lease_id();
        let slot = self.slots.get_mut(key)?;
        slot.leases.insert(id);
        Some(id)
    }

    /// Insert a freshly opened channel holding one lease.
    pub(crate) fn insert(
        &mut self,
        config: RealtimeDomainConfig,
        subscription: Subscription<FeedItem>,
    ) -> u64 {
        let id = self.next_lease_id();
        let slot = ChannelSlot {
            debouncer: Debouncer::new(config.debounce()),
            config,
            subscription,
            status: ChannelStatus::Live,
            leases: BTreeSet::from([id]),
        };
        self.slots.insert(slot.config.channel_key().clone(), slot);
        id
    }

    /// Drop one lease. Removes the slot (cancelling its debouncer) when it was
    /// the last one. `None` if the lease is unknown.
    pub(crate) fn release(&mut self, key: &ChannelKey, lease: u64) -> Option<Released> {
        let slot = self.slots.get_mut(key)?;
        if !slot.leases.remove(&lease) {
            return None;
        }
        if !slot.leases.is_empty() {
            return Some(Released::Retained(slot.leases.len()));
        }

        let mut slot = self.slots.remove(key)?;
        let cancelled_pending = slot.debouncer.cancel();
        Some(Released::TornDown { cancelled_pending })
    }

    /// Remove every slot, returning the keys that were live.
    pub(crate) fn clear(&mut self) -> Vec<ChannelKey> {
        std::mem::take(&mut self.slots).into_keys().collect()
    }

    /// Drain all queued events of every channel, in receive order.
    pub(crate) fn drain(&mut self, now: DateTime<Utc>) -> Vec<(ChannelKey, Drained)> {
        let mut out = Vec::new();
        for (key, slot) in self.slots.iter_mut() {
            let mut drained = Drained::default();
            loop {
                match slot.subscription.try_recv() {
                    Ok(Err(cause)) => {
                        slot.mark_errored(cause.to_string(), &mut drained);
                    }
                    Ok(Ok(event)) => {
                        if slot.config.matches(&event) {
                            slot.debouncer.notify(now);
                            drained.matched += 1;
                        } else {
                            drained.ignored += 1;
                        }
                    }
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => {
                        slot.mark_errored("change feed channel closed".to_string(), &mut drained);
                        break;
                    }
                }
            }
            if drained.matched > 0 || drained.ignored > 0 || drained.error.is_some() {
                out.push((key.clone(), drained));
            }
        }
        out
    }

    /// Collect firings whose deadline has been reached, resetting their debouncers.
    pub(crate) fn take_due(&mut self, now: DateTime<Utc>) -> Vec<Due> {
        self.slots
            .iter_mut()
            .filter_map(|(key, slot)| {
                slot.debouncer.poll(now).map(|coalesced| Due {
                    channel_key: key.clone(),
                    query_keys: slot.config.query_keys().to_vec(),
                    coalesced,
                })
            })
            .collect()
    }

    pub(crate) fn next_deadline(&self) -> Option<DateTime<Utc>> {
        self.slots
            .values()
            .filter_map(|slot| slot.debouncer.deadline())
            .min()
    }
}
