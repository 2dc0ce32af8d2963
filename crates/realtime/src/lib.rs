//! `stockroom-realtime` — change-driven query invalidation.
//!
//! Consumers subscribe to a business domain's change feed through a
//! [`RealtimeDispatcher`]. The dispatcher keeps one feed channel per channel
//! key, coalesces bursts of row changes with a trailing-edge debounce and then
//! invalidates the domain's query keys in the [`QueryCache`].
//!
//! ```text
//! ChangeFeed ──events──▶ ChannelRegistry (per channel key: refs + Debouncer)
//!                                  │ tick(): deadline reached
//!                                  ▼
//!                         QueryCache::invalidate(query_keys)
//! ```

pub mod config;
pub mod consumer;
pub mod debounce;
pub mod dispatcher;
pub mod driver;
pub mod feed;
pub mod in_memory_feed;
pub mod query_cache;
mod registry;

pub use config::{ChangeKind, ChannelKey, QueryKey, RealtimeDomainConfig, RealtimeDomainConfigBuilder};
pub use consumer::RealtimeConsumer;
pub use debounce::{DebounceState, Debouncer};
pub use dispatcher::{ChannelError, FiredInvalidation, Lease, RealtimeDispatcher, RealtimeError, TickReport};
pub use driver::run_dispatcher;
pub use feed::{ChangeEvent, ChangeFeed, FeedError, FeedItem, Subscription};
pub use in_memory_feed::InMemoryChangeFeed;
pub use query_cache::{CachedQuery, InMemoryQueryCache, QueryCache, QueryCacheError};
pub use registry::ChannelStatus;
