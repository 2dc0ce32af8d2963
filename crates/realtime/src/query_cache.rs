//! Query cache seam.
//!
//! The dispatcher only ever invalidates; reading and refetching queries is the
//! cache owner's business.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use serde::Serialize;
use thiserror::Error;

use crate::config::QueryKey;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QueryCacheError {
    #[error("query cache unavailable: {0}")]
    Unavailable(String),

    #[error("query cache lock poisoned")]
    Poisoned,
}

/// A cache of query results that can be invalidated by key prefix.
pub trait QueryCache: Send + Sync {
    /// Mark every query whose key starts with one of `prefixes` as stale.
    ///
    /// Returns how many cached queries were affected.
    fn invalidate(&self, prefixes: &[QueryKey]) -> Result<usize, QueryCacheError>;
}

impl<Q> QueryCache for Arc<Q>
where
    Q: QueryCache + ?Sized,
{
    fn invalidate(&self, prefixes: &[QueryKey]) -> Result<usize, QueryCacheError> {
        (**self).invalidate(prefixes)
    }
}

/// A cached query result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CachedQuery {
    pub data: serde_json::Value,
    /// Set by invalidation; the owner refetches stale queries on next read.
    pub stale: bool,
}

/// In-memory query cache for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryQueryCache {
    entries: RwLock<HashMap<QueryKey, CachedQuery>>,
    invalidations: Mutex<Vec<Vec<QueryKey>>>,
    failure: Mutex<Option<String>>,
}

impl InMemoryQueryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a fresh result for `key`.
    pub fn set(&self, key: impl Into<QueryKey>, data: serde_json::Value) {
        if let Ok(mut entries) = self.entries.write() {
            entries.insert(key.into(), CachedQuery { data, stale: false });
        }
    }

    pub fn get(&self, key: &QueryKey) -> Option<CachedQuery> {
        self.entries.read().ok()?.get(key).cloned()
    }

    pub fn is_stale(&self, key: &QueryKey) -> bool {
        self.get(key).is_some_and(|q| q.stale)
    }

    /// Successful invalidation calls, in order, with the prefixes passed.
    pub fn invalidations(&self) -> Vec<Vec<QueryKey>> {
        self.invalidations.lock().map(|log| log.clone()).unwrap_or_default()
    }

    pub fn invalidation_count(&self) -> usize {
        self.invalidations.lock().map(|log| log.len()).unwrap_or(0)
    }

    /// Make subsequent invalidations fail with `reason` (or succeed with `None`).
    pub fn fail_with(&self, reason: Option<String>) {
        if let Ok(mut failure) = self.failure.lock() {
            *failure = reason;
        }
    }
}

impl QueryCache for InMemoryQueryCache {
    fn invalidate(&self, prefixes: &[QueryKey]) -> Result<usize, QueryCacheError> {
        if let Some(reason) = self.failure.lock().map_err(|_| QueryCacheError::Poisoned)?.clone() {
            return Err(QueryCacheError::Unavailable(reason));
        }

        let mut entries = self.entries.write().map_err(|_| QueryCacheError::Poisoned)?;
        let mut affected = 0;
        for (key, query) in entries.iter_mut() {
            if prefixes.iter().any(|p| key.starts_with(p)) {
                query.stale = true;
                affected += 1;
            }
        }

        self.invalidations
            .lock()
            .map_err(|_| QueryCacheError::Poisoned)?
            .push(prefixes.to_vec());

        Ok(affected)
    }
}
