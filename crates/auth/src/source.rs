//! Backing store abstraction for raw permission rows.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use thiserror::Error;

use stockroom_core::{BusinessUnitId, UserId};

use crate::RawPermissionRow;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PermissionSourceError {
    /// The store could not be reached or the query failed.
    #[error("permission backend error: {0}")]
    Backend(String),

    /// Rows came back but could not be decoded.
    #[error("permission row decode error: {0}")]
    Decode(String),
}

/// Fetches every permission row for a user within a scope, in one round trip.
#[async_trait]
pub trait PermissionSource: Send + Sync {
    async fn fetch_rows(
        &self,
        user_id: UserId,
        business_unit_id: Option<BusinessUnitId>,
    ) -> Result<Vec<RawPermissionRow>, PermissionSourceError>;
}

#[async_trait]
impl<S> PermissionSource for Arc<S>
where
    S: PermissionSource + ?Sized,
{
    async fn fetch_rows(
        &self,
        user_id: UserId,
        business_unit_id: Option<BusinessUnitId>,
    ) -> Result<Vec<RawPermissionRow>, PermissionSourceError> {
        (**self).fetch_rows(user_id, business_unit_id).await
    }
}

/// In-memory permission source for tests/dev.
///
/// Counts fetches and can be told to fail, which is what cache tests need.
#[derive(Debug, Default)]
pub struct InMemoryPermissionSource {
    rows: RwLock<HashMap<(UserId, Option<BusinessUnitId>), Vec<RawPermissionRow>>>,
    failure: Mutex<Option<PermissionSourceError>>,
    fetches: AtomicUsize,
}

impl InMemoryPermissionSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the rows stored for `(user_id, business_unit_id)`.
    pub fn set_rows(
        &self,
        user_id: UserId,
        business_unit_id: Option<BusinessUnitId>,
        rows: Vec<RawPermissionRow>,
    ) {
        if let Ok(mut map) = self.rows.write() {
            map.insert((user_id, business_unit_id), rows);
        }
    }

    /// Make every subsequent fetch fail with `error` (or succeed again with `None`).
    pub fn fail_with(&self, error: Option<PermissionSourceError>) {
        if let Ok(mut failure) = self.failure.lock() {
            *failure = error;
        }
    }

    /// Number of fetches performed so far, failed ones included.
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PermissionSource for InMemoryPermissionSource {
    async fn fetch_rows(
        &self,
        user_id: UserId,
        business_unit_id: Option<BusinessUnitId>,
    ) -> Result<Vec<RawPermissionRow>, PermissionSourceError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);

        let failure = self
            .failure
            .lock()
            .map_err(|_| PermissionSourceError::Backend("lock poisoned".to_string()))?
            .clone();
        if let Some(err) = failure {
            return Err(err);
        }

        let map = self
            .rows
            .read()
            .map_err(|_| PermissionSourceError::Backend("lock poisoned".to_string()))?;
        Ok(map
            .get(&(user_id, business_unit_id))
            .cloned()
            .unwrap_or_default())
    }
}
