//! Per-(user, business unit) permission matrix cache.
//!
//! Entries live for a fixed TTL. A stale entry is never served: the next check
//! for that key refetches the full matrix in one round trip and replaces the
//! entry. Eviction happens at read time only.
//!
//! Invalidation wins over in-flight fetches: every `invalidate*`/`clear`
//! bumps an epoch, and a fetch that started under an older epoch returns its
//! rows to its caller without caching them.
//!
//! The cache is an explicit object; whoever owns the session (or request)
//! scope constructs it and passes it to the code that checks permissions.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{debug, warn};

use stockroom_core::{BusinessUnitId, Clock, UserId};

use crate::{Action, PermissionCheckResult, PermissionMatrix, PermissionSource, PermissionSourceError, Resource};

/// Default time-to-live for a cached permission matrix.
pub const DEFAULT_PERMISSION_TTL: Duration = Duration::minutes(5);

type CacheKey = (UserId, Option<BusinessUnitId>);

/// A cached permission matrix for one `(user, business unit)` pair.
#[derive(Debug, Clone)]
pub struct PermissionCacheEntry {
    pub permissions: Arc<PermissionMatrix>,
    pub timestamp: DateTime<Utc>,
    pub business_unit_id: Option<BusinessUnitId>,
}

impl PermissionCacheEntry {
    fn is_stale(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        now.signed_duration_since(self.timestamp) >= ttl
    }
}

/// Cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub fetch_failures: u64,
}

/// Permission cache backed by a [`PermissionSource`].
pub struct PermissionCache<S> {
    source: S,
    clock: Arc<dyn Clock>,
    ttl: Duration,
    entries: RwLock<HashMap<CacheKey, PermissionCacheEntry>>,
    hits: AtomicU64,
    misses: AtomicU64,
    fetch_failures: AtomicU64,
    /// Bumped (under the entries write lock) by every invalidation.
    epoch: AtomicU64,
}

impl<S: PermissionSource> PermissionCache<S> {
    pub fn new(source: S, clock: Arc<dyn Clock>) -> Self {
        Self::with_ttl(source, clock, DEFAULT_PERMISSION_TTL)
    }

    pub fn with_ttl(source: S, clock: Arc<dyn Clock>, ttl: Duration) -> Self {
        Self {
            source,
            clock,
            ttl,
            entries: RwLock::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            fetch_failures: AtomicU64::new(0),
            epoch: AtomicU64::new(0),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Check whether `user_id` may perform `action` on `resource`.
    ///
    /// Never fails: a fetch error yields a deny carrying the cause.
    pub async fn check(
        &self,
        user_id: UserId,
        resource: &Resource,
        action: Action,
        business_unit_id: Option<BusinessUnitId>,
    ) -> PermissionCheckResult {
        match self.permissions(user_id, business_unit_id).await {
            Ok(matrix) => PermissionCheckResult::evaluate(&matrix, resource, action),
            Err(err) => PermissionCheckResult::denied(resource.clone(), action, err.to_string()),
        }
    }

    /// Allowed if any of `requests` is allowed. Resolves the matrix once.
    ///
    /// Returns the first allowed result, or a deny naming every request.
    pub async fn check_any(
        &self,
        user_id: UserId,
        requests: &[(Resource, Action)],
        business_unit_id: Option<BusinessUnitId>,
    ) -> PermissionCheckResult {
        let Some((first_resource, first_action)) = requests.first() else {
            return PermissionCheckResult::denied(
                Resource::new(""),
                Action::View,
                "no permissions requested",
            );
        };

        let matrix = match self.permissions(user_id, business_unit_id).await {
            Ok(m) => m,
            Err(err) => {
                return PermissionCheckResult::denied(
                    first_resource.clone(),
                    *first_action,
                    err.to_string(),
                );
            }
        };

        if let Some((resource, action)) = requests
            .iter()
            .find(|(resource, action)| matrix.allows(resource, *action))
        {
            return PermissionCheckResult::allowed(resource.clone(), *action);
        }

        let wanted: Vec<String> = requests
            .iter()
            .map(|(resource, action)| format!("{resource}.{action}"))
            .collect();
        PermissionCheckResult::denied(
            first_resource.clone(),
            *first_action,
            format!("none of the requested permissions are granted: {}", wanted.join(", ")),
        )
    }

    /// Resolve the full matrix for `(user_id, business_unit_id)`, via the cache.
    pub async fn permissions(
        &self,
        user_id: UserId,
        business_unit_id: Option<BusinessUnitId>,
    ) -> Result<Arc<PermissionMatrix>, PermissionSourceError> {
        let key = (user_id, business_unit_id);
        let now = self.clock.now();

        if let Some(matrix) = self.fresh(&key, now) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            debug!(%user_id, business_unit_id = ?business_unit_id, "permission cache hit");
            return Ok(matrix);
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        debug!(%user_id, business_unit_id = ?business_unit_id, "permission cache miss; fetching");
        let epoch = self.epoch.load(Ordering::Acquire);

        let rows = match self.source.fetch_rows(user_id, business_unit_id).await {
            Ok(rows) => rows,
            Err(err) => {
                self.fetch_failures.fetch_add(1, Ordering::Relaxed);
                warn!(%user_id, business_unit_id = ?business_unit_id, error = %err, "permission fetch failed; denying");
                return Err(err);
            }
        };

        let matrix = Arc::new(PermissionMatrix::from_rows(&rows));
        let entry = PermissionCacheEntry {
            permissions: Arc::clone(&matrix),
            timestamp: self.clock.now(),
            business_unit_id,
        };

        // If the lock is poisoned the result is still returned; it just isn't cached.
        if let Ok(mut entries) = self.entries.write() {
            if self.epoch.load(Ordering::Acquire) == epoch {
                entries.insert(key, entry);
            } else {
                debug!(%user_id, business_unit_id = ?business_unit_id, "invalidated during fetch; result not cached");
            }
        }

        Ok(matrix)
    }

    /// The live entry for a key, if present and not stale.
    pub fn entry(
        &self,
        user_id: UserId,
        business_unit_id: Option<BusinessUnitId>,
    ) -> Option<PermissionCacheEntry> {
        let now = self.clock.now();
        let entries = self.entries.read().ok()?;
        entries
            .get(&(user_id, business_unit_id))
            .filter(|e| !e.is_stale(now, self.ttl))
            .cloned()
    }

    /// Drop the entry for `(user_id, business_unit_id)`.
    ///
    /// Call after role or permission mutations. Returns whether an entry existed.
    pub fn invalidate(&self, user_id: UserId, business_unit_id: Option<BusinessUnitId>) -> bool {
        let removed = match self.entries.write() {
            Ok(mut entries) => {
                self.epoch.fetch_add(1, Ordering::AcqRel);
                entries.remove(&(user_id, business_unit_id)).is_some()
            }
            Err(_) => false,
        };
        debug!(%user_id, business_unit_id = ?business_unit_id, removed, "permission cache entry invalidated");
        removed
    }

    /// Drop every scope cached for `user_id` (logout).
    pub fn invalidate_user(&self, user_id: UserId) -> usize {
        let Ok(mut entries) = self.entries.write() else {
            return 0;
        };
        self.epoch.fetch_add(1, Ordering::AcqRel);
        let before = entries.len();
        entries.retain(|(uid, _), _| *uid != user_id);
        before - entries.len()
    }

    /// Drop everything (process/session teardown).
    pub fn clear(&self) {
        if let Ok(mut entries) = self.entries.write() {
            self.epoch.fetch_add(1, Ordering::AcqRel);
            entries.clear();
        }
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            fetch_failures: self.fetch_failures.load(Ordering::Relaxed),
        }
    }

    fn fresh(&self, key: &CacheKey, now: DateTime<Utc>) -> Option<Arc<PermissionMatrix>> {
        let entries = self.entries.read().ok()?;
        let entry = entries.get(key)?;
        if entry.is_stale(now, self.ttl) {
            return None;
        }
        Some(Arc::clone(&entry.permissions))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{InMemoryPermissionSource, RawPermissionRow};
    use std::sync::atomic::AtomicBool;

    use async_trait::async_trait;
    use stockroom_core::ManualClock;
    use tokio::sync::Notify;

    fn setup() -> (
        PermissionCache<Arc<InMemoryPermissionSource>>,
        Arc<InMemoryPermissionSource>,
        Arc<ManualClock>,
    ) {
        let source = Arc::new(InMemoryPermissionSource::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let cache = PermissionCache::new(Arc::clone(&source), clock.clone());
        (cache, source, clock)
    }

    /// Source whose first fetch reads its rows, then parks until released.
    #[derive(Default)]
    struct ParkedSource {
        inner: InMemoryPermissionSource,
        parked: AtomicBool,
        fetching: Notify,
        resume: Notify,
    }

    #[async_trait]
    impl PermissionSource for ParkedSource {
        async fn fetch_rows(
            &self,
            user_id: UserId,
            business_unit_id: Option<BusinessUnitId>,
        ) -> Result<Vec<RawPermissionRow>, PermissionSourceError> {
            let rows = self.inner.fetch_rows(user_id, business_unit_id).await;
            if !self.parked.swap(true, Ordering::SeqCst) {
                self.fetching.notify_one();
                self.resume.notified().await;
            }
            rows
        }
    }

    fn stock_requests() -> Resource {
        Resource::new("stock_requests")
    }

    #[tokio::test]
    async fn second_check_within_ttl_does_not_fetch() {
        let (cache, source, clock) = setup();
        let user = UserId::new();
        source.set_rows(user, None, vec![RawPermissionRow::view_only("stock_requests")]);

        let first = cache.check(user, &stock_requests(), Action::View, None).await;
        clock.advance(Duration::seconds(30));
        let second = cache.check(user, &stock_requests(), Action::Edit, None).await;

        assert!(first.allowed);
        assert!(!second.allowed);
        assert_eq!(source.fetch_count(), 1);
        assert_eq!(cache.stats(), CacheStats { hits: 1, misses: 1, fetch_failures: 0 });
    }

    #[tokio::test]
    async fn ttl_boundary_refetches_and_refreshes_timestamp() {
        let (cache, source, clock) = setup();
        let user = UserId::new();
        source.set_rows(user, None, vec![RawPermissionRow::full("stock_requests")]);

        let t0 = clock.now();
        cache.check(user, &stock_requests(), Action::View, None).await;
        assert_eq!(source.fetch_count(), 1);

        clock.advance(Duration::minutes(4) + Duration::seconds(59));
        cache.check(user, &stock_requests(), Action::View, None).await;
        assert_eq!(source.fetch_count(), 1);

        clock.set(t0 + Duration::minutes(5) + Duration::seconds(1));
        cache.check(user, &stock_requests(), Action::View, None).await;
        assert_eq!(source.fetch_count(), 2);

        let entry = cache.entry(user, None).unwrap();
        assert_eq!(entry.timestamp, t0 + Duration::minutes(5) + Duration::seconds(1));
    }

    #[tokio::test]
    async fn invalidate_forces_fresh_fetch() {
        let (cache, source, _clock) = setup();
        let user = UserId::new();
        let unit = Some(BusinessUnitId::new());
        source.set_rows(user, unit, vec![RawPermissionRow::view_only("stock_requests")]);

        assert!(!cache.check(user, &stock_requests(), Action::Delete, unit).await.allowed);

        source.set_rows(user, unit, vec![RawPermissionRow::full("stock_requests")]);
        assert!(cache.invalidate(user, unit));

        assert!(cache.check(user, &stock_requests(), Action::Delete, unit).await.allowed);
        assert_eq!(source.fetch_count(), 2);
    }

    #[tokio::test]
    async fn invalidate_during_fetch_keeps_old_rows_out_of_cache() {
        let source = Arc::new(ParkedSource::default());
        let cache = PermissionCache::new(Arc::clone(&source), Arc::new(ManualClock::new(Utc::now())));
        let user = UserId::new();
        source.inner.set_rows(user, None, vec![RawPermissionRow::view_only("stock_requests")]);

        let (in_flight, _) = tokio::join!(cache.permissions(user, None), async {
            source.fetching.notified().await;
            // Role change lands while the first fetch is still out.
            source.inner.set_rows(user, None, vec![RawPermissionRow::full("stock_requests")]);
            cache.invalidate(user, None);
            source.resume.notify_one();
        });

        // The caller that started before the change still gets its answer...
        assert!(!in_flight.unwrap().allows(&stock_requests(), Action::Delete));
        // ...but it was not cached, so the next check sees the new role.
        assert!(cache.entry(user, None).is_none());
        assert!(cache.check(user, &stock_requests(), Action::Delete, None).await.allowed);
        assert_eq!(source.inner.fetch_count(), 2);
    }

    #[tokio::test]
    async fn clear_during_fetch_also_discards_result() {
        let source = Arc::new(ParkedSource::default());
        let cache = PermissionCache::new(Arc::clone(&source), Arc::new(ManualClock::new(Utc::now())));
        let user = UserId::new();

        let (in_flight, _) = tokio::join!(cache.permissions(user, None), async {
            source.fetching.notified().await;
            cache.clear();
            source.resume.notify_one();
        });

        assert!(in_flight.is_ok());
        assert!(cache.entry(user, None).is_none());
    }

    #[tokio::test]
    async fn scopes_are_cached_independently() {
        let (cache, source, _clock) = setup();
        let user = UserId::new();
        let warehouse = Some(BusinessUnitId::new());
        source.set_rows(user, None, vec![RawPermissionRow::view_only("stock_requests")]);
        source.set_rows(user, warehouse, vec![RawPermissionRow::full("stock_requests")]);

        assert!(!cache.check(user, &stock_requests(), Action::Create, None).await.allowed);
        assert!(cache.check(user, &stock_requests(), Action::Create, warehouse).await.allowed);
        assert_eq!(source.fetch_count(), 2);

        // Invalidating one scope leaves the other cached.
        cache.invalidate(user, None);
        assert!(cache.entry(user, warehouse).is_some());
        assert!(cache.entry(user, None).is_none());
    }

    #[tokio::test]
    async fn fetch_failure_fails_closed_and_caches_nothing() {
        let (cache, source, _clock) = setup();
        let user = UserId::new();
        source.set_rows(user, None, vec![RawPermissionRow::full("stock_requests")]);
        source.fail_with(Some(PermissionSourceError::Backend("connection refused".to_string())));

        let result = cache.check(user, &stock_requests(), Action::View, None).await;
        assert!(!result.allowed);
        assert_eq!(
            result.reason.as_deref(),
            Some("permission backend error: connection refused")
        );
        assert!(cache.entry(user, None).is_none());

        source.fail_with(None);
        let result = cache.check(user, &stock_requests(), Action::View, None).await;
        assert!(result.allowed);
        assert_eq!(source.fetch_count(), 2);
        assert_eq!(cache.stats().fetch_failures, 1);
    }

    #[tokio::test]
    async fn invalidate_user_drops_all_scopes() {
        let (cache, source, _clock) = setup();
        let alice = UserId::new();
        let bob = UserId::new();
        let unit = Some(BusinessUnitId::new());
        source.set_rows(alice, None, vec![]);
        source.set_rows(alice, unit, vec![]);
        source.set_rows(bob, None, vec![]);

        cache.permissions(alice, None).await.unwrap();
        cache.permissions(alice, unit).await.unwrap();
        cache.permissions(bob, None).await.unwrap();

        assert_eq!(cache.invalidate_user(alice), 2);
        assert!(cache.entry(bob, None).is_some());

        cache.clear();
        assert!(cache.entry(bob, None).is_none());
    }

    #[tokio::test]
    async fn check_any_resolves_matrix_once() {
        let (cache, source, _clock) = setup();
        let user = UserId::new();
        source.set_rows(user, None, vec![RawPermissionRow::view_only("delivery_notes")]);

        let allowed = cache
            .check_any(
                user,
                &[
                    (Resource::new("commissions"), Action::View),
                    (Resource::new("delivery_notes"), Action::View),
                ],
                None,
            )
            .await;
        assert!(allowed.allowed);
        assert_eq!(allowed.resource, Resource::new("delivery_notes"));

        let denied = cache
            .check_any(user, &[(Resource::new("commissions"), Action::Edit)], None)
            .await;
        assert!(!denied.allowed);
        assert_eq!(source.fetch_count(), 1);

        let empty = cache.check_any(user, &[], None).await;
        assert!(!empty.allowed);
    }
}
