//! Read-through stale-while-revalidate cache for aggregate views
//!
//! Each key is in one of three states, by age of the cached value:
//!
//! ```text
//!  0 ─────────── stale_after ─────────── max_age ──────────►
//!  │    fresh     │        stale          │     expired
//!  │ serve cached │ serve cached +        │ fetch, then serve
//!  │              │ one background fetch  │
//! ```
//!
//! At most one fetch per key runs at a time; concurrent callers wait on the
//! running fetch instead of starting their own. Background refreshes run on
//! a bounded pool and [`AggregateCache::shutdown`] waits for them.
//!
//! Invalidating a key detaches its running fetch: the fetch still answers
//! the callers already waiting on it, but its result is not stored and the
//! next caller starts a new fetch.

use dashmap::DashMap;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Notify, Semaphore};
use tracing::{debug, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::CacheSection;
use crate::error::Result;

/// Called with the key and new value after each background refresh
pub type UpdateCallback<V> = Arc<dyn Fn(&str, &V) + Send + Sync>;

/// Fetch results are broadcast to waiters, so errors travel as strings
type FetchOutcome<V> = std::result::Result<V, String>;

#[derive(Debug, Clone)]
pub struct AggregateCacheConfig {
    pub stale_after: Duration,
    pub max_age: Duration,
    pub max_background_refreshes: usize,
}

impl Default for AggregateCacheConfig {
    fn default() -> Self {
        Self::from(&CacheSection::default())
    }
}

impl From<&CacheSection> for AggregateCacheConfig {
    fn from(section: &CacheSection) -> Self {
        Self {
            stale_after: Duration::from_secs(section.stale_after_secs),
            max_age: Duration::from_secs(section.max_age_secs),
            max_background_refreshes: section.max_background_refreshes.max(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    Fresh,
    Stale,
    Expired,
}

/// Counters since construction
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub stale_hits: u64,
    pub misses: u64,
    pub fetches: u64,
    pub fetch_failures: u64,
    pub coalesced: u64,
    pub entries: usize,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    stale_hits: AtomicU64,
    misses: AtomicU64,
    fetches: AtomicU64,
    fetch_failures: AtomicU64,
    coalesced: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

struct CachedValue<V> {
    data: V,
    fetched_at: Instant,
}

struct Inner<V> {
    config: AggregateCacheConfig,
    clock: Arc<dyn Clock>,
    entries: DashMap<String, CachedValue<V>>,
    in_flight: Mutex<HashMap<String, Flight<V>>>,
    next_flight: AtomicU64,
    refresh_permits: Arc<Semaphore>,
    pending_refreshes: AtomicUsize,
    idle: Notify,
    closed: AtomicBool,
    counters: Counters,
}

/// A running fetch as seen by callers looking it up
struct Flight<V> {
    id: u64,
    sender: broadcast::Sender<FetchOutcome<V>>,
}

impl<V: Clone> Inner<V> {
    fn in_flight(&self) -> MutexGuard<'_, HashMap<String, Flight<V>>> {
        self.in_flight.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Unregister `key` only if the registration is still flight `id`
    fn release(in_flight: &mut HashMap<String, Flight<V>>, key: &str, id: u64) -> bool {
        if in_flight.get(key).is_some_and(|flight| flight.id == id) {
            in_flight.remove(key);
            true
        } else {
            false
        }
    }

    fn freshness(&self, fetched_at: Instant) -> Freshness {
        let age = self.clock.now().saturating_duration_since(fetched_at);
        if age >= self.config.max_age {
            Freshness::Expired
        } else if age >= self.config.stale_after {
            Freshness::Stale
        } else {
            Freshness::Fresh
        }
    }

    fn lookup(&self, key: &str) -> Option<(V, Freshness)> {
        self.entries
            .get(key)
            .map(|entry| (entry.data.clone(), self.freshness(entry.fetched_at)))
    }
}

/// Registration of the single running fetch for a key.
///
/// Dropping it without completing (cancelled caller, refused permit)
/// releases the key and wakes waiters with an error.
struct InFlight<V: Clone> {
    inner: Arc<Inner<V>>,
    key: String,
    id: u64,
    sender: broadcast::Sender<FetchOutcome<V>>,
    registered: bool,
}

impl<V: Clone> InFlight<V> {
    /// Store a successful value, then release the key and wake waiters.
    ///
    /// Store and release happen under one lock, so a caller that finds no
    /// fetch running also finds the new entry. A flight detached by
    /// invalidation stores nothing.
    fn complete(mut self, outcome: FetchOutcome<V>) {
        {
            let mut in_flight = self.inner.in_flight();
            let attached = Inner::release(&mut in_flight, &self.key, self.id);
            match &outcome {
                Ok(data) if attached => {
                    self.inner.entries.insert(
                        self.key.clone(),
                        CachedValue {
                            data: data.clone(),
                            fetched_at: self.inner.clock.now(),
                        },
                    );
                }
                Ok(_) => debug!(key = %self.key, "Key invalidated during fetch, result not cached"),
                Err(_) => bump(&self.inner.counters.fetch_failures),
            }
        }
        self.registered = false;
        let _ = self.sender.send(outcome);
    }
}

impl<V: Clone> Drop for InFlight<V> {
    fn drop(&mut self) {
        if self.registered {
            Inner::release(&mut self.inner.in_flight(), &self.key, self.id);
        }
    }
}

enum Slot<V: Clone> {
    /// Someone refreshed the key while we were getting here
    Ready(V),
    Leader(InFlight<V>),
    Follower(broadcast::Receiver<FetchOutcome<V>>),
}

/// Decrements the pending-refresh count when a background task ends
struct PendingGuard<V>(Arc<Inner<V>>);

impl<V> Drop for PendingGuard<V> {
    fn drop(&mut self) {
        if self.0.pending_refreshes.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

/// Stale-while-revalidate cache service.
///
/// Cheap to clone; clones share state. Independent instances share
/// nothing, so tests can run several side by side.
pub struct AggregateCache<V> {
    inner: Arc<Inner<V>>,
}

impl<V> Clone for AggregateCache<V> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<V: Clone + Send + Sync + 'static> AggregateCache<V> {
    pub fn new(config: AggregateCacheConfig, clock: Arc<dyn Clock>) -> Self {
        let permits = config.max_background_refreshes.max(1);
        Self {
            inner: Arc::new(Inner {
                config,
                clock,
                entries: DashMap::new(),
                in_flight: Mutex::new(HashMap::new()),
                next_flight: AtomicU64::new(0),
                refresh_permits: Arc::new(Semaphore::new(permits)),
                pending_refreshes: AtomicUsize::new(0),
                idle: Notify::new(),
                closed: AtomicBool::new(false),
                counters: Counters::default(),
            }),
        }
    }

    pub fn with_system_clock(config: AggregateCacheConfig) -> Self {
        Self::new(config, Arc::new(SystemClock))
    }

    /// Read through the cache.
    ///
    /// Fresh values are returned as is. Stale values are returned at once
    /// and `fetcher` runs in the background (unless a fetch for the key is
    /// already running); `on_update` fires when it lands. Missing or expired
    /// values are fetched before returning.
    ///
    /// A failed fetch keeps the previous entry. `None` comes back only when
    /// the fetch failed and nothing was ever cached for the key.
    pub async fn get<F, Fut>(&self, key: &str, fetcher: F, on_update: Option<UpdateCallback<V>>) -> Option<V>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<V>> + Send + 'static,
    {
        let prior = match self.inner.lookup(key) {
            Some((data, Freshness::Fresh)) => {
                bump(&self.inner.counters.hits);
                return Some(data);
            }
            Some((data, Freshness::Stale)) => {
                bump(&self.inner.counters.stale_hits);
                self.spawn_refresh(key, fetcher, on_update);
                return Some(data);
            }
            Some((data, Freshness::Expired)) => Some(data),
            None => None,
        };

        bump(&self.inner.counters.misses);
        match self.fetch_coalesced(key, fetcher).await {
            Ok(data) => Some(data),
            Err(reason) => {
                warn!(key = %key, error = %reason, has_prior = prior.is_some(), "Aggregate fetch failed");
                prior
            }
        }
    }

    /// Fetch now unless the cached value is still fresh
    pub async fn preload<F, Fut>(&self, key: &str, fetcher: F) -> Option<V>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<V>> + Send + 'static,
    {
        if let Some((data, Freshness::Fresh)) = self.inner.lookup(key) {
            return Some(data);
        }
        match self.fetch_coalesced(key, fetcher).await {
            Ok(data) => Some(data),
            Err(reason) => {
                warn!(key = %key, error = %reason, "Aggregate preload failed");
                None
            }
        }
    }

    /// Cached value unless expired; never fetches
    pub fn peek(&self, key: &str) -> Option<V> {
        match self.inner.lookup(key) {
            Some((data, Freshness::Fresh | Freshness::Stale)) => Some(data),
            _ => None,
        }
    }

    pub fn freshness(&self, key: &str) -> Option<Freshness> {
        self.inner.lookup(key).map(|(_, freshness)| freshness)
    }

    /// Drop the entry and detach any running fetch for it
    pub fn invalidate(&self, key: &str) {
        let mut in_flight = self.inner.in_flight();
        in_flight.remove(key);
        self.inner.entries.remove(key);
    }

    pub fn invalidate_all(&self) {
        let mut in_flight = self.inner.in_flight();
        in_flight.clear();
        self.inner.entries.clear();
    }

    pub fn stats(&self) -> CacheStats {
        let counters = &self.inner.counters;
        CacheStats {
            hits: counters.hits.load(Ordering::Relaxed),
            stale_hits: counters.stale_hits.load(Ordering::Relaxed),
            misses: counters.misses.load(Ordering::Relaxed),
            fetches: counters.fetches.load(Ordering::Relaxed),
            fetch_failures: counters.fetch_failures.load(Ordering::Relaxed),
            coalesced: counters.coalesced.load(Ordering::Relaxed),
            entries: self.inner.entries.len(),
        }
    }

    /// Background refreshes queued or running
    pub fn pending_refreshes(&self) -> usize {
        self.inner.pending_refreshes.load(Ordering::SeqCst)
    }

    /// Wait until no background refresh is queued or running
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            if self.inner.pending_refreshes.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Stop scheduling background refreshes and wait for outstanding ones.
    /// Reads keep working; stale values are served without refresh.
    pub async fn shutdown(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.wait_idle().await;
        debug!("Aggregate cache shut down");
    }

    fn join_or_lead(&self, key: &str) -> Slot<V> {
        let mut in_flight = self.inner.in_flight();
        if let Some(flight) = in_flight.get(key) {
            return Slot::Follower(flight.sender.subscribe());
        }
        if let Some((data, Freshness::Fresh)) = self.inner.lookup(key) {
            return Slot::Ready(data);
        }
        let (sender, _) = broadcast::channel(1);
        let id = self.inner.next_flight.fetch_add(1, Ordering::Relaxed);
        in_flight.insert(
            key.to_string(),
            Flight {
                id,
                sender: sender.clone(),
            },
        );
        Slot::Leader(InFlight {
            inner: self.inner.clone(),
            key: key.to_string(),
            id,
            sender,
            registered: true,
        })
    }

    async fn fetch_coalesced<F, Fut>(&self, key: &str, fetcher: F) -> FetchOutcome<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V>>,
    {
        match self.join_or_lead(key) {
            Slot::Ready(data) => Ok(data),
            Slot::Follower(mut receiver) => {
                bump(&self.inner.counters.coalesced);
                receiver
                    .recv()
                    .await
                    .unwrap_or_else(|_| Err("fetch abandoned".to_string()))
            }
            Slot::Leader(flight) => {
                bump(&self.inner.counters.fetches);
                let outcome = fetcher().await.map_err(|e| e.to_string());
                flight.complete(outcome.clone());
                outcome
            }
        }
    }

    fn spawn_refresh<F, Fut>(&self, key: &str, fetcher: F, on_update: Option<UpdateCallback<V>>)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<V>> + Send + 'static,
    {
        if self.inner.closed.load(Ordering::SeqCst) {
            return;
        }
        let flight = match self.join_or_lead(key) {
            Slot::Leader(flight) => flight,
            // Already refreshing
            _ => return,
        };

        self.inner.pending_refreshes.fetch_add(1, Ordering::SeqCst);
        let inner = self.inner.clone();
        let key = key.to_string();

        tokio::spawn(async move {
            let _pending = PendingGuard(inner.clone());
            let Ok(_permit) = inner.refresh_permits.clone().acquire_owned().await else {
                return;
            };

            bump(&inner.counters.fetches);
            let outcome = fetcher().await.map_err(|e| e.to_string());
            flight.complete(outcome.clone());

            match outcome {
                Ok(data) => {
                    debug!(key = %key, "Background refresh completed");
                    if let Some(callback) = on_update {
                        callback(&key, &data);
                    }
                }
                Err(reason) => {
                    warn!(key = %key, error = %reason, "Background refresh failed, keeping stale value");
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::StorageError;
    use std::sync::atomic::AtomicU32;

    fn cache(clock: &ManualClock) -> AggregateCache<String> {
        AggregateCache::new(
            AggregateCacheConfig {
                stale_after: Duration::from_secs(30),
                max_age: Duration::from_secs(300),
                max_background_refreshes: 2,
            },
            Arc::new(clock.clone()),
        )
    }

    type BoxedFetch = std::pin::Pin<Box<dyn Future<Output = Result<String>> + Send>>;

    /// Fetcher returning `value`, counting calls, optionally slow
    fn counting(
        calls: &Arc<AtomicU32>,
        value: &str,
        delay: Duration,
    ) -> impl FnOnce() -> BoxedFetch + Send + 'static {
        let calls = calls.clone();
        let value = value.to_string();
        move || -> BoxedFetch {
            Box::pin(async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(delay).await;
                Ok::<_, StorageError>(value)
            })
        }
    }

    fn failing(
        calls: &Arc<AtomicU32>,
    ) -> impl FnOnce() -> BoxedFetch + Send + 'static {
        let calls = calls.clone();
        move || -> BoxedFetch {
            Box::pin(async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<String, _>(StorageError::unavailable("dashboard", "down"))
            })
        }
    }

    #[tokio::test]
    async fn test_fresh_value_served_without_fetch() {
        let clock = ManualClock::new();
        let cache = cache(&clock);
        let calls = Arc::new(AtomicU32::new(0));

        let first = cache.get("courses", counting(&calls, "v1", Duration::ZERO), None).await;
        clock.advance(Duration::from_secs(10));
        let second = cache.get("courses", counting(&calls, "v2", Duration::ZERO), None).await;

        assert_eq!(first.as_deref(), Some("v1"));
        assert_eq!(second.as_deref(), Some("v1"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.stats().hits, 1);
    }

    #[tokio::test]
    async fn test_stale_value_served_and_refreshed_once() {
        let clock = ManualClock::new();
        let cache = cache(&clock);
        let calls = Arc::new(AtomicU32::new(0));
        let updates = Arc::new(AtomicU32::new(0));

        cache.get("courses", counting(&calls, "v1", Duration::ZERO), None).await;
        clock.advance(Duration::from_secs(31));

        let on_update: UpdateCallback<String> = {
            let updates = updates.clone();
            Arc::new(move |_key: &str, value: &String| {
                assert_eq!(value, "v2");
                updates.fetch_add(1, Ordering::SeqCst);
            })
        };

        let slow = Duration::from_millis(50);
        let first = cache
            .get("courses", counting(&calls, "v2", slow), Some(on_update.clone()))
            .await;
        let second = cache
            .get("courses", counting(&calls, "v3", slow), Some(on_update))
            .await;

        assert_eq!(first.as_deref(), Some("v1"));
        assert_eq!(second.as_deref(), Some("v1"));

        cache.wait_idle().await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(updates.load(Ordering::SeqCst), 1);
        assert_eq!(cache.peek("courses").as_deref(), Some("v2"));
        assert_eq!(cache.freshness("courses"), Some(Freshness::Fresh));
    }

    #[tokio::test]
    async fn test_expired_value_blocks_for_fresh_fetch() {
        let clock = ManualClock::new();
        let cache = cache(&clock);
        let calls = Arc::new(AtomicU32::new(0));

        cache.get("courses", counting(&calls, "v1", Duration::ZERO), None).await;
        clock.advance(Duration::from_secs(301));

        assert!(cache.peek("courses").is_none());
        let value = cache.get("courses", counting(&calls, "v2", Duration::ZERO), None).await;

        assert_eq!(value.as_deref(), Some("v2"));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(cache.pending_refreshes(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_misses_share_one_fetch() {
        let clock = ManualClock::new();
        let cache = cache(&clock);
        let calls = Arc::new(AtomicU32::new(0));

        let gets = (0..10).map(|i| {
            let cache = cache.clone();
            let fetcher = counting(&calls, &format!("v{}", i), Duration::from_millis(50));
            async move { cache.get("courses", fetcher, None).await }
        });
        let results = futures::future::join_all(gets).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let first = results[0].clone();
        assert!(first.is_some());
        assert!(results.iter().all(|r| *r == first));
        assert_eq!(cache.stats().coalesced, 9);
    }

    #[tokio::test]
    async fn test_failed_fetch_without_prior_returns_none() {
        let clock = ManualClock::new();
        let cache = cache(&clock);
        let calls = Arc::new(AtomicU32::new(0));

        assert!(cache.get("courses", failing(&calls), None).await.is_none());
        assert_eq!(cache.stats().fetch_failures, 1);
        assert_eq!(cache.stats().entries, 0);
    }

    #[tokio::test]
    async fn test_failed_fetch_keeps_previous_entry() {
        let clock = ManualClock::new();
        let cache = cache(&clock);
        let calls = Arc::new(AtomicU32::new(0));

        cache.get("courses", counting(&calls, "v1", Duration::ZERO), None).await;

        // Stale: background failure leaves the entry alone
        clock.advance(Duration::from_secs(31));
        assert_eq!(cache.get("courses", failing(&calls), None).await.as_deref(), Some("v1"));
        cache.wait_idle().await;
        assert_eq!(cache.peek("courses").as_deref(), Some("v1"));

        // Expired: the triggering caller still gets the old value
        clock.advance(Duration::from_secs(300));
        assert_eq!(cache.get("courses", failing(&calls), None).await.as_deref(), Some("v1"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_invalidate_and_preload() {
        let clock = ManualClock::new();
        let cache = cache(&clock);
        let calls = Arc::new(AtomicU32::new(0));

        cache.preload("a", counting(&calls, "a1", Duration::ZERO)).await;
        cache.preload("b", counting(&calls, "b1", Duration::ZERO)).await;
        // Fresh preload is a no-op
        cache.preload("a", counting(&calls, "a2", Duration::ZERO)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        cache.invalidate("a");
        assert!(cache.peek("a").is_none());
        assert_eq!(cache.peek("b").as_deref(), Some("b1"));

        cache.invalidate_all();
        assert_eq!(cache.stats().entries, 0);

        let value = cache.get("b", counting(&calls, "b2", Duration::ZERO), None).await;
        assert_eq!(value.as_deref(), Some("b2"));
    }

    #[tokio::test]
    async fn test_invalidate_during_fetch_discards_result() {
        let clock = ManualClock::new();
        let cache = cache(&clock);
        let calls = Arc::new(AtomicU32::new(0));

        let pending = {
            let cache = cache.clone();
            let fetcher = counting(&calls, "before", Duration::from_millis(50));
            tokio::spawn(async move { cache.get("k", fetcher, None).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        cache.invalidate("k");

        // The waiting caller is still answered
        assert_eq!(pending.await.unwrap().as_deref(), Some("before"));
        assert!(cache.peek("k").is_none());

        let value = cache.get("k", counting(&calls, "after", Duration::ZERO), None).await;
        assert_eq!(value.as_deref(), Some("after"));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_get_after_invalidate_does_not_join_detached_fetch() {
        let clock = ManualClock::new();
        let cache = cache(&clock);
        let calls = Arc::new(AtomicU32::new(0));

        let pending = {
            let cache = cache.clone();
            let fetcher = counting(&calls, "before", Duration::from_millis(50));
            tokio::spawn(async move { cache.get("k", fetcher, None).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        cache.invalidate_all();

        let value = cache.get("k", counting(&calls, "after", Duration::ZERO), None).await;
        assert_eq!(value.as_deref(), Some("after"));
        assert_eq!(pending.await.unwrap().as_deref(), Some("before"));
        assert_eq!(cache.peek("k").as_deref(), Some("after"));
    }

    #[tokio::test]
    async fn test_expired_burst_shares_one_fetch() {
        let clock = ManualClock::new();
        let cache = cache(&clock);
        let calls = Arc::new(AtomicU32::new(0));

        cache.preload("k", counting(&calls, "old", Duration::ZERO)).await;
        clock.advance(Duration::from_secs(301));
        assert_eq!(cache.freshness("k"), Some(Freshness::Expired));

        let gets: Vec<_> = (0..6)
            .map(|_| {
                let cache = cache.clone();
                let fetcher = counting(&calls, "new", Duration::from_millis(40));
                tokio::spawn(async move { cache.get("k", fetcher, None).await })
            })
            .collect();
        for get in gets {
            assert_eq!(get.await.unwrap().as_deref(), Some("new"));
        }

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        let stats = cache.stats();
        assert_eq!(stats.fetches, 2);
        assert_eq!(stats.coalesced, 5);
        assert_eq!(cache.freshness("k"), Some(Freshness::Fresh));
    }

    #[tokio::test]
    async fn test_shutdown_waits_and_stops_refreshing() {
        let clock = ManualClock::new();
        let cache = cache(&clock);
        let calls = Arc::new(AtomicU32::new(0));

        cache.get("k", counting(&calls, "v1", Duration::ZERO), None).await;
        clock.advance(Duration::from_secs(31));
        cache.get("k", counting(&calls, "v2", Duration::from_millis(30)), None).await;

        cache.shutdown().await;
        assert_eq!(cache.pending_refreshes(), 0);
        assert_eq!(cache.peek("k").as_deref(), Some("v2"));

        clock.advance(Duration::from_secs(31));
        assert_eq!(
            cache.get("k", counting(&calls, "v3", Duration::ZERO), None).await.as_deref(),
            Some("v2")
        );
        assert_eq!(cache.pending_refreshes(), 0);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_independent_instances_share_nothing() {
        let clock = ManualClock::new();
        let one = cache(&clock);
        let two = cache(&clock);
        let calls = Arc::new(AtomicU32::new(0));

        one.get("k", counting(&calls, "one", Duration::ZERO), None).await;
        assert!(two.peek("k").is_none());
    }
}
