//! Federated client cache
//!
//! TTL- and capacity-bounded map from (cluster, identity) to a client handle.
//! Concurrent misses for one key collapse into a single construction: the
//! first caller builds while the rest wait on a per-key lock and then read
//! the inserted entry. The map lock is a plain mutex and is never held
//! across an await.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::metrics::{CacheMetrics, EvictionReason};

/// Cache key: target cluster plus effective identity
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    /// Cluster name; empty for the management cluster
    pub cluster: String,
    /// Opaque identity fingerprint
    pub identity: String,
}

impl CacheKey {
    /// Build a key
    pub fn new(cluster: impl Into<String>, identity: impl Into<String>) -> Self {
        Self {
            cluster: cluster.into(),
            identity: identity.into(),
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}", self.cluster, self.identity)
    }
}

struct Entry<T> {
    value: T,
    created_at: Instant,
    last_accessed: Instant,
}

type BuildLocks = Mutex<HashMap<CacheKey, Arc<tokio::sync::Mutex<()>>>>;

/// Membership in a key's build lock. The last member to leave removes the
/// lock from the map, on every exit path including cancellation.
struct BuildGate<'a> {
    building: &'a BuildLocks,
    key: &'a CacheKey,
    lock: Arc<tokio::sync::Mutex<()>>,
}

impl<'a> BuildGate<'a> {
    fn join(building: &'a BuildLocks, key: &'a CacheKey) -> Self {
        let lock = Arc::clone(building.lock().entry(key.clone()).or_default());
        Self { building, key, lock }
    }
}

impl Drop for BuildGate<'_> {
    fn drop(&mut self) {
        let mut building = self.building.lock();
        // map + this member; new members clone under the same map lock
        let last = building.get(self.key).is_some_and(|g| Arc::ptr_eq(g, &self.lock))
            && Arc::strong_count(&self.lock) <= 2;
        if last {
            building.remove(self.key);
        }
    }
}

/// Point-in-time cache statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct CacheStats {
    /// Live entries
    pub size: usize,
    /// Capacity
    pub max_entries: usize,
    /// Entry lifetime in seconds
    pub ttl_seconds: u64,
}

/// TTL + LRU cache with single-flight construction
pub struct ClientCache<T> {
    ttl: Duration,
    max_entries: usize,
    entries: Mutex<HashMap<CacheKey, Entry<T>>>,
    building: BuildLocks,
    metrics: Arc<dyn CacheMetrics>,
}

impl<T: Clone + Send + Sync + 'static> ClientCache<T> {
    /// Create a cache holding at most `max_entries` for `ttl` each
    pub fn new(ttl: Duration, max_entries: usize, metrics: Arc<dyn CacheMetrics>) -> Self {
        Self {
            ttl,
            max_entries: max_entries.max(1),
            entries: Mutex::new(HashMap::new()),
            building: Mutex::new(HashMap::new()),
            metrics,
        }
    }

    /// Cached value for `key` if present and within TTL
    pub fn get(&self, key: &CacheKey) -> Option<T> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let expired = match entries.get_mut(key) {
            Some(entry) if now.duration_since(entry.created_at) <= self.ttl => {
                entry.last_accessed = now;
                return Some(entry.value.clone());
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            entries.remove(key);
            self.metrics.record_eviction(EvictionReason::Expired);
            self.metrics.set_size(entries.len());
        }
        None
    }

    /// Return the cached value or build it with `factory`.
    ///
    /// At most one `factory` runs per key at a time. Waiters that find the
    /// entry populated after the builder finishes count as hits. A failed
    /// build is not cached; the next waiter attempts its own.
    pub async fn get_or_create<F, Fut, E>(&self, key: &CacheKey, factory: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if let Some(value) = self.get(key) {
            self.metrics.record_hit(&key.cluster);
            return Ok(value);
        }

        let gate = BuildGate::join(&self.building, key);
        let _lock = gate.lock.lock().await;

        if let Some(value) = self.get(key) {
            self.metrics.record_hit(&key.cluster);
            return Ok(value);
        }

        self.metrics.record_miss(&key.cluster);
        let result = factory().await;
        if let Ok(value) = &result {
            self.insert(key.clone(), value.clone());
        }
        result
    }

    /// Keys with a build lock currently registered
    #[cfg(test)]
    fn pending_builds(&self) -> usize {
        self.building.lock().len()
    }

    /// Insert, evicting the least recently used entry when full
    pub fn insert(&self, key: CacheKey, value: T) {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        if !entries.contains_key(&key) && entries.len() >= self.max_entries {
            let oldest = entries
                .iter()
                .min_by_key(|(_, e)| e.last_accessed)
                .map(|(k, _)| k.clone());
            if let Some(oldest) = oldest {
                entries.remove(&oldest);
                self.metrics.record_eviction(EvictionReason::Lru);
                debug!(cluster = %oldest.cluster, "Evicted least recently used client");
            }
        }
        entries.insert(
            key,
            Entry {
                value,
                created_at: now,
                last_accessed: now,
            },
        );
        self.metrics.set_size(entries.len());
    }

    /// Remove one entry
    pub fn delete(&self, key: &CacheKey) -> bool {
        let mut entries = self.entries.lock();
        let removed = entries.remove(key).is_some();
        if removed {
            self.metrics.record_eviction(EvictionReason::Manual);
            self.metrics.set_size(entries.len());
        }
        removed
    }

    /// Remove every entry for `cluster`; returns how many were removed
    pub fn delete_by_cluster(&self, cluster: &str) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|k, _| k.cluster != cluster);
        let removed = before - entries.len();
        for _ in 0..removed {
            self.metrics.record_eviction(EvictionReason::Manual);
        }
        self.metrics.set_size(entries.len());
        removed
    }

    /// Drop entries older than the TTL; returns how many were dropped
    pub fn cleanup(&self) -> usize {
        let now = Instant::now();
        let ttl = self.ttl;
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, e| now.duration_since(e.created_at) <= ttl);
        let removed = before - entries.len();
        for _ in 0..removed {
            self.metrics.record_eviction(EvictionReason::Expired);
        }
        self.metrics.set_size(entries.len());
        if removed > 0 {
            debug!(expired_count = removed, remaining = entries.len(), "Swept expired cluster clients");
        }
        removed
    }

    /// Drop everything
    pub fn clear(&self) {
        let mut entries = self.entries.lock();
        for _ in 0..entries.len() {
            self.metrics.record_eviction(EvictionReason::Manual);
        }
        entries.clear();
        self.metrics.set_size(0);
    }

    /// Live entry count
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether the cache is empty
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Current statistics
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            size: self.len(),
            max_entries: self.max_entries,
            ttl_seconds: self.ttl.as_secs(),
        }
    }

    /// Run [`cleanup`](Self::cleanup) every `interval` until `shutdown` fires
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => {
                        debug!("Client cache sweeper stopped");
                        return;
                    }
                    _ = ticker.tick() => {
                        cache.cleanup();
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::metrics::NoopMetrics;

    #[derive(Default)]
    struct CountingMetrics {
        hits: AtomicUsize,
        misses: AtomicUsize,
        lru: AtomicUsize,
        expired: AtomicUsize,
    }

    impl CacheMetrics for CountingMetrics {
        fn record_hit(&self, _cluster: &str) {
            self.hits.fetch_add(1, Ordering::SeqCst);
        }
        fn record_miss(&self, _cluster: &str) {
            self.misses.fetch_add(1, Ordering::SeqCst);
        }
        fn record_eviction(&self, reason: EvictionReason) {
            match reason {
                EvictionReason::Lru => self.lru.fetch_add(1, Ordering::SeqCst),
                EvictionReason::Expired => self.expired.fetch_add(1, Ordering::SeqCst),
                EvictionReason::Manual => 0,
            };
        }
        fn set_size(&self, _size: usize) {}
    }

    fn cache(ttl: Duration, max: usize) -> ClientCache<Arc<String>> {
        ClientCache::new(ttl, max, Arc::new(NoopMetrics))
    }

    #[tokio::test]
    async fn concurrent_misses_build_once() {
        // GIVEN: a cold cache and a slow factory
        let metrics = Arc::new(CountingMetrics::default());
        let cache: Arc<ClientCache<Arc<String>>> =
            Arc::new(ClientCache::new(Duration::from_secs(60), 10, metrics.clone()));
        let builds = Arc::new(AtomicUsize::new(0));
        let key = CacheKey::new("prod-wc-01", "user:abc");

        // WHEN: two requests for the same key race
        let run = |cache: Arc<ClientCache<Arc<String>>>, builds: Arc<AtomicUsize>, key: CacheKey| async move {
            cache
                .get_or_create(&key, || async {
                    builds.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok::<_, std::convert::Infallible>(Arc::new("client".to_string()))
                })
                .await
                .unwrap()
        };
        let (a, b) = tokio::join!(
            tokio::spawn(run(cache.clone(), builds.clone(), key.clone())),
            tokio::spawn(run(cache.clone(), builds.clone(), key.clone())),
        );

        // THEN: one construction, same handle
        assert_eq!(builds.load(Ordering::SeqCst), 1);
        assert!(Arc::ptr_eq(&a.unwrap(), &b.unwrap()));
        assert_eq!(metrics.misses.load(Ordering::SeqCst), 1);
        assert_eq!(metrics.hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn build_locks_are_released_after_contended_misses() {
        // GIVEN: two racing requests on each of 50 keys, capacity 10
        let cache = Arc::new(cache(Duration::from_secs(60), 10));

        // WHEN
        let handles: Vec<_> = (0..50)
            .flat_map(|i| {
                let key = CacheKey::new(format!("wc-{i}"), "user:abc");
                [key.clone(), key]
            })
            .map(|key| {
                let cache = Arc::clone(&cache);
                tokio::spawn(async move {
                    cache
                        .get_or_create(&key, || async {
                            tokio::time::sleep(Duration::from_millis(5)).await;
                            Ok::<_, std::convert::Infallible>(Arc::new(key.to_string()))
                        })
                        .await
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        // THEN: entries stay bounded and no build lock is left behind
        assert_eq!(cache.len(), 10);
        assert_eq!(cache.pending_builds(), 0);
    }

    #[tokio::test]
    async fn cancelled_build_releases_its_lock() {
        // GIVEN: a build that never finishes
        let cache = Arc::new(cache(Duration::from_secs(60), 10));
        let key = CacheKey::new("wc", "u");
        let stuck = {
            let cache = Arc::clone(&cache);
            let key = key.clone();
            tokio::spawn(async move {
                cache
                    .get_or_create(&key, || std::future::pending::<Result<Arc<String>, ()>>())
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(cache.pending_builds(), 1);

        // WHEN: the request is dropped
        stuck.abort();
        let _ = stuck.await;

        // THEN: the lock is gone and a new build proceeds
        assert_eq!(cache.pending_builds(), 0);
        let value = cache
            .get_or_create(&key, || async { Ok::<_, ()>(Arc::new("x".to_string())) })
            .await
            .unwrap();
        assert_eq!(value.as_str(), "x");
    }

    #[tokio::test]
    async fn failed_build_is_not_cached() {
        let cache = cache(Duration::from_secs(60), 10);
        let key = CacheKey::new("c", "u");
        let err = cache
            .get_or_create(&key, || async { Err::<Arc<String>, _>("boom") })
            .await;
        assert_eq!(err.unwrap_err(), "boom");
        assert!(cache.is_empty());

        let ok = cache
            .get_or_create(&key, || async { Ok::<_, &str>(Arc::new("x".to_string())) })
            .await
            .unwrap();
        assert_eq!(ok.as_str(), "x");
    }

    #[tokio::test]
    async fn expired_entries_are_swept() {
        // GIVEN: a short TTL
        let metrics = Arc::new(CountingMetrics::default());
        let cache: ClientCache<Arc<String>> = ClientCache::new(Duration::from_millis(20), 10, metrics.clone());
        cache.insert(CacheKey::new("a", "u"), Arc::new("a".to_string()));

        // WHEN: the TTL elapses and a sweep runs
        tokio::time::sleep(Duration::from_millis(40)).await;
        let removed = cache.cleanup();

        // THEN
        assert_eq!(removed, 1);
        assert!(cache.get(&CacheKey::new("a", "u")).is_none());
        assert_eq!(metrics.expired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn expired_entry_is_not_served() {
        let cache = cache(Duration::from_millis(10), 10);
        let key = CacheKey::new("a", "u");
        cache.insert(key.clone(), Arc::new("a".to_string()));
        tokio::time::sleep(Duration::from_millis(25)).await;
        assert!(cache.get(&key).is_none());
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn evicts_least_recently_used() {
        // GIVEN: capacity 2 with "a" touched after "b"
        let metrics = Arc::new(CountingMetrics::default());
        let cache: ClientCache<Arc<String>> = ClientCache::new(Duration::from_secs(60), 2, metrics.clone());
        cache.insert(CacheKey::new("a", "u"), Arc::new("a".to_string()));
        tokio::time::sleep(Duration::from_millis(2)).await;
        cache.insert(CacheKey::new("b", "u"), Arc::new("b".to_string()));
        tokio::time::sleep(Duration::from_millis(2)).await;
        assert!(cache.get(&CacheKey::new("a", "u")).is_some());

        // WHEN: a third entry arrives
        cache.insert(CacheKey::new("c", "u"), Arc::new("c".to_string()));

        // THEN: "b" is gone
        assert_eq!(cache.len(), 2);
        assert!(cache.get(&CacheKey::new("b", "u")).is_none());
        assert!(cache.get(&CacheKey::new("a", "u")).is_some());
        assert_eq!(metrics.lru.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn delete_by_cluster_spares_others() {
        let cache = cache(Duration::from_secs(60), 10);
        cache.insert(CacheKey::new("a", "u1"), Arc::new("1".to_string()));
        cache.insert(CacheKey::new("a", "u2"), Arc::new("2".to_string()));
        cache.insert(CacheKey::new("b", "u1"), Arc::new("3".to_string()));

        assert_eq!(cache.delete_by_cluster("a"), 2);
        assert_eq!(cache.len(), 1);
        assert!(cache.delete(&CacheKey::new("b", "u1")));
        assert!(!cache.delete(&CacheKey::new("b", "u1")));
    }

    #[tokio::test]
    async fn sweeper_stops_on_cancel() {
        let cache = Arc::new(cache(Duration::from_millis(5), 10));
        cache.insert(CacheKey::new("a", "u"), Arc::new("a".to_string()));
        let shutdown = CancellationToken::new();
        let handle = cache.spawn_sweeper(Duration::from_millis(10), shutdown.clone());

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(cache.is_empty());

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
    }

    #[test]
    fn key_display() {
        assert_eq!(CacheKey::new("prod", "user:1").to_string(), "prod|user:1");
    }
}
