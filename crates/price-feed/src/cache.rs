//! Time-bounded in-memory cache with stampede protection
//!
//! Reads never block. Expired entries found by `get` are handed to a single
//! background evictor over an unbounded channel. `get_or_compute` serializes
//! recomputation per key through a [`KeyedLock`], so at most one factory runs
//! for a key at any time.

use dashmap::DashMap;
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use liquidity_core::CacheConfig;

use crate::keyed_lock::{KeyedLock, LockError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CacheError {
    #[error("Cache operation cancelled")]
    Cancelled,

    #[error("Cache is shut down")]
    Closed,
}

impl From<LockError> for CacheError {
    fn from(err: LockError) -> Self {
        match err {
            LockError::Cancelled => CacheError::Cancelled,
            LockError::Closed => CacheError::Closed,
        }
    }
}

/// A cached value with a fixed absolute expiry
#[derive(Debug)]
pub struct CacheEntry<V> {
    pub value: V,
    pub created_at: Instant,
    pub expires_at: Instant,
    hit_count: AtomicU64,
}

impl<V> CacheEntry<V> {
    fn new(value: V, ttl: Duration) -> Self {
        let created_at = Instant::now();
        Self {
            value,
            created_at,
            expires_at: created_at + ttl,
            hit_count: AtomicU64::new(0),
        }
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }

    pub fn hit_count(&self) -> u64 {
        self.hit_count.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    factory_runs: AtomicU64,
}

/// Point-in-time cache statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub factory_runs: u64,
}

type Entries<V> = Arc<DashMap<String, CacheEntry<V>>>;

/// Generic TTL cache keyed by string
pub struct TtlCache<V> {
    name: String,
    entries: Entries<V>,
    locks: KeyedLock,
    counters: Arc<Counters>,
    evict_tx: parking_lot::Mutex<Option<mpsc::UnboundedSender<String>>>,
    evictor: parking_lot::Mutex<Option<JoinHandle<()>>>,
    shutdown_grace: Duration,
    closed: AtomicBool,
}

impl<V> TtlCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Create the cache and start its evictor. Must be called inside a Tokio runtime.
    pub fn new(name: impl Into<String>, config: &CacheConfig) -> Self {
        let name = name.into();
        let entries: Entries<V> = Arc::new(DashMap::new());
        let counters = Arc::new(Counters::default());
        let (evict_tx, evict_rx) = mpsc::unbounded_channel();

        let evictor = tokio::spawn(run_evictor(
            name.clone(),
            Arc::clone(&entries),
            Arc::clone(&counters),
            evict_rx,
        ));

        let locks = KeyedLock::new(config.lock_cleanup_interval());
        debug!(cache = %name, sweep_every = ?locks.cleanup_interval(), "Cache started");

        Self {
            name,
            entries,
            locks,
            counters,
            evict_tx: parking_lot::Mutex::new(Some(evict_tx)),
            evictor: parking_lot::Mutex::new(Some(evictor)),
            shutdown_grace: config.shutdown_grace(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Cached value if present and unexpired; never recomputes
    pub fn get(&self, key: &str) -> Option<V> {
        let value = self.lookup(key);
        self.record(value.is_some());
        value
    }

    /// Insert or replace with expiry `now + ttl`
    pub fn set(&self, key: &str, value: V, ttl: Duration) {
        self.entries.insert(key.to_string(), CacheEntry::new(value, ttl));
    }

    /// Return the cached value or run `factory` once to produce it.
    ///
    /// Concurrent callers for the same key queue on the per-key lock and pick
    /// up the stored result. Failures are returned to the caller that ran the
    /// factory and nothing is stored.
    pub async fn get_or_compute<F, Fut, E>(
        &self,
        key: &str,
        ttl: Duration,
        cancel: &CancellationToken,
        factory: F,
    ) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
        E: From<CacheError>,
    {
        if self.is_closed() {
            return Err(CacheError::Closed.into());
        }

        if let Some(value) = self.lookup(key) {
            self.record(true);
            return Ok(value);
        }

        let _guard = self
            .locks
            .acquire(key, cancel)
            .await
            .map_err(CacheError::from)?;

        // Another caller may have filled the slot while we waited.
        if let Some(value) = self.lookup(key) {
            self.record(true);
            return Ok(value);
        }
        self.record(false);

        self.counters.factory_runs.fetch_add(1, Ordering::Relaxed);
        debug!(cache = %self.name, key, "Computing value");

        let value = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(CacheError::Cancelled.into()),
            result = factory() => result?,
        };

        self.set(key, value.clone(), ttl);
        Ok(value)
    }

    pub fn invalidate(&self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    pub fn invalidate_all(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Hit count of a live entry
    pub fn hit_count(&self, key: &str) -> Option<u64> {
        self.entries.get(key).map(|entry| entry.hit_count())
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.entries.len(),
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            factory_runs: self.counters.factory_runs.load(Ordering::Relaxed),
        }
    }

    /// Stop the evictor (bounded by the grace period), close the locks and drop all entries
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        // Dropping the only sender lets the evictor drain and exit.
        drop(self.evict_tx.lock().take());
        let evictor = self.evictor.lock().take();

        if let Some(mut handle) = evictor {
            if tokio::time::timeout(self.shutdown_grace, &mut handle).await.is_err() {
                warn!(cache = %self.name, "Evictor did not stop within {:?}, aborting", self.shutdown_grace);
                handle.abort();
            }
        }

        self.locks.close();
        self.entries.clear();
        info!(cache = %self.name, "Cache shut down");
    }

    fn lookup(&self, key: &str) -> Option<V> {
        let expired = match self.entries.get(key) {
            Some(entry) if !entry.is_expired() => {
                entry.hit_count.fetch_add(1, Ordering::Relaxed);
                return Some(entry.value.clone());
            }
            Some(_) => true,
            None => false,
        };

        if expired {
            self.schedule_eviction(key);
        }
        None
    }

    fn record(&self, hit: bool) {
        if hit {
            self.counters.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn schedule_eviction(&self, key: &str) {
        let queued = match self.evict_tx.lock().as_ref() {
            Some(tx) => tx.send(key.to_string()).is_ok(),
            None => false,
        };

        if !queued {
            evict_if_expired(&self.name, &self.entries, &self.counters, key);
        }
    }
}

fn evict_if_expired<V>(name: &str, entries: &DashMap<String, CacheEntry<V>>, counters: &Counters, key: &str) {
    // The entry may have been refreshed since it was reported.
    if entries.remove_if(key, |_, entry| entry.is_expired()).is_some() {
        counters.evictions.fetch_add(1, Ordering::Relaxed);
        debug!(cache = %name, key, "Evicted expired entry");
    }
}

async fn run_evictor<V>(
    name: String,
    entries: Entries<V>,
    counters: Arc<Counters>,
    mut rx: mpsc::UnboundedReceiver<String>,
) {
    while let Some(key) = rx.recv().await {
        evict_if_expired(&name, &entries, &counters, &key);
    }
    debug!(cache = %name, "Evictor stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn cache<V: Clone + Send + Sync + 'static>() -> TtlCache<V> {
        TtlCache::new("test", &CacheConfig::default())
    }

    #[tokio::test]
    async fn test_set_and_get() {
        let cache = cache::<u32>();
        cache.set("a", 1, Duration::from_secs(60));

        assert_eq!(cache.get("a"), Some(1));
        assert_eq!(cache.get("b"), None);
        assert_eq!(cache.hit_count("a"), Some(1));

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.entries, 1);
    }

    #[tokio::test]
    async fn test_ttl_expiry_and_lazy_eviction() {
        let cache = cache::<&'static str>();
        cache.set("k", "v", Duration::from_millis(50));
        assert_eq!(cache.get("k"), Some("v"));

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(cache.get("k"), None);

        // Give the evictor a chance to drain.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(cache.is_empty());
        assert_eq!(cache.stats().evictions, 1);
    }

    #[tokio::test]
    async fn test_expired_value_is_recomputed() {
        let cache = cache::<u32>();
        let token = CancellationToken::new();

        let first: Result<u32, CacheError> = cache
            .get_or_compute("k", Duration::from_millis(30), &token, || async { Ok(1) })
            .await;
        assert_eq!(first, Ok(1));

        let cached: Result<u32, CacheError> = cache
            .get_or_compute("k", Duration::from_millis(30), &token, || async { Ok(2) })
            .await;
        assert_eq!(cached, Ok(1));

        tokio::time::sleep(Duration::from_millis(50)).await;
        let refreshed: Result<u32, CacheError> = cache
            .get_or_compute("k", Duration::from_millis(30), &token, || async { Ok(3) })
            .await;
        assert_eq!(refreshed, Ok(3));
        assert_eq!(cache.stats().factory_runs, 2);
    }

    #[tokio::test]
    async fn test_refreshed_entry_survives_stale_eviction() {
        let cache = cache::<u32>();
        cache.set("k", 1, Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(20)).await;

        // Report the stale entry, then refresh before the evictor can run.
        assert_eq!(cache.get("k"), None);
        cache.set("k", 2, Duration::from_secs(60));

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(cache.get("k"), Some(2));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_single_factory_run_per_key() {
        let cache = Arc::new(cache::<u64>());
        let runs = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..50 {
            let cache = Arc::clone(&cache);
            let runs = Arc::clone(&runs);
            handles.push(tokio::spawn(async move {
                let token = CancellationToken::new();
                cache
                    .get_or_compute("price_BTCUSDT", Duration::from_secs(60), &token, || async move {
                        runs.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok::<_, CacheError>(42)
                    })
                    .await
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap(), Ok(42));
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(cache.stats().factory_runs, 1);
    }

    #[tokio::test]
    async fn test_failure_is_not_cached() {
        #[derive(Debug, PartialEq)]
        enum TestError {
            Cache(CacheError),
            Boom,
        }
        impl From<CacheError> for TestError {
            fn from(err: CacheError) -> Self {
                TestError::Cache(err)
            }
        }

        let cache = cache::<u32>();
        let token = CancellationToken::new();

        let failed = cache
            .get_or_compute("k", Duration::from_secs(60), &token, || async { Err(TestError::Boom) })
            .await;
        assert_eq!(failed, Err(TestError::Boom));
        assert!(cache.is_empty());

        let ok = cache
            .get_or_compute("k", Duration::from_secs(60), &token, || async { Ok::<_, TestError>(7) })
            .await;
        assert_eq!(ok, Ok(7));
    }

    #[tokio::test]
    async fn test_cancelled_compute() {
        let cache = cache::<u32>();
        let token = CancellationToken::new();
        let trigger = token.clone();

        let result: Result<u32, CacheError> = cache
            .get_or_compute("k", Duration::from_secs(60), &token, || async move {
                trigger.cancel();
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(1)
            })
            .await;

        assert_eq!(result, Err(CacheError::Cancelled));
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_waiter_leaves_running_factory_alone() {
        let cache = Arc::new(cache::<u64>());
        let runs = Arc::new(AtomicUsize::new(0));

        let owner = {
            let cache = Arc::clone(&cache);
            let runs = Arc::clone(&runs);
            tokio::spawn(async move {
                let token = CancellationToken::new();
                cache
                    .get_or_compute("price_ETHUSDT", Duration::from_secs(60), &token, || async move {
                        runs.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        Ok::<_, CacheError>(42)
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let waiter_token = CancellationToken::new();
        let waiter = {
            let cache = Arc::clone(&cache);
            let runs = Arc::clone(&runs);
            let token = waiter_token.clone();
            tokio::spawn(async move {
                cache
                    .get_or_compute("price_ETHUSDT", Duration::from_secs(60), &token, || async move {
                        runs.fetch_add(1, Ordering::SeqCst);
                        Ok::<_, CacheError>(99)
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        waiter_token.cancel();

        assert_eq!(waiter.await.unwrap(), Err(CacheError::Cancelled));
        assert_eq!(owner.await.unwrap(), Ok(42));
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(cache.stats().factory_runs, 1);
        assert_eq!(cache.get("price_ETHUSDT"), Some(42));
    }

    #[tokio::test]
    async fn test_invalidate() {
        let cache = cache::<u32>();
        cache.set("a", 1, Duration::from_secs(60));
        cache.set("b", 2, Duration::from_secs(60));

        assert!(cache.invalidate("a"));
        assert!(!cache.invalidate("a"));
        assert_eq!(cache.len(), 1);

        cache.invalidate_all();
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_shutdown() {
        let cache = cache::<u32>();
        cache.set("a", 1, Duration::from_secs(60));
        cache.shutdown().await;

        assert!(cache.is_closed());
        assert!(cache.is_empty());

        let token = CancellationToken::new();
        let result: Result<u32, CacheError> = cache
            .get_or_compute("a", Duration::from_secs(60), &token, || async { Ok(1) })
            .await;
        assert_eq!(result, Err(CacheError::Closed));

        // Expired reads after shutdown evict inline.
        cache.set("b", 1, Duration::ZERO);
        assert_eq!(cache.get("b"), None);
        assert!(cache.is_empty());
    }
}
