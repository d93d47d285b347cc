//! Async mutex keyed by string
//!
//! Disjoint keys never contend; callers on the same key are serialized.
//! Entries are reference counted so the background sweeper only reclaims
//! keys nobody holds or waits on.

use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Floor for the sweep period; `tokio::time::interval` rejects zero.
pub const MIN_CLEANUP_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum LockError {
    #[error("Lock acquisition cancelled")]
    Cancelled,

    #[error("Keyed lock is closed")]
    Closed,
}

/// Per-key mutex plus bookkeeping for the sweeper
#[derive(Debug)]
struct LockEntry {
    mutex: Arc<Mutex<()>>,
    ref_count: AtomicUsize,
    last_access: parking_lot::Mutex<Instant>,
}

impl LockEntry {
    fn new() -> Self {
        Self {
            mutex: Arc::new(Mutex::new(())),
            ref_count: AtomicUsize::new(0),
            last_access: parking_lot::Mutex::new(Instant::now()),
        }
    }

    fn touch(&self) {
        *self.last_access.lock() = Instant::now();
    }

    fn is_idle(&self, threshold: Duration) -> bool {
        self.ref_count.load(Ordering::Acquire) == 0 && self.last_access.lock().elapsed() >= threshold
    }
}

/// Counts one holder or waiter; released on drop, including when the
/// pending acquire future is dropped.
#[derive(Debug)]
struct Holder {
    entry: Arc<LockEntry>,
}

impl Drop for Holder {
    fn drop(&mut self) {
        self.entry.touch();
        self.entry.ref_count.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Exclusive access to one key until dropped
#[derive(Debug)]
pub struct KeyedLockGuard {
    // Field order matters: the mutex is released before the holder count drops.
    _guard: OwnedMutexGuard<()>,
    _holder: Holder,
}

#[derive(Debug)]
struct Inner {
    entries: DashMap<String, Arc<LockEntry>>,
    shutdown: CancellationToken,
    closed: AtomicBool,
}

impl Inner {
    fn sweep(&self, threshold: Duration) -> usize {
        let mut removed = 0;
        // retain holds the shard write lock, so no acquirer can pick up an
        // entry between the idle check and its removal.
        self.entries.retain(|_, entry| {
            if entry.is_idle(threshold) {
                removed += 1;
                false
            } else {
                true
            }
        });
        removed
    }
}

/// String-keyed async mutex with idle-entry reaping
#[derive(Debug)]
pub struct KeyedLock {
    inner: Arc<Inner>,
    cleanup_interval: Duration,
}

impl KeyedLock {
    /// Create the lock and start its sweeper. Must be called inside a Tokio runtime.
    pub fn new(cleanup_interval: Duration) -> Self {
        let cleanup_interval = if cleanup_interval < MIN_CLEANUP_INTERVAL {
            warn!(
                requested = ?cleanup_interval,
                "Lock cleanup interval too small, using {:?}", MIN_CLEANUP_INTERVAL
            );
            MIN_CLEANUP_INTERVAL
        } else {
            cleanup_interval
        };

        let inner = Arc::new(Inner {
            entries: DashMap::new(),
            shutdown: CancellationToken::new(),
            closed: AtomicBool::new(false),
        });

        tokio::spawn(run_sweeper(Arc::downgrade(&inner), cleanup_interval));

        Self {
            inner,
            cleanup_interval,
        }
    }

    /// Wait for exclusive access to `key`
    pub async fn acquire(
        &self,
        key: &str,
        cancel: &CancellationToken,
    ) -> Result<KeyedLockGuard, LockError> {
        if self.is_closed() {
            return Err(LockError::Closed);
        }

        // Register as a holder while the shard lock is held so the sweeper
        // cannot remove the entry underneath us.
        let entry = {
            let slot = self
                .inner
                .entries
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(LockEntry::new()));
            slot.ref_count.fetch_add(1, Ordering::AcqRel);
            slot.touch();
            Arc::clone(slot.value())
        };
        let holder = Holder {
            entry: Arc::clone(&entry),
        };

        let guard = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(LockError::Cancelled),
            _ = self.inner.shutdown.cancelled() => return Err(LockError::Closed),
            guard = Arc::clone(&entry.mutex).lock_owned() => guard,
        };

        Ok(KeyedLockGuard {
            _guard: guard,
            _holder: holder,
        })
    }

    /// Remove entries with no holders that have been idle for at least `threshold`
    pub fn sweep_idle(&self, threshold: Duration) -> usize {
        self.inner.sweep(threshold)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.inner.entries.contains_key(key)
    }

    /// Current holders and waiters on `key`
    #[cfg(test)]
    pub(crate) fn holders(&self, key: &str) -> Option<usize> {
        self.inner
            .entries
            .get(key)
            .map(|entry| entry.ref_count.load(Ordering::Acquire))
    }

    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }

    pub(crate) fn cleanup_interval(&self) -> Duration {
        self.cleanup_interval
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Stop the sweeper, fail pending waiters and drop all entries
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.shutdown.cancel();
        self.inner.entries.clear();
        debug!("Keyed lock closed");
    }
}

impl Drop for KeyedLock {
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
    }
}

async fn run_sweeper(inner: Weak<Inner>, every: Duration) {
    let shutdown = match inner.upgrade() {
        Some(inner) => inner.shutdown.clone(),
        None => return,
    };

    let mut ticker = tokio::time::interval(every);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let Some(inner) = inner.upgrade() else { break };
                let removed = inner.sweep(every);
                if removed > 0 {
                    info!("Reaped {} idle lock entries, {} remaining", removed, inner.entries.len());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_pending, assert_ready_err, assert_ready_ok};

    #[tokio::test]
    async fn test_same_key_is_exclusive() {
        let lock = KeyedLock::new(Duration::from_secs(300));
        let token = CancellationToken::new();

        let first = lock.acquire("BTC", &token).await.unwrap();
        let mut second = tokio_test::task::spawn(lock.acquire("BTC", &token));
        assert_pending!(second.poll());
        assert_eq!(lock.holders("BTC"), Some(2));

        drop(first);
        assert!(second.is_woken());
        let _second = assert_ready_ok!(second.poll());
    }

    #[tokio::test]
    async fn test_disjoint_keys_do_not_contend() {
        let lock = KeyedLock::new(Duration::from_secs(300));
        let token = CancellationToken::new();

        let _a = lock.acquire("BTC", &token).await.unwrap();
        let mut b = tokio_test::task::spawn(lock.acquire("ETH", &token));
        assert_ready_ok!(b.poll());
        assert_eq!(lock.len(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_mutual_exclusion_under_load() {
        let lock = Arc::new(KeyedLock::new(Duration::from_secs(300)));
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..32 {
            let lock = Arc::clone(&lock);
            let inside = Arc::clone(&inside);
            let max_inside = Arc::clone(&max_inside);
            handles.push(tokio::spawn(async move {
                let token = CancellationToken::new();
                let _guard = lock.acquire("shared", &token).await.unwrap();
                let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                max_inside.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(1)).await;
                inside.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
        assert_eq!(lock.holders("shared"), Some(0));
    }

    #[tokio::test]
    async fn test_cancelled_waiter_releases_reference() {
        let lock = KeyedLock::new(Duration::from_secs(300));
        let token = CancellationToken::new();
        let _held = lock.acquire("BTC", &token).await.unwrap();

        let waiter_token = CancellationToken::new();
        let mut waiter = tokio_test::task::spawn(lock.acquire("BTC", &waiter_token));
        assert_pending!(waiter.poll());
        assert_eq!(lock.holders("BTC"), Some(2));

        waiter_token.cancel();
        assert!(waiter.is_woken());
        let err = assert_ready_err!(waiter.poll());
        assert_eq!(err, LockError::Cancelled);
        assert_eq!(lock.holders("BTC"), Some(1));
    }

    #[tokio::test]
    async fn test_dropped_waiter_releases_reference() {
        let lock = KeyedLock::new(Duration::from_secs(300));
        let token = CancellationToken::new();
        let _held = lock.acquire("BTC", &token).await.unwrap();

        let mut waiter = tokio_test::task::spawn(lock.acquire("BTC", &token));
        assert_pending!(waiter.poll());
        drop(waiter);
        assert_eq!(lock.holders("BTC"), Some(1));
    }

    #[tokio::test]
    async fn test_idle_entries_are_reaped_and_recreated() {
        let lock = KeyedLock::new(Duration::from_secs(300));
        let token = CancellationToken::new();

        {
            let _guard = lock.acquire("SOLUSDT", &token).await.unwrap();
            // Held entries survive a sweep.
            assert_eq!(lock.sweep_idle(Duration::ZERO), 0);
        }
        assert_eq!(lock.holders("SOLUSDT"), Some(0));

        // Not yet idle long enough.
        assert_eq!(lock.sweep_idle(Duration::from_secs(60)), 0);
        assert!(lock.contains_key("SOLUSDT"));

        assert_eq!(lock.sweep_idle(Duration::ZERO), 1);
        assert!(!lock.contains_key("SOLUSDT"));

        let _again = lock.acquire("SOLUSDT", &token).await.unwrap();
        assert_eq!(lock.holders("SOLUSDT"), Some(1));
    }

    #[tokio::test]
    async fn test_background_sweeper_reaps() {
        let lock = KeyedLock::new(Duration::from_millis(20));
        let token = CancellationToken::new();
        drop(lock.acquire("ETHUSDT", &token).await.unwrap());
        assert!(lock.contains_key("ETHUSDT"));

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(!lock.contains_key("ETHUSDT"));
    }

    #[tokio::test]
    async fn test_zero_interval_is_clamped_and_still_reaps() {
        let lock = KeyedLock::new(Duration::ZERO);
        assert_eq!(lock.cleanup_interval(), MIN_CLEANUP_INTERVAL);

        let token = CancellationToken::new();
        drop(lock.acquire("BTC", &token).await.unwrap());
        assert!(lock.contains_key("BTC"));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!lock.contains_key("BTC"));
    }

    #[tokio::test]
    async fn test_acquire_after_close_fails() {
        let lock = KeyedLock::new(Duration::from_secs(300));
        let token = CancellationToken::new();
        drop(lock.acquire("BTC", &token).await.unwrap());

        lock.close();
        assert!(lock.is_closed());
        assert!(lock.is_empty());
        assert_eq!(lock.acquire("BTC", &token).await.err(), Some(LockError::Closed));
    }

    #[tokio::test]
    async fn test_close_wakes_waiters() {
        let lock = KeyedLock::new(Duration::from_secs(300));
        let token = CancellationToken::new();
        let _held = lock.acquire("BTC", &token).await.unwrap();

        let mut waiter = tokio_test::task::spawn(lock.acquire("BTC", &token));
        assert_pending!(waiter.poll());

        lock.close();
        assert!(waiter.is_woken());
        let err = assert_ready_err!(waiter.poll());
        assert_eq!(err, LockError::Closed);
    }
}
