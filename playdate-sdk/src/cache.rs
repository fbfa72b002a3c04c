//! Time-boxed read-through cache for per-id lookups (user and kid profiles).
//!
//! Entries are never evicted proactively; a stale entry is simply ignored and
//! superseded by the next fetch. Two concurrent misses for the same key both
//! fetch and the last writer wins, which is fine for idempotent snapshots.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

/// Default lifetime of a cached profile.
pub const DEFAULT_TTL: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    timestamp: Instant,
}

#[derive(Debug)]
pub struct TtlCache<K, V> {
    ttl: Duration,
    entries: Mutex<HashMap<K, CacheEntry<V>>>,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Fresh value for `key`, if any.
    pub fn get(&self, key: &K) -> Option<V> {
        let entries = self.entries.lock();
        let entry = entries.get(key)?;
        if entry.timestamp.elapsed() < self.ttl {
            Some(entry.value.clone())
        } else {
            None
        }
    }

    pub fn insert(&self, key: K, value: V) {
        self.entries.lock().insert(
            key,
            CacheEntry {
                value,
                timestamp: Instant::now(),
            },
        );
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    /// Number of stored entries, stale ones included.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Return the cached value unless it is stale or `force` is set;
    /// otherwise run `fetch`, store its result stamped with now, and return it.
    /// Failed fetches leave the cache untouched.
    pub async fn get_or_fetch<F, Fut, E>(&self, key: K, force: bool, fetch: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        if !force {
            if let Some(value) = self.get(&key) {
                return Ok(value);
            }
        }
        let value = fetch().await?;
        self.insert(key, value.clone());
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn entry_expires_after_ttl() {
        let cache = TtlCache::new(Duration::from_secs(10));
        cache.insert(1, "a");
        assert_eq!(cache.get(&1), Some("a"));
        tokio::time::advance(Duration::from_secs(9)).await;
        assert_eq!(cache.get(&1), Some("a"));
        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(cache.get(&1), None);
        assert_eq!(cache.len(), 1, "stale entries are not evicted");
    }

    #[tokio::test(start_paused = true)]
    async fn read_through_fetches_on_miss_stale_and_force() {
        let cache: TtlCache<i64, String> = TtlCache::new(DEFAULT_TTL);
        let calls = AtomicUsize::new(0);
        let counter = &calls;
        let fetch = move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<_, ()>("profile".to_string())
        };

        cache.get_or_fetch(7, false, fetch).await.unwrap();
        cache.get_or_fetch(7, false, fetch).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        cache.get_or_fetch(7, true, fetch).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        tokio::time::advance(DEFAULT_TTL).await;
        cache.get_or_fetch(7, false, fetch).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn failed_fetch_is_not_cached() {
        let cache: TtlCache<i64, String> = TtlCache::new(DEFAULT_TTL);
        let err = cache
            .get_or_fetch(1, false, || async { Err::<String, _>("offline") })
            .await;
        assert_eq!(err, Err("offline"));
        assert!(cache.is_empty());
    }
}
