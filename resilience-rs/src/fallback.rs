//! # Fallback Cache
//!
//! Bounded, TTL-aware cache that backs the degradation tiers: fresh entries
//! are served while a backend is degraded, expired ones are kept around as
//! a last resort.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::debug;

/// How a served value was obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultSource {
    /// The primary operation answered
    Primary,
    /// A cache entry within its TTL
    Cache,
    /// The caller-supplied fallback answered
    Fallback,
    /// A cache entry past its TTL
    StaleCache,
    /// A minimal synthetic value
    Synthetic,
}

impl ResultSource {
    /// True for every source other than the primary call or a fresh entry
    pub fn is_degraded(self) -> bool {
        !matches!(self, ResultSource::Primary | ResultSource::Cache)
    }
}

impl std::fmt::Display for ResultSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ResultSource::Primary => "primary",
            ResultSource::Cache => "cache",
            ResultSource::Fallback => "fallback",
            ResultSource::StaleCache => "stale_cache",
            ResultSource::Synthetic => "synthetic",
        };
        f.write_str(name)
    }
}

/// A value together with the tier that produced it
#[derive(Debug, Clone, PartialEq)]
pub struct FallbackResult<T> {
    pub value: T,
    pub source: ResultSource,
}

impl<T> FallbackResult<T> {
    pub fn new(value: T, source: ResultSource) -> Self {
        Self { value, source }
    }

    /// Returns true if the result did not come from the primary operation
    pub fn is_fallback(&self) -> bool {
        self.source != ResultSource::Primary
    }

    pub fn into_value(self) -> T {
        self.value
    }
}

#[derive(Debug, Clone)]
struct CacheEntry<T> {
    data: T,
    inserted_at: Instant,
    ttl: Duration,
}

impl<T> CacheEntry<T> {
    fn is_expired(&self) -> bool {
        self.inserted_at.elapsed() > self.ttl
    }
}

/// Bounded cache for fallback values.
///
/// Once `max_entries` is exceeded the oldest tenth of the entries (at least
/// one) is evicted.
#[derive(Debug)]
pub struct FallbackCache<K, V> {
    name: String,
    entries: Mutex<HashMap<K, CacheEntry<V>>>,
    max_entries: usize,
    default_ttl: Duration,
    hit_count: AtomicU64,
    miss_count: AtomicU64,
}

impl<K, V> FallbackCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(name: impl Into<String>, max_entries: usize, default_ttl: Duration) -> Self {
        Self {
            name: name.into(),
            entries: Mutex::new(HashMap::new()),
            max_entries: max_entries.max(1),
            default_ttl,
            hit_count: AtomicU64::new(0),
            miss_count: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<K, CacheEntry<V>>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Gets a value that is still within its TTL
    pub fn get_fresh(&self, key: &K) -> Option<V> {
        let found = self
            .lock()
            .get(key)
            .filter(|entry| !entry.is_expired())
            .map(|entry| entry.data.clone());
        self.count(found.is_some());
        found
    }

    /// Gets a value regardless of its age
    pub fn get_stale(&self, key: &K) -> Option<V> {
        let found = self.lock().get(key).map(|entry| entry.data.clone());
        self.count(found.is_some());
        found
    }

    fn count(&self, hit: bool) {
        if hit {
            self.hit_count.fetch_add(1, Ordering::Relaxed);
        } else {
            self.miss_count.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Stores a value, using the default TTL when none is given
    pub fn put(&self, key: K, value: V, ttl: Option<Duration>) {
        let mut entries = self.lock();
        entries.insert(
            key,
            CacheEntry {
                data: value,
                inserted_at: Instant::now(),
                ttl: ttl.unwrap_or(self.default_ttl),
            },
        );

        if entries.len() > self.max_entries {
            let evict = (entries.len() / 10).max(1);
            let mut by_age: Vec<(K, Instant)> = entries
                .iter()
                .map(|(k, entry)| (k.clone(), entry.inserted_at))
                .collect();
            by_age.sort_by_key(|(_, inserted_at)| *inserted_at);
            for (key, _) in by_age.into_iter().take(evict) {
                entries.remove(&key);
            }
            debug!(cache = %self.name, evicted = evict, remaining = entries.len(), "Evicted oldest cache entries");
        }
    }

    /// Removes a key, returns whether it was present
    pub fn invalidate(&self, key: &K) -> bool {
        self.lock().remove(key).is_some()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn hit_count(&self) -> u64 {
        self.hit_count.load(Ordering::Relaxed)
    }

    pub fn miss_count(&self) -> u64 {
        self.miss_count.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_and_stale_lookups() {
        let cache: FallbackCache<String, u32> =
            FallbackCache::new("test", 10, Duration::from_secs(60));

        cache.put("a".to_string(), 1, None);
        cache.put("b".to_string(), 2, Some(Duration::ZERO));
        std::thread::sleep(Duration::from_millis(5));

        assert_eq!(cache.get_fresh(&"a".to_string()), Some(1));
        assert_eq!(cache.get_fresh(&"b".to_string()), None);
        assert_eq!(cache.get_stale(&"b".to_string()), Some(2));
        assert_eq!(cache.get_stale(&"c".to_string()), None);

        assert_eq!(cache.hit_count(), 2);
        assert_eq!(cache.miss_count(), 2);
    }

    #[test]
    fn test_evicts_oldest_tenth() {
        let cache: FallbackCache<u32, u32> = FallbackCache::new("test", 20, Duration::from_secs(60));

        for i in 0..21 {
            cache.put(i, i, None);
            std::thread::sleep(Duration::from_millis(1));
        }

        // 21 entries crossed the ceiling of 20, so 2 of the oldest go
        assert_eq!(cache.len(), 19);
        assert_eq!(cache.get_stale(&0), None);
        assert_eq!(cache.get_stale(&1), None);
        assert_eq!(cache.get_stale(&2), Some(2));
        assert_eq!(cache.get_stale(&20), Some(20));
    }

    #[test]
    fn test_invalidate_and_clear() {
        let cache: FallbackCache<u32, &str> = FallbackCache::new("test", 5, Duration::from_secs(1));
        cache.put(1, "one", None);
        cache.put(2, "two", None);

        assert!(cache.invalidate(&1));
        assert!(!cache.invalidate(&1));
        assert_eq!(cache.len(), 1);

        cache.clear();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_result_source_degraded() {
        assert!(!ResultSource::Primary.is_degraded());
        assert!(!ResultSource::Cache.is_degraded());
        assert!(ResultSource::StaleCache.is_degraded());
        assert!(FallbackResult::new(1, ResultSource::Cache).is_fallback());
    }
}
