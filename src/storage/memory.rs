// In-process LRU cache with lazy TTL expiry
use std::num::NonZeroUsize;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use lru::LruCache;

use super::CacheEntry;

/// Bounded LRU map whose entries also expire after `ttl`.
///
/// Expired entries are never returned; they are dropped when next touched
/// rather than by a background purge.
pub struct MemoryCache<T> {
    entries: Mutex<LruCache<String, CacheEntry<T>>>,
    ttl: Duration,
}

impl<T: Clone> MemoryCache<T> {
    pub fn new(max_size: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(max_size).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            ttl,
        }
    }

    /// Returns the value if it is still fresh and marks it most recently used
    pub fn get(&self, key: &str) -> Option<T> {
        let mut entries = self.lock();

        match entries.get_mut(key) {
            None => return None,
            Some(entry) if !entry.is_expired(self.ttl) => {
                entry.last_accessed = Instant::now();
                return Some(entry.value.clone());
            }
            Some(_) => {}
        }

        entries.pop(key);
        None
    }

    /// Inserts or overwrites. A new key at capacity evicts the least recently
    /// used entry; an overwrite only refreshes recency.
    pub fn set(&self, key: impl Into<String>, value: T) {
        let mut entries = self.lock();
        entries.put(key.into(), CacheEntry::new(value));
    }

    /// Freshness check that leaves recency order untouched
    pub fn has(&self, key: &str) -> bool {
        let mut entries = self.lock();

        let expired = match entries.peek(key) {
            None => return false,
            Some(entry) => entry.is_expired(self.ttl),
        };

        if expired {
            entries.pop(key);
        }
        !expired
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Number of stored entries, expired ones included until they are touched
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, LruCache<String, CacheEntry<T>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_then_get_returns_value() {
        let cache = MemoryCache::new(4, Duration::from_secs(60));
        cache.set("player", "abc".to_string());

        assert_eq!(cache.get("player"), Some("abc".to_string()));
        assert!(cache.has("player"));
        assert_eq!(cache.get("missing"), None);
    }

    #[test]
    fn test_evicts_least_recently_used() {
        let cache = MemoryCache::new(3, Duration::from_secs(60));
        cache.set("a", 1);
        cache.set("b", 2);
        cache.set("c", 3);

        cache.set("d", 4);

        assert_eq!(cache.len(), 3);
        assert!(!cache.has("a"));
        assert!(cache.has("b"));
        assert!(cache.has("c"));
        assert!(cache.has("d"));
    }

    #[test]
    fn test_get_protects_from_eviction() {
        let cache = MemoryCache::new(3, Duration::from_secs(60));
        cache.set("a", 1);
        cache.set("b", 2);
        cache.set("c", 3);

        // "a" becomes most recently used, so "b" is next in line
        assert_eq!(cache.get("a"), Some(1));
        cache.set("d", 4);

        assert!(cache.has("a"));
        assert!(!cache.has("b"));
    }

    #[test]
    fn test_has_does_not_promote() {
        let cache = MemoryCache::new(2, Duration::from_secs(60));
        cache.set("a", 1);
        cache.set("b", 2);

        assert!(cache.has("a"));
        cache.set("c", 3);

        assert!(!cache.has("a"));
        assert!(cache.has("b"));
    }

    #[test]
    fn test_overwrite_is_not_eviction() {
        let cache = MemoryCache::new(2, Duration::from_secs(60));
        cache.set("a", 1);
        cache.set("b", 2);
        cache.set("a", 10);

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get("a"), Some(10));

        // overwrite refreshed "a", so "b" goes first
        cache.set("c", 3);
        assert!(!cache.has("b"));
        assert!(cache.has("a"));
    }

    #[test]
    fn test_expired_entries_are_misses() {
        let cache = MemoryCache::new(4, Duration::from_millis(20));
        cache.set("sig", "value".to_string());
        assert!(cache.has("sig"));

        std::thread::sleep(Duration::from_millis(50));

        assert!(!cache.has("sig"));
        assert_eq!(cache.get("sig"), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_zero_capacity_still_holds_one_entry() {
        let cache = MemoryCache::new(0, Duration::from_secs(60));
        cache.set("a", 1);
        cache.set("b", 2);

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get("b"), Some(2));
    }
}
