//! Shared read cache for repository file content.
//!
//! Content at a resolved commit never changes, so entries are keyed by
//! `(path, commit id)` and re-inserting the same key is harmless. The cache is
//! an explicit handle: callers create one and pass it (usually behind an `Arc`)
//! to every inspector that should share it.

use mini_moka::sync::{Cache, ConcurrentCacheExt};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Cache key: a file path at a resolved revision.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub path: String,
    pub revision: String,
}

impl CacheKey {
    pub fn new(path: impl Into<String>, revision: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            revision: revision.into(),
        }
    }
}

/// Bounded content cache. `None` when caching is disabled.
pub struct ContentCache {
    capacity: usize,
    entries: Option<Cache<CacheKey, Arc<str>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ContentCache {
    /// Create a cache holding at most `capacity` files. Zero disables caching.
    pub fn new(capacity: usize) -> Self {
        let entries = (capacity > 0).then(|| {
            Cache::builder()
                .max_capacity(capacity as u64)
                .build()
        });
        Self {
            capacity,
            entries,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn get(&self, key: &CacheKey) -> Option<Arc<str>> {
        let found = self.entries.as_ref().and_then(|c| c.get(key));
        let counter = if found.is_some() {
            &self.hits
        } else {
            &self.misses
        };
        counter.fetch_add(1, Ordering::Relaxed);
        found
    }

    pub fn insert(&self, key: CacheKey, content: Arc<str>) {
        if let Some(cache) = &self.entries {
            cache.insert(key, content);
        }
    }

    /// Return the cached entry, or load and insert it.
    ///
    /// Two concurrent misses may both load; the second insert overwrites the
    /// first with identical content.
    pub fn get_or_try_insert_with<F, E>(&self, key: CacheKey, load: F) -> Result<Arc<str>, E>
    where
        F: FnOnce() -> Result<String, E>,
    {
        if let Some(hit) = self.get(&key) {
            return Ok(hit);
        }
        let content: Arc<str> = Arc::from(load()?);
        self.insert(key, content.clone());
        Ok(content)
    }

    /// Entry count after pending evictions are applied.
    pub fn len(&self) -> usize {
        self.entries.as_ref().map_or(0, |c| {
            c.sync();
            c.entry_count() as usize
        })
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// `(hits, misses)` since creation.
    pub fn stats(&self) -> (u64, u64) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
        )
    }
}

impl std::fmt::Debug for ContentCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentCache")
            .field("capacity", &self.capacity)
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(path: &str) -> CacheKey {
        CacheKey::new(path, "abc123")
    }

    #[test]
    fn test_size_stays_within_capacity() {
        let cache = ContentCache::new(2);
        for i in 0..10 {
            cache.insert(key(&format!("file{}", i)), Arc::from("x"));
        }
        assert!(cache.len() <= 2);
        assert_eq!(cache.capacity(), 2);
    }

    #[test]
    fn test_reinsert_is_idempotent() {
        let cache = ContentCache::new(4);
        cache.insert(key("a"), Arc::from("same"));
        cache.insert(key("a"), Arc::from("same"));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(&key("a")).as_deref(), Some("same"));
    }

    #[test]
    fn test_revision_is_part_of_key() {
        let cache = ContentCache::new(4);
        cache.insert(CacheKey::new("a", "r1"), Arc::from("old"));
        cache.insert(CacheKey::new("a", "r2"), Arc::from("new"));
        assert_eq!(cache.get(&CacheKey::new("a", "r1")).as_deref(), Some("old"));
        assert_eq!(cache.get(&CacheKey::new("a", "r2")).as_deref(), Some("new"));
    }

    #[test]
    fn test_loader_runs_once_per_key() {
        let cache = ContentCache::new(4);
        let mut loads = 0;
        for _ in 0..3 {
            let value = cache
                .get_or_try_insert_with(key("a"), || {
                    loads += 1;
                    Ok::<_, ()>("content".to_string())
                })
                .unwrap();
            assert_eq!(&*value, "content");
        }
        assert_eq!(loads, 1);
        assert_eq!(cache.stats(), (2, 1));
    }

    #[test]
    fn test_zero_capacity_disables_storage() {
        let cache = ContentCache::new(0);
        cache.insert(key("a"), Arc::from("A"));
        assert!(cache.is_empty());
        assert!(cache.get(&key("a")).is_none());
    }

    #[test]
    fn test_shared_across_threads() {
        let cache = Arc::new(ContentCache::new(8));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let cache = cache.clone();
                std::thread::spawn(move || {
                    cache
                        .get_or_try_insert_with(key("shared"), || Ok::<_, ()>("same".to_string()))
                        .unwrap()
                })
            })
            .collect();
        for handle in handles {
            assert_eq!(&*handle.join().unwrap(), "same");
        }
        assert_eq!(cache.len(), 1);
    }
}
