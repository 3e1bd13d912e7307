//! Decoded tile cache
//!
//! One LRU over `(fragment, file, tile)` keys with a byte budget. Payloads
//! are `bytes::Bytes`, so a buffer handed to an iterator stays alive even if
//! the index evicts its entry; eviction only drops the cache's own
//! reference.

use bytes::Bytes;
use lru::LruCache;
use parking_lot::Mutex;

/// Cache key: one decoded tile of one attribute file of one fragment.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TileKey {
    /// Fragment directory name.
    pub fragment: String,
    /// Index of the attribute file within the fragment.
    pub file: u32,
    /// Tile sequence number within the file.
    pub tile: u64,
}

struct Inner {
    lru: LruCache<TileKey, Bytes>,
    used: usize,
    budget: usize,
}

/// LRU cache of decoded tile payloads with a byte budget.
pub struct TileCache {
    inner: Mutex<Inner>,
}

impl TileCache {
    pub fn new(budget: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                lru: LruCache::unbounded(),
                used: 0,
                budget,
            }),
        }
    }

    /// Look up a decoded tile, refreshing its recency.
    pub fn get(&self, key: &TileKey) -> Option<Bytes> {
        let mut inner = self.inner.lock();
        inner.lru.get(key).cloned()
    }

    /// Insert a decoded tile, evicting least-recently-used entries past the
    /// byte budget.
    pub fn insert(&self, key: TileKey, data: Bytes) {
        let mut inner = self.inner.lock();
        if let Some(old) = inner.lru.put(key, data.clone()) {
            inner.used -= old.len();
        }
        inner.used += data.len();
        while inner.used > inner.budget && inner.lru.len() > 1 {
            if let Some((_, evicted)) = inner.lru.pop_lru() {
                inner.used -= evicted.len();
            } else {
                break;
            }
        }
    }

    pub fn used_bytes(&self) -> usize {
        self.inner.lock().used
    }

    pub fn len(&self) -> usize {
        self.inner.lock().lru.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every entry belonging to a fragment, after consolidation retires
    /// its directory.
    pub fn evict_fragment(&self, fragment: &str) {
        let mut inner = self.inner.lock();
        let keys: Vec<TileKey> = inner
            .lru
            .iter()
            .filter(|(k, _)| k.fragment == fragment)
            .map(|(k, _)| k.clone())
            .collect();
        for key in keys {
            if let Some(evicted) = inner.lru.pop(&key) {
                inner.used -= evicted.len();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(tile: u64) -> TileKey {
        TileKey {
            fragment: "__100_abc".to_string(),
            file: 0,
            tile,
        }
    }

    #[test]
    fn test_insert_and_get() {
        let cache = TileCache::new(1024);
        cache.insert(key(0), Bytes::from(vec![1u8; 100]));
        assert_eq!(cache.get(&key(0)).unwrap().len(), 100);
        assert!(cache.get(&key(1)).is_none());
        assert_eq!(cache.used_bytes(), 100);
    }

    #[test]
    fn test_budget_eviction() {
        let cache = TileCache::new(250);
        for t in 0..4 {
            cache.insert(key(t), Bytes::from(vec![0u8; 100]));
        }
        assert!(cache.used_bytes() <= 250);
        // Oldest entries went first.
        assert!(cache.get(&key(0)).is_none());
        assert!(cache.get(&key(3)).is_some());
    }

    #[test]
    fn test_pinned_buffer_survives_eviction() {
        let cache = TileCache::new(150);
        cache.insert(key(0), Bytes::from(vec![7u8; 100]));
        let pinned = cache.get(&key(0)).unwrap();
        cache.insert(key(1), Bytes::from(vec![8u8; 100]));
        // Entry 0 was evicted from the index but the handed-out buffer is
        // still readable.
        assert_eq!(pinned.len(), 100);
        assert_eq!(pinned[0], 7);
    }

    #[test]
    fn test_reinsert_same_key_updates_usage() {
        let cache = TileCache::new(1024);
        cache.insert(key(0), Bytes::from(vec![0u8; 100]));
        cache.insert(key(0), Bytes::from(vec![0u8; 40]));
        assert_eq!(cache.used_bytes(), 40);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_evict_fragment() {
        let cache = TileCache::new(1024);
        cache.insert(key(0), Bytes::from(vec![0u8; 10]));
        let other = TileKey {
            fragment: "__200_def".to_string(),
            file: 0,
            tile: 0,
        };
        cache.insert(other.clone(), Bytes::from(vec![0u8; 10]));
        cache.evict_fragment("__100_abc");
        assert!(cache.get(&key(0)).is_none());
        assert!(cache.get(&other).is_some());
        assert_eq!(cache.used_bytes(), 10);
    }
}
