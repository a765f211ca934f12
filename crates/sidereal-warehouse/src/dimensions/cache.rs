//! Process-local identity caches.
//!
//! Caches are advisory. A miss always falls through to an idempotent store
//! upsert, so an empty, disabled, or freshly cleared cache is slower but
//! never incorrect.

use std::borrow::Borrow;
use std::hash::Hash;

use dashmap::DashMap;
use tracing::warn;

use crate::config::CacheConfig;

/// Concurrent map with a soft entry bound.
#[derive(Debug)]
pub struct DimensionCache<K, V>
where
    K: Eq + Hash,
{
    name: &'static str,
    entries: DashMap<K, V>,
    max_entries: usize,
    enabled: bool,
}

impl<K, V> DimensionCache<K, V>
where
    K: Eq + Hash,
    V: Clone,
{
    /// Create a cache from configuration.
    pub fn new(name: &'static str, config: &CacheConfig) -> Self {
        Self {
            name,
            entries: DashMap::new(),
            max_entries: config.max_entries.max(1),
            enabled: config.enabled,
        }
    }

    /// Look up a cached value.
    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Eq + Hash + ?Sized,
    {
        if !self.enabled {
            return None;
        }
        self.entries.get(key).map(|entry| entry.value().clone())
    }

    /// Insert a value, clearing the cache first if it is full.
    pub fn insert(&self, key: K, value: V) {
        if !self.enabled {
            return;
        }
        if self.entries.len() >= self.max_entries {
            warn!(
                cache = self.name,
                entries = self.entries.len(),
                "Identity cache full, clearing"
            );
            self.entries.clear();
        }
        self.entries.insert(key, value);
    }

    /// Number of cached entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every cached entry.
    pub fn clear(&self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(enabled: bool, max_entries: usize) -> CacheConfig {
        CacheConfig {
            enabled,
            max_entries,
        }
    }

    #[test]
    fn insert_and_get() {
        let cache: DimensionCache<String, i64> = DimensionCache::new("test", &config(true, 10));
        cache.insert("a".to_owned(), 1);
        assert_eq!(cache.get("a"), Some(1));
        assert_eq!(cache.get("b"), None);
    }

    #[test]
    fn full_cache_is_cleared() {
        let cache: DimensionCache<u32, u32> = DimensionCache::new("test", &config(true, 2));
        cache.insert(1, 1);
        cache.insert(2, 2);
        cache.insert(3, 3);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(&3), Some(3));
        assert_eq!(cache.get(&1), None);
    }

    #[test]
    fn disabled_cache_never_hits() {
        let cache: DimensionCache<u32, u32> = DimensionCache::new("test", &config(false, 10));
        cache.insert(1, 1);
        assert!(cache.is_empty());
        assert_eq!(cache.get(&1), None);
    }
}
