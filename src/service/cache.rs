//! LRU cache of computed embeddings
//!
//! Keys combine the exact text, the effective output dimension and the model
//! identity, so vectors of different sizes or from different models never
//! alias. The cache is shared by every caller of the service and synchronizes
//! internally.

use lru::LruCache;
use parking_lot::Mutex;
use serde::Serialize;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::models::Embedding;

/// Cache key
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub text: String,
    pub dim: usize,
    pub model: &'static str,
}

impl CacheKey {
    pub fn new(text: impl Into<String>, dim: usize, model: &'static str) -> Self {
        Self {
            text: text.into(),
            dim,
            model,
        }
    }
}

/// Capacity-bounded least-recently-used embedding cache.
///
/// A capacity of zero disables caching: every `get` misses and `put` is a no-op.
pub struct EmbeddingCache {
    entries: Option<Mutex<LruCache<CacheKey, Embedding>>>,
    capacity: usize,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl EmbeddingCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: NonZeroUsize::new(capacity).map(|cap| Mutex::new(LruCache::new(cap))),
            capacity,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Look up `key`, promoting it to most recently used on a hit
    pub fn get(&self, key: &CacheKey) -> Option<Embedding> {
        let found = self
            .entries
            .as_ref()
            .and_then(|entries| entries.lock().get(key).cloned());

        match found {
            Some(_) => self.hits.fetch_add(1, Ordering::Relaxed),
            None => self.misses.fetch_add(1, Ordering::Relaxed),
        };
        found
    }

    /// Insert `embedding`, evicting the least recently used entry when full
    pub fn put(&self, key: CacheKey, embedding: Embedding) {
        if let Some(entries) = &self.entries {
            entries.lock().put(key, embedding);
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.as_ref().map_or(0, |entries| entries.lock().len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        if let Some(entries) = &self.entries {
            entries.lock().clear();
        }
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            size: self.len(),
            capacity: self.capacity,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub size: usize,
    pub capacity: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(text: &str) -> CacheKey {
        CacheKey::new(text, 3, "mock")
    }

    #[test]
    fn test_hit_and_miss() {
        let cache = EmbeddingCache::new(10);
        assert!(cache.get(&key("hello")).is_none());

        cache.put(key("hello"), vec![1.0, 2.0, 3.0]);
        assert_eq!(cache.get(&key("hello")), Some(vec![1.0, 2.0, 3.0]));

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.size, 1);
        assert_eq!(stats.capacity, 10);
    }

    #[test]
    fn test_key_includes_dimension_and_model() {
        let cache = EmbeddingCache::new(10);
        cache.put(CacheKey::new("text", 128, "qwen3"), vec![1.0]);

        assert!(cache.get(&CacheKey::new("text", 256, "qwen3")).is_none());
        assert!(cache.get(&CacheKey::new("text", 128, "gemma")).is_none());
        assert!(cache.get(&CacheKey::new("text", 128, "qwen3")).is_some());
    }

    #[test]
    fn test_evicts_least_recently_used() {
        let cache = EmbeddingCache::new(2);
        cache.put(key("a"), vec![1.0]);
        cache.put(key("b"), vec![2.0]);

        // Touch "a" so "b" becomes the eviction candidate
        assert!(cache.get(&key("a")).is_some());
        cache.put(key("c"), vec![3.0]);

        assert_eq!(cache.len(), 2);
        assert!(cache.get(&key("b")).is_none());
        assert_eq!(cache.get(&key("a")), Some(vec![1.0]));
        assert_eq!(cache.get(&key("c")), Some(vec![3.0]));
    }

    #[test]
    fn test_strict_lru_order_over_sequence() {
        let cache = EmbeddingCache::new(3);
        for name in ["a", "b", "c"] {
            cache.put(key(name), vec![0.0]);
        }
        cache.get(&key("a"));
        cache.get(&key("b"));
        // Recency now: c < a < b
        cache.put(key("d"), vec![0.0]);
        assert!(cache.get(&key("c")).is_none());
        cache.put(key("e"), vec![0.0]);
        assert!(cache.get(&key("a")).is_none());
        assert!(cache.get(&key("b")).is_some());
        assert!(cache.get(&key("d")).is_some());
        assert!(cache.get(&key("e")).is_some());
    }

    #[test]
    fn test_put_existing_key_replaces_without_eviction() {
        let cache = EmbeddingCache::new(2);
        cache.put(key("a"), vec![1.0]);
        cache.put(key("b"), vec![2.0]);
        cache.put(key("a"), vec![9.0]);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get(&key("b")), Some(vec![2.0]));
        assert_eq!(cache.get(&key("a")), Some(vec![9.0]));
    }

    #[test]
    fn test_zero_capacity_disables_cache() {
        let cache = EmbeddingCache::new(0);
        cache.put(key("a"), vec![1.0]);
        assert!(cache.get(&key("a")).is_none());
        assert!(cache.is_empty());
        assert_eq!(cache.stats().misses, 1);
    }

    #[test]
    fn test_clear() {
        let cache = EmbeddingCache::new(4);
        cache.put(key("a"), vec![1.0]);
        cache.clear();
        assert!(cache.is_empty());
    }
}
