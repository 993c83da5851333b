//! In-memory response cache
//!
//! Entries expire lazily: an expired entry is reported as a miss and removed
//! on the read that finds it. There is no background sweep.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::debug;

use super::key::glob_to_regex;
use super::traits::{CacheStats, ResponseCache};
use crate::error::CacheError;

#[derive(Debug, Clone)]
struct CacheEntry {
    value: Value,
    stored_at: Instant,
    ttl: Duration,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now.duration_since(self.stored_at) >= self.ttl
    }
}

/// Internal state for tracking cache statistics
#[derive(Default)]
struct CacheState {
    storage: HashMap<String, CacheEntry>,
    hits: u64,
    misses: u64,
    evictions: u64,
    generation: u64,
}

/// Map-backed cache bounded by entry count
pub struct MemoryCache {
    max_entries: usize,
    state: Arc<RwLock<CacheState>>,
}

impl MemoryCache {
    /// Creates a cache holding at most `max_entries` values
    pub fn new(max_entries: usize) -> Self {
        Self {
            max_entries: max_entries.max(1),
            state: Arc::new(RwLock::new(CacheState::default())),
        }
    }

    /// Make room for one insert: expired entries go first, then the oldest
    fn evict_for_insert(state: &mut CacheState, max_entries: usize, now: Instant) {
        if state.storage.len() < max_entries {
            return;
        }

        let before = state.storage.len();
        state.storage.retain(|_, entry| !entry.is_expired(now));
        let expired = (before - state.storage.len()) as u64;

        let mut evicted = 0u64;
        while state.storage.len() >= max_entries {
            let oldest = state
                .storage
                .iter()
                .min_by_key(|(_, entry)| entry.stored_at)
                .map(|(key, _)| key.clone());
            match oldest {
                Some(key) => {
                    state.storage.remove(&key);
                    evicted += 1;
                }
                None => break,
            }
        }

        state.evictions += evicted;
        if expired + evicted > 0 {
            debug!(expired, evicted, "Evicted cache entries");
        }
    }

    fn insert(&self, state: &mut CacheState, key: &str, value: Value, ttl: Duration) {
        let now = Instant::now();
        if !state.storage.contains_key(key) {
            Self::evict_for_insert(state, self.max_entries, now);
        }
        state.storage.insert(
            key.to_string(),
            CacheEntry {
                value,
                stored_at: now,
                ttl,
            },
        );
    }
}

#[async_trait]
impl ResponseCache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<Value>, CacheError> {
        let now = Instant::now();
        let mut state = self.state.write().await;

        let entry_info = state
            .storage
            .get(key)
            .map(|e| (e.is_expired(now), e.value.clone()));

        match entry_info {
            Some((true, _)) => {
                state.storage.remove(key);
                state.misses += 1;
                Ok(None)
            }
            Some((false, value)) => {
                state.hits += 1;
                Ok(Some(value))
            }
            None => {
                state.misses += 1;
                Ok(None)
            }
        }
    }

    async fn set(&self, key: &str, value: Value, ttl: Duration) -> Result<(), CacheError> {
        let mut state = self.state.write().await;
        self.insert(&mut state, key, value, ttl);
        Ok(())
    }

    async fn generation(&self) -> u64 {
        self.state.read().await.generation
    }

    async fn set_if_current(
        &self,
        key: &str,
        value: Value,
        ttl: Duration,
        generation: u64,
    ) -> Result<bool, CacheError> {
        let mut state = self.state.write().await;
        if state.generation != generation {
            debug!(key = %key, "Skipping fill invalidated while in flight");
            return Ok(false);
        }
        self.insert(&mut state, key, value, ttl);
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        let mut state = self.state.write().await;
        state.storage.remove(key);
        state.generation += 1;
        Ok(())
    }

    async fn delete_pattern(&self, pattern: &str) -> Result<u64, CacheError> {
        let re = glob_to_regex(pattern)?;
        let mut state = self.state.write().await;

        let before = state.storage.len();
        state.storage.retain(|key, _| !re.is_match(key));
        let removed = (before - state.storage.len()) as u64;
        state.generation += 1;

        debug!(pattern = %pattern, removed, "Invalidated cache entries");
        Ok(removed)
    }

    async fn stats(&self) -> CacheStats {
        let state = self.state.read().await;

        CacheStats {
            entries: state.storage.len() as u64,
            hits: state.hits,
            misses: state.misses,
            evictions: state.evictions,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    // Test 1: Set then get returns the value
    #[tokio::test]
    async fn test_set_and_get() {
        let cache = MemoryCache::new(10);
        cache
            .set("/campaigns", json!({"rows": 3}), Duration::from_secs(60))
            .await
            .unwrap();

        let value = cache.get("/campaigns").await.unwrap();
        assert_eq!(value, Some(json!({"rows": 3})));

        let stats = cache.stats().await;
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.entries, 1);
    }

    // Test 2: Miss on unknown key
    #[tokio::test]
    async fn test_get_miss() {
        let cache = MemoryCache::new(10);
        assert_eq!(cache.get("/nothing").await.unwrap(), None);
        assert_eq!(cache.stats().await.misses, 1);
    }

    // Test 3: Value is served before the TTL and missed at the TTL
    #[tokio::test(start_paused = true)]
    async fn test_ttl_boundary() {
        let cache = MemoryCache::new(10);
        cache
            .set("/flows", json!([1, 2]), Duration::from_secs(5))
            .await
            .unwrap();

        tokio::time::advance(Duration::from_millis(4999)).await;
        assert_eq!(cache.get("/flows").await.unwrap(), Some(json!([1, 2])));

        tokio::time::advance(Duration::from_millis(1)).await;
        assert_eq!(cache.get("/flows").await.unwrap(), None);

        // expired entry was removed on read
        assert_eq!(cache.stats().await.entries, 0);
    }

    // Test 4: Overwrite resets the write time
    #[tokio::test(start_paused = true)]
    async fn test_overwrite_resets_ttl() {
        let cache = MemoryCache::new(10);
        cache.set("k", json!(1), Duration::from_secs(2)).await.unwrap();
        tokio::time::advance(Duration::from_secs(1)).await;
        cache.set("k", json!(2), Duration::from_secs(2)).await.unwrap();
        tokio::time::advance(Duration::from_millis(1500)).await;

        assert_eq!(cache.get("k").await.unwrap(), Some(json!(2)));
    }

    // Test 5: Pattern deletion only touches matching keys
    #[tokio::test]
    async fn test_delete_pattern() {
        let cache = MemoryCache::new(10);
        let ttl = Duration::from_secs(60);
        cache.set("/campaigns", json!(1), ttl).await.unwrap();
        cache.set("/campaigns?start=2025-01-01", json!(2), ttl).await.unwrap();
        cache.set("/flows", json!(3), ttl).await.unwrap();

        let removed = cache.delete_pattern("/campaigns*").await.unwrap();
        assert_eq!(removed, 2);
        assert_eq!(cache.get("/campaigns").await.unwrap(), None);
        assert_eq!(cache.get("/flows").await.unwrap(), Some(json!(3)));
    }

    // Test 6: Size bound evicts expired entries before live ones
    #[tokio::test(start_paused = true)]
    async fn test_eviction_prefers_expired() {
        let cache = MemoryCache::new(2);
        cache.set("short", json!(1), Duration::from_secs(1)).await.unwrap();
        cache.set("long", json!(2), Duration::from_secs(100)).await.unwrap();

        tokio::time::advance(Duration::from_secs(2)).await;
        cache.set("new", json!(3), Duration::from_secs(100)).await.unwrap();

        assert_eq!(cache.get("long").await.unwrap(), Some(json!(2)));
        assert_eq!(cache.get("new").await.unwrap(), Some(json!(3)));
        assert_eq!(cache.stats().await.evictions, 0);
    }

    // Test 7: Size bound evicts the oldest live entry
    #[tokio::test(start_paused = true)]
    async fn test_eviction_oldest() {
        let cache = MemoryCache::new(2);
        let ttl = Duration::from_secs(100);
        cache.set("a", json!(1), ttl).await.unwrap();
        tokio::time::advance(Duration::from_millis(10)).await;
        cache.set("b", json!(2), ttl).await.unwrap();
        tokio::time::advance(Duration::from_millis(10)).await;
        cache.set("c", json!(3), ttl).await.unwrap();

        assert_eq!(cache.get("a").await.unwrap(), None);
        assert_eq!(cache.get("b").await.unwrap(), Some(json!(2)));
        assert_eq!(cache.stats().await.evictions, 1);
    }

    // Test 8: A fill started before an invalidation is dropped
    #[tokio::test]
    async fn test_set_if_current_after_invalidation() {
        let cache = MemoryCache::new(10);
        let ttl = Duration::from_secs(60);

        let before = cache.generation().await;
        assert!(cache.set_if_current("/flows", json!(1), ttl, before).await.unwrap());

        cache.delete_pattern("/segments*").await.unwrap();
        assert!(!cache.set_if_current("/flows", json!(2), ttl, before).await.unwrap());
        assert_eq!(cache.get("/flows").await.unwrap(), Some(json!(1)));

        let current = cache.generation().await;
        assert!(cache.set_if_current("/flows", json!(3), ttl, current).await.unwrap());
        assert_eq!(cache.get("/flows").await.unwrap(), Some(json!(3)));
    }
}
