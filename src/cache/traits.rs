//! Response cache trait and related types

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CacheError;

/// Statistics about cache usage
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    /// Live entries (expired entries not yet evicted are included)
    pub entries: u64,
    /// Number of cache hits
    pub hits: u64,
    /// Number of cache misses, including expired reads
    pub misses: u64,
    /// Entries removed to stay under the size bound
    pub evictions: u64,
}

/// Short-lived, key-addressed store for read results
///
/// Not authoritative: losing any entry only costs an extra upstream read.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ResponseCache: Send + Sync {
    /// Returns the value for `key`, or `None` if absent or expired
    async fn get(&self, key: &str) -> Result<Option<Value>, CacheError>;

    /// Stores `value` under `key` for `ttl`, replacing any previous value
    async fn set(&self, key: &str, value: Value, ttl: Duration) -> Result<(), CacheError>;

    /// Invalidation generation, advanced by every delete
    async fn generation(&self) -> u64;

    /// Stores `value` only if no invalidation happened since `generation`
    ///
    /// Returns whether the value was stored.
    async fn set_if_current(
        &self,
        key: &str,
        value: Value,
        ttl: Duration,
        generation: u64,
    ) -> Result<bool, CacheError>;

    /// Deletes a cached entry by key
    ///
    /// Returns `Ok(())` even if the entry doesn't exist.
    async fn delete(&self, key: &str) -> Result<(), CacheError>;

    /// Deletes every key matching a glob pattern (`*` and `?`)
    ///
    /// Returns the number of entries removed.
    async fn delete_pattern(&self, pattern: &str) -> Result<u64, CacheError>;

    /// Returns statistics about cache usage
    async fn stats(&self) -> CacheStats;
}
