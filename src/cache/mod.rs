//! Response cache
//!
//! This module provides:
//! - The `ResponseCache` trait and cache statistics
//! - An in-memory TTL implementation
//! - Key normalization and glob invalidation patterns
//! - A cache-aside helper for read paths

pub mod key;
pub mod memory;
pub mod traits;

use std::future::Future;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, warn};

pub use key::{cache_key, glob_to_regex};
pub use memory::MemoryCache;
pub use traits::{CacheStats, ResponseCache};

#[cfg(test)]
pub use traits::MockResponseCache;

/// Cache-aside read
///
/// Returns the cached value on a hit. On a miss runs `fetch` and stores its
/// successful result, unless the cache was invalidated while `fetch` ran.
/// Cache failures are logged and bypassed, never surfaced.
pub async fn get_or_fetch<F, Fut, E>(
    cache: &dyn ResponseCache,
    key: &str,
    ttl: Duration,
    fetch: F,
) -> Result<Value, E>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Value, E>>,
{
    match cache.get(key).await {
        Ok(Some(value)) => {
            debug!(key = %key, "Cache hit");
            return Ok(value);
        }
        Ok(None) => debug!(key = %key, "Cache miss"),
        Err(e) => warn!(key = %key, error = %e, "Cache read failed, bypassing"),
    }

    let generation = cache.generation().await;
    let value = fetch().await?;

    if let Err(e) = cache
        .set_if_current(key, value.clone(), ttl, generation)
        .await
    {
        warn!(key = %key, error = %e, "Cache write failed");
    }
    Ok(value)
}
