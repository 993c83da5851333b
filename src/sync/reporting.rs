//! Cached read path for reporting
//!
//! Reads stored records and sync statuses through the response cache.
//! Keys follow [`cache_key`] so that a finished sync can invalidate them by
//! entity pattern.

use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::cache::{cache_key, get_or_fetch, ResponseCache};
use crate::client::format_timestamp;
use crate::config::CacheConfig;
use crate::database::Repository;
use crate::error::{AppError, CacheError};
use crate::models::{EntityRecord, EntityType, SyncStatus, TimeRange};

/// Cache key of the sync status listing
pub const STATUS_CACHE_KEY: &str = "/sync/status";

pub struct ReportingService {
    repository: Arc<dyn Repository>,
    cache: Option<Arc<dyn ResponseCache>>,
    ttl: Duration,
}

impl ReportingService {
    /// `cache` is ignored when caching is disabled in `config`
    pub fn new(
        repository: Arc<dyn Repository>,
        cache: Option<Arc<dyn ResponseCache>>,
        config: &CacheConfig,
    ) -> Self {
        Self {
            repository,
            cache: cache.filter(|_| config.enabled),
            ttl: Duration::from_secs(config.default_ttl_secs),
        }
    }

    /// Stored records of one entity type, optionally limited to a range
    pub async fn records(
        &self,
        entity: EntityType,
        range: Option<TimeRange>,
    ) -> Result<Vec<EntityRecord>, AppError> {
        let query: Vec<(String, String)> = range
            .map(|r| {
                vec![
                    ("start".to_string(), format_timestamp(r.start)),
                    ("end".to_string(), format_timestamp(r.end)),
                ]
            })
            .unwrap_or_default();
        let key = cache_key("GET", &entity.path(), &query, None);

        let repository = self.repository.clone();
        self.read_through(&key, || async move {
            let records = repository.get_records(entity, range).await?;
            to_json(&records)
        })
        .await
    }

    /// Current sync status of every entity type
    pub async fn statuses(&self) -> Result<Vec<SyncStatus>, AppError> {
        let repository = self.repository.clone();
        self.read_through(STATUS_CACHE_KEY, || async move {
            let statuses = repository.get_all_sync_statuses().await?;
            to_json(&statuses)
        })
        .await
    }

    async fn read_through<T, F, Fut>(&self, key: &str, fetch: F) -> Result<T, AppError>
    where
        T: DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<Value, AppError>>,
    {
        let value = match &self.cache {
            Some(cache) => get_or_fetch(cache.as_ref(), key, self.ttl, fetch).await?,
            None => fetch().await?,
        };

        serde_json::from_value(value)
            .map_err(|e| CacheError::Serialization(format!("{}: {}", key, e)).into())
    }
}

fn to_json<T: Serialize>(value: &T) -> Result<Value, AppError> {
    serde_json::to_value(value).map_err(|e| CacheError::Serialization(e.to_string()).into())
}
