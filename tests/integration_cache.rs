//! Cache behavior integration tests
//!
//! Tests the cached read path over a SQLite store:
//! - Reads are served from the cache until the TTL elapses
//! - Disabled caching always reads through
//! - Range reads are cached separately

mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;

use common::create_test_repository;
use marketing_sync::cache::{MemoryCache, ResponseCache};
use marketing_sync::config::CacheConfig;
use marketing_sync::database::Repository;
use marketing_sync::models::{EntityRecord, EntityType, TimeRange};
use marketing_sync::sync::ReportingService;

fn record(id: &str, day: u32) -> EntityRecord {
    let at = NaiveDate::from_ymd_opt(2025, 3, day)
        .unwrap()
        .and_hms_opt(12, 0, 0)
        .unwrap()
        .and_utc();
    EntityRecord::new(id, format!("Campaign {}", id)).with_timestamps(Some(at), Some(at))
}

fn cache_config(enabled: bool, ttl_secs: u64) -> CacheConfig {
    CacheConfig {
        enabled,
        default_ttl_secs: ttl_secs,
        max_entries: 100,
    }
}

/// Test 1: Writes that bypass invalidation stay hidden until the TTL elapses
#[tokio::test]
async fn test_cached_read_expires_after_ttl() {
    let dir = tempfile::tempdir().unwrap();
    let repository = create_test_repository(&dir).await;
    repository
        .upsert_records(EntityType::Campaigns, &[record("c1", 1)])
        .await
        .unwrap();

    let cache: Arc<dyn ResponseCache> = Arc::new(MemoryCache::new(100));
    let reporting = ReportingService::new(
        repository.clone(),
        Some(cache.clone()),
        &cache_config(true, 1),
    );

    assert_eq!(reporting.records(EntityType::Campaigns, None).await.unwrap().len(), 1);

    repository
        .upsert_records(EntityType::Campaigns, &[record("c2", 2)])
        .await
        .unwrap();

    // Still the cached listing
    assert_eq!(reporting.records(EntityType::Campaigns, None).await.unwrap().len(), 1);
    assert_eq!(cache.stats().await.hits, 1);

    tokio::time::sleep(Duration::from_millis(1100)).await;

    assert_eq!(reporting.records(EntityType::Campaigns, None).await.unwrap().len(), 2);
}

/// Test 2: Disabled caching reads the store every time
#[tokio::test]
async fn test_disabled_cache_reads_through() {
    let dir = tempfile::tempdir().unwrap();
    let repository = create_test_repository(&dir).await;
    let cache: Arc<dyn ResponseCache> = Arc::new(MemoryCache::new(100));
    let reporting = ReportingService::new(
        repository.clone(),
        Some(cache.clone()),
        &cache_config(false, 3600),
    );

    assert!(reporting.records(EntityType::Forms, None).await.unwrap().is_empty());
    repository
        .upsert_records(EntityType::Forms, &[record("fo1", 1)])
        .await
        .unwrap();
    assert_eq!(reporting.records(EntityType::Forms, None).await.unwrap().len(), 1);

    assert_eq!(cache.stats().await.entries, 0);
}

/// Test 3: Different ranges are distinct cache entries with inclusive bounds
#[tokio::test]
async fn test_range_reads_cached_separately() {
    let dir = tempfile::tempdir().unwrap();
    let repository = create_test_repository(&dir).await;
    repository
        .upsert_records(
            EntityType::Campaigns,
            &[record("c1", 1), record("c2", 5), record("c3", 10)],
        )
        .await
        .unwrap();

    let cache: Arc<dyn ResponseCache> = Arc::new(MemoryCache::new(100));
    let reporting = ReportingService::new(
        repository.clone(),
        Some(cache.clone()),
        &cache_config(true, 3600),
    );

    let early = TimeRange::days(
        NaiveDate::from_ymd_opt(2025, 3, 1).unwrap(),
        NaiveDate::from_ymd_opt(2025, 3, 5).unwrap(),
    );
    let late = TimeRange::days(
        NaiveDate::from_ymd_opt(2025, 3, 6).unwrap(),
        NaiveDate::from_ymd_opt(2025, 3, 31).unwrap(),
    );

    let ids = |records: Vec<EntityRecord>| records.into_iter().map(|r| r.id).collect::<Vec<_>>();
    assert_eq!(
        ids(reporting.records(EntityType::Campaigns, Some(early)).await.unwrap()),
        vec!["c1", "c2"]
    );
    assert_eq!(
        ids(reporting.records(EntityType::Campaigns, Some(late)).await.unwrap()),
        vec!["c3"]
    );
    assert_eq!(
        reporting.records(EntityType::Campaigns, None).await.unwrap().len(),
        3
    );

    let stats = cache.stats().await;
    assert_eq!(stats.entries, 3);
    assert_eq!(stats.hits, 0);
}
