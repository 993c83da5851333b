//! Database layer for marketing-sync
//!
//! This module provides:
//! - The bounded connection pool (persistence gateway)
//! - The `Repository` trait consumed by the sync engine
//! - A SQLite implementation of that trait

pub mod migrations;
pub mod pool;
pub mod sqlite;

pub use pool::{ConnectionPool, PoolStats, PooledConnection, QueryOptions};
pub use sqlite::SqliteRepository;

use async_trait::async_trait;

use crate::error::DbError;
use crate::models::{EntityRecord, EntityType, SyncStatus, TimeRange};

/// Storage operations needed by the sync engine and the reporting path
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Repository: Send + Sync {
    // =========================================================================
    // Entity records
    // =========================================================================

    /// Insert or update records keyed by id, all in one transaction
    ///
    /// Returns the number of records written. An empty slice is a no-op.
    async fn upsert_records(
        &self,
        entity: EntityType,
        records: &[EntityRecord],
    ) -> Result<u64, DbError>;

    /// Records whose update time (or creation time when never updated) falls
    /// inside `range`, or all records when `range` is `None`
    async fn get_records(
        &self,
        entity: EntityType,
        range: Option<TimeRange>,
    ) -> Result<Vec<EntityRecord>, DbError>;

    async fn count_records(&self, entity: EntityType) -> Result<u64, DbError>;

    // =========================================================================
    // Sync status
    // =========================================================================

    /// Create `not_synced` rows for entity types that have none
    ///
    /// Returns how many rows were created.
    async fn init_sync_statuses(&self, entities: &[EntityType]) -> Result<u64, DbError>;

    /// Overwrite the status row for the status's entity type
    async fn update_sync_status(&self, status: &SyncStatus) -> Result<(), DbError>;

    async fn get_sync_status(&self, entity: EntityType) -> Result<Option<SyncStatus>, DbError>;

    async fn get_all_sync_statuses(&self) -> Result<Vec<SyncStatus>, DbError>;

    /// Mark rows left in `syncing` as `failed` with `message`
    ///
    /// Returns how many rows were changed.
    async fn reset_interrupted(&self, message: &str) -> Result<u64, DbError>;
}
