//! SQLite implementation of the Repository trait
//!
//! All access goes through the connection pool, so every call inherits its
//! concurrency ceiling, statement timeout and transient-error retries.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::types::{Type, Value as SqlValue};

use super::migrations::{
    column_list, create_schema, BOOKKEEPING_COLUMN, ENTITY_COLUMNS, SCHEMA_VERSION,
};
use super::pool::{ConnectionPool, QueryOptions};
use super::Repository;
use crate::client::format_timestamp;
use crate::config::DatabaseConfig;
use crate::error::DbError;
use crate::models::{
    EntityMetrics, EntityRecord, EntityType, SyncStatus, SyncStatusValue, TimeRange,
};

/// SQLite-backed repository
#[derive(Clone)]
pub struct SqliteRepository {
    pool: ConnectionPool,
}

impl SqliteRepository {
    /// Open the pool described by `config` and apply the schema
    ///
    /// Use `:memory:` as the path for an in-memory store.
    pub async fn new(config: &DatabaseConfig) -> Result<Self, DbError> {
        let pool = ConnectionPool::open(config).await?;
        Self::from_pool(pool).await
    }

    /// Apply the schema on an existing pool
    ///
    /// Refuses a database written by a newer schema version.
    pub async fn from_pool(pool: ConnectionPool) -> Result<Self, DbError> {
        let found = pool
            .with_connection(|conn| {
                conn.pragma_query_value(None, "user_version", |row| row.get::<_, i32>(0))
            })
            .await?;
        if found > SCHEMA_VERSION {
            return Err(DbError::Migration(format!(
                "database schema version {} is newer than supported version {}",
                found, SCHEMA_VERSION
            )));
        }

        let schema = create_schema();
        pool.with_connection(move |conn| {
            conn.execute_batch(&schema)?;
            conn.pragma_update(None, "user_version", SCHEMA_VERSION)
        })
        .await
        .map_err(|e| DbError::Migration(e.to_string()))?;

        Ok(Self { pool })
    }

    /// Create a new in-memory repository (useful for testing)
    pub async fn in_memory() -> Result<Self, DbError> {
        Self::new(&DatabaseConfig {
            path: ":memory:".to_string(),
            ..Default::default()
        })
        .await
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }
}

#[async_trait]
impl Repository for SqliteRepository {
    // =========================================================================
    // Entity records
    // =========================================================================

    async fn upsert_records(
        &self,
        entity: EntityType,
        records: &[EntityRecord],
    ) -> Result<u64, DbError> {
        if records.is_empty() {
            return Ok(0);
        }

        let synced_at = format_timestamp(Utc::now());
        let rows = records
            .iter()
            .map(|record| record_params(record, &synced_at))
            .collect::<Result<Vec<_>, _>>()?;
        let sql = upsert_sql(entity);

        self.pool
            .transaction(move |conn| {
                let mut stmt = conn.prepare_cached(&sql)?;
                for row in &rows {
                    stmt.execute(rusqlite::params_from_iter(row.iter()))?;
                }
                Ok(rows.len() as u64)
            })
            .await
    }

    async fn get_records(
        &self,
        entity: EntityType,
        range: Option<TimeRange>,
    ) -> Result<Vec<EntityRecord>, DbError> {
        let mut sql = format!(
            "SELECT {} FROM {}",
            column_list(),
            entity.table_name()
        );
        let mut params = Vec::new();

        if let Some(range) = range {
            sql.push_str(" WHERE COALESCE(updated_at, created_at) BETWEEN ?1 AND ?2");
            params.push(SqlValue::Text(format_timestamp(range.start)));
            params.push(SqlValue::Text(format_timestamp(range.end)));
        }
        sql.push_str(" ORDER BY COALESCE(updated_at, created_at), id");

        self.pool
            .query(&sql, params, QueryOptions::default(), |row| {
                let metadata: String = row.get(17)?;
                Ok(EntityRecord {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    status: row.get(2)?,
                    created_at: parse_datetime(row.get::<_, Option<String>>(3)?),
                    updated_at: parse_datetime(row.get::<_, Option<String>>(4)?),
                    metrics: EntityMetrics {
                        recipients: row.get(5)?,
                        delivered: row.get(6)?,
                        opens: row.get(7)?,
                        clicks: row.get(8)?,
                        views: row.get(9)?,
                        submits: row.get(10)?,
                        conversions: row.get(11)?,
                        profile_count: row.get(12)?,
                        open_rate: row.get(13)?,
                        click_rate: row.get(14)?,
                        conversion_rate: row.get(15)?,
                        revenue: row.get(16)?,
                    },
                    metadata: serde_json::from_str(&metadata).map_err(|e| {
                        rusqlite::Error::FromSqlConversionFailure(17, Type::Text, Box::new(e))
                    })?,
                })
            })
            .await
    }

    async fn count_records(&self, entity: EntityType) -> Result<u64, DbError> {
        let sql = format!("SELECT COUNT(*) FROM {}", entity.table_name());

        let counts: Vec<i64> = self
            .pool
            .query(&sql, Vec::new(), QueryOptions::default(), |row| row.get(0))
            .await?;

        Ok(counts.first().copied().unwrap_or(0) as u64)
    }

    // =========================================================================
    // Sync status
    // =========================================================================

    async fn init_sync_statuses(&self, entities: &[EntityType]) -> Result<u64, DbError> {
        let names: Vec<&'static str> = entities.iter().map(|e| e.as_str()).collect();
        let now = format_timestamp(Utc::now());

        self.pool
            .transaction(move |conn| {
                let mut created = 0u64;
                for name in &names {
                    created += conn.execute(
                        r#"
                        INSERT OR IGNORE INTO sync_status
                        (entity_type, status, record_count, success, updated_at)
                        VALUES (?1, 'not_synced', 0, 0, ?2)
                        "#,
                        rusqlite::params![name, now],
                    )? as u64;
                }
                Ok(created)
            })
            .await
    }

    async fn update_sync_status(&self, status: &SyncStatus) -> Result<(), DbError> {
        let params = vec![
            SqlValue::Text(status.entity_type.as_str().to_string()),
            optional_timestamp(status.last_sync_at),
            SqlValue::Text(status.status.as_str().to_string()),
            SqlValue::Integer(status.record_count as i64),
            SqlValue::Integer(status.success as i64),
            status
                .error_message
                .clone()
                .map(SqlValue::Text)
                .unwrap_or(SqlValue::Null),
            SqlValue::Text(format_timestamp(Utc::now())),
        ];

        self.pool
            .execute(
                r#"
                INSERT OR REPLACE INTO sync_status
                (entity_type, last_sync_at, status, record_count, success, error_message, updated_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                "#,
                params,
            )
            .await?;

        Ok(())
    }

    async fn get_sync_status(&self, entity: EntityType) -> Result<Option<SyncStatus>, DbError> {
        let statuses = self
            .pool
            .query(
                r#"
                SELECT entity_type, last_sync_at, status, record_count, success, error_message
                FROM sync_status
                WHERE entity_type = ?1
                "#,
                vec![SqlValue::Text(entity.as_str().to_string())],
                QueryOptions::default(),
                map_sync_status,
            )
            .await?;

        Ok(statuses.into_iter().next())
    }

    async fn get_all_sync_statuses(&self) -> Result<Vec<SyncStatus>, DbError> {
        self.pool
            .query(
                r#"
                SELECT entity_type, last_sync_at, status, record_count, success, error_message
                FROM sync_status
                ORDER BY entity_type
                "#,
                Vec::new(),
                QueryOptions::default(),
                map_sync_status,
            )
            .await
    }

    async fn reset_interrupted(&self, message: &str) -> Result<u64, DbError> {
        let changed = self
            .pool
            .execute(
                r#"
                UPDATE sync_status
                SET status = 'failed', success = 0, error_message = ?1, updated_at = ?2
                WHERE status = 'syncing'
                "#,
                vec![
                    SqlValue::Text(message.to_string()),
                    SqlValue::Text(format_timestamp(Utc::now())),
                ],
            )
            .await?;

        Ok(changed as u64)
    }
}

/// `INSERT ... ON CONFLICT(id) DO UPDATE` over every entity column
///
/// An existing row is only rewritten when some content column changed, so
/// `synced_at` records when the stored content was last written.
fn upsert_sql(entity: EntityType) -> String {
    let placeholders: Vec<String> = (1..=ENTITY_COLUMNS.len())
        .map(|i| format!("?{}", i))
        .collect();
    let updated = ENTITY_COLUMNS.iter().map(|(c, _)| *c).filter(|c| *c != "id");
    let updates: Vec<String> = updated
        .clone()
        .map(|c| format!("{c} = excluded.{c}"))
        .collect();
    let changed: Vec<String> = updated
        .filter(|c| *c != BOOKKEEPING_COLUMN)
        .map(|c| format!("{c} IS NOT excluded.{c}"))
        .collect();

    format!(
        "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT(id) DO UPDATE SET {} WHERE {}",
        entity.table_name(),
        column_list(),
        placeholders.join(", "),
        updates.join(", "),
        changed.join(" OR ")
    )
}

/// Bind values for one record, in `ENTITY_COLUMNS` order
fn record_params(record: &EntityRecord, synced_at: &str) -> Result<Vec<SqlValue>, DbError> {
    let m = &record.metrics;
    let metadata = serde_json::to_string(&record.metadata)
        .map_err(|e| DbError::InvalidData(format!("metadata for {}: {}", record.id, e)))?;

    Ok(vec![
        SqlValue::Text(record.id.clone()),
        SqlValue::Text(record.name.clone()),
        record
            .status
            .clone()
            .map(SqlValue::Text)
            .unwrap_or(SqlValue::Null),
        optional_timestamp(record.created_at),
        optional_timestamp(record.updated_at),
        optional_integer(m.recipients),
        optional_integer(m.delivered),
        optional_integer(m.opens),
        optional_integer(m.clicks),
        optional_integer(m.views),
        optional_integer(m.submits),
        optional_integer(m.conversions),
        optional_integer(m.profile_count),
        optional_real(m.open_rate),
        optional_real(m.click_rate),
        optional_real(m.conversion_rate),
        optional_real(m.revenue),
        SqlValue::Text(metadata),
        SqlValue::Text(synced_at.to_string()),
    ])
}

fn optional_timestamp(dt: Option<DateTime<Utc>>) -> SqlValue {
    dt.map(|dt| SqlValue::Text(format_timestamp(dt)))
        .unwrap_or(SqlValue::Null)
}

fn optional_integer(v: Option<i64>) -> SqlValue {
    v.map(SqlValue::Integer).unwrap_or(SqlValue::Null)
}

fn optional_real(v: Option<f64>) -> SqlValue {
    v.map(SqlValue::Real).unwrap_or(SqlValue::Null)
}

fn map_sync_status(row: &rusqlite::Row<'_>) -> rusqlite::Result<SyncStatus> {
    let entity: String = row.get(0)?;
    let entity_type = entity
        .parse::<EntityType>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, Type::Text, Box::new(e)))?;
    let stored: String = row.get(2)?;
    let status = SyncStatusValue::parse(&stored).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            2,
            Type::Text,
            format!("unknown sync status '{}'", stored).into(),
        )
    })?;

    Ok(SyncStatus {
        entity_type,
        last_sync_at: parse_datetime(row.get::<_, Option<String>>(1)?),
        status,
        record_count: row.get::<_, i64>(3)?.max(0) as u64,
        success: row.get::<_, i64>(4)? != 0,
        error_message: row.get(5)?,
    })
}

/// Parse datetime string to DateTime<Utc>
fn parse_datetime(s: Option<String>) -> Option<DateTime<Utc>> {
    s.and_then(|s| {
        DateTime::parse_from_rfc3339(&s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc))
            .or_else(|| {
                // SQLite's CURRENT_TIMESTAMP format
                chrono::NaiveDateTime::parse_from_str(&s, "%Y-%m-%d %H:%M:%S")
                    .ok()
                    .map(|dt| dt.and_utc())
            })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeZone};
    use serde_json::json;

    fn at(y: i32, m: u32, d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, 0, 0).unwrap()
    }

    fn campaign(id: &str, updated: DateTime<Utc>) -> EntityRecord {
        EntityRecord::new(id, format!("Campaign {}", id))
            .with_status("sent")
            .with_timestamps(Some(at(2024, 12, 1, 0)), Some(updated))
            .with_metrics(EntityMetrics {
                recipients: Some(1000),
                opens: Some(250),
                open_rate: Some(0.25),
                ..Default::default()
            })
    }

    // Test 1: Create in-memory repository
    #[tokio::test]
    async fn test_create_in_memory_repository() {
        let repo = SqliteRepository::in_memory().await;
        assert!(repo.is_ok());
    }

    // Test 2: Upsert then read back preserves fields and NULL metrics
    #[tokio::test]
    async fn test_upsert_and_get_records() {
        let repo = SqliteRepository::in_memory().await.unwrap();
        let mut record = campaign("c1", at(2025, 1, 2, 12));
        record.metadata = json!({"channel": "email"});

        let written = repo
            .upsert_records(EntityType::Campaigns, &[record.clone()])
            .await
            .unwrap();
        assert_eq!(written, 1);

        let stored = repo.get_records(EntityType::Campaigns, None).await.unwrap();
        assert_eq!(stored, vec![record]);
        assert_eq!(stored[0].metrics.clicks, None);
    }

    // Test 3: Repeated upsert updates in place
    #[tokio::test]
    async fn test_upsert_is_idempotent() {
        let repo = SqliteRepository::in_memory().await.unwrap();
        let records = vec![
            campaign("c1", at(2025, 1, 2, 12)),
            campaign("c2", at(2025, 1, 3, 12)),
        ];

        repo.upsert_records(EntityType::Campaigns, &records)
            .await
            .unwrap();
        repo.upsert_records(EntityType::Campaigns, &records)
            .await
            .unwrap();

        assert_eq!(repo.count_records(EntityType::Campaigns).await.unwrap(), 2);

        let mut renamed = records[0].clone();
        renamed.name = "Renamed".to_string();
        repo.upsert_records(EntityType::Campaigns, &[renamed])
            .await
            .unwrap();

        let stored = repo.get_records(EntityType::Campaigns, None).await.unwrap();
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[0].name, "Renamed");
    }

    // Test 4: Empty batch writes nothing
    #[tokio::test]
    async fn test_upsert_empty() {
        let repo = SqliteRepository::in_memory().await.unwrap();
        assert_eq!(repo.upsert_records(EntityType::Forms, &[]).await.unwrap(), 0);
        assert_eq!(repo.count_records(EntityType::Forms).await.unwrap(), 0);
    }

    // Test 5: Entity tables are separate
    #[tokio::test]
    async fn test_entity_tables_are_separate() {
        let repo = SqliteRepository::in_memory().await.unwrap();
        repo.upsert_records(EntityType::Flows, &[EntityRecord::new("x1", "Flow")])
            .await
            .unwrap();
        repo.upsert_records(EntityType::Segments, &[EntityRecord::new("x1", "Segment")])
            .await
            .unwrap();

        assert_eq!(repo.count_records(EntityType::Flows).await.unwrap(), 1);
        assert_eq!(repo.count_records(EntityType::Segments).await.unwrap(), 1);
        assert_eq!(repo.count_records(EntityType::Campaigns).await.unwrap(), 0);
    }

    // Test 6: Range query is inclusive on both day boundaries
    #[tokio::test]
    async fn test_get_records_range_inclusive() {
        let repo = SqliteRepository::in_memory().await.unwrap();
        let first = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let last = Utc.with_ymd_and_hms(2025, 1, 31, 23, 59, 59).unwrap();
        let outside = Utc.with_ymd_and_hms(2025, 2, 1, 0, 0, 0).unwrap();

        repo.upsert_records(
            EntityType::Campaigns,
            &[
                campaign("first", first),
                campaign("last", last),
                campaign("outside", outside),
            ],
        )
        .await
        .unwrap();

        let range = TimeRange::days(
            NaiveDate::from_ymd_opt(2025, 1, 1).unwrap(),
            NaiveDate::from_ymd_opt(2025, 1, 31).unwrap(),
        );
        let ids: Vec<String> = repo
            .get_records(EntityType::Campaigns, Some(range))
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, vec!["first".to_string(), "last".to_string()]);
    }

    // Test 7: Sync status bootstrap does not overwrite existing rows
    #[tokio::test]
    async fn test_init_sync_statuses() {
        let repo = SqliteRepository::in_memory().await.unwrap();
        repo.update_sync_status(&SyncStatus::new(EntityType::Flows).synced(7, at(2025, 1, 1, 0)))
            .await
            .unwrap();

        let created = repo.init_sync_statuses(&EntityType::ALL).await.unwrap();
        assert_eq!(created, 3);

        let flows = repo
            .get_sync_status(EntityType::Flows)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(flows.status, SyncStatusValue::Synced);
        assert_eq!(flows.record_count, 7);

        let all = repo.get_all_sync_statuses().await.unwrap();
        assert_eq!(all.len(), 4);
    }

    // Test 8: Status update overwrites the row for that entity
    #[tokio::test]
    async fn test_update_sync_status_overwrites() {
        let repo = SqliteRepository::in_memory().await.unwrap();
        let started = at(2025, 3, 1, 8);

        let synced = SyncStatus::new(EntityType::Campaigns).synced(42, started);
        repo.update_sync_status(&synced).await.unwrap();
        repo.update_sync_status(&synced.clone().failed("boom"))
            .await
            .unwrap();

        let stored = repo
            .get_sync_status(EntityType::Campaigns)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, SyncStatusValue::Failed);
        assert_eq!(stored.error_message.as_deref(), Some("boom"));
        assert_eq!(stored.last_sync_at, Some(started));
        assert!(!stored.success);
        assert_eq!(repo.get_all_sync_statuses().await.unwrap().len(), 1);
    }

    // Test 9: Interrupted syncs are marked failed
    #[tokio::test]
    async fn test_reset_interrupted() {
        let repo = SqliteRepository::in_memory().await.unwrap();
        repo.update_sync_status(&SyncStatus::new(EntityType::Forms).syncing())
            .await
            .unwrap();
        repo.update_sync_status(&SyncStatus::new(EntityType::Flows))
            .await
            .unwrap();

        assert_eq!(repo.reset_interrupted("interrupted").await.unwrap(), 1);

        let forms = repo
            .get_sync_status(EntityType::Forms)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(forms.status, SyncStatusValue::Failed);
        assert_eq!(forms.error_message.as_deref(), Some("interrupted"));
    }

    // Test 10: Missing status is None
    #[tokio::test]
    async fn test_get_sync_status_missing() {
        let repo = SqliteRepository::in_memory().await.unwrap();
        assert!(repo
            .get_sync_status(EntityType::Segments)
            .await
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_parse_datetime() {
        assert!(parse_datetime(Some("2025-01-01T00:00:00.000Z".to_string())).is_some());
        assert!(parse_datetime(Some("2025-01-01 10:00:00".to_string())).is_some());
        assert!(parse_datetime(Some("garbage".to_string())).is_none());
        assert!(parse_datetime(None).is_none());
    }

    // Test 11: Schema version is recorded and a newer one is refused
    #[tokio::test]
    async fn test_schema_version_check() {
        let dir = tempfile::tempdir().unwrap();
        let config = DatabaseConfig {
            path: dir.path().join("versioned.db").to_string_lossy().into_owned(),
            ..Default::default()
        };

        let repo = SqliteRepository::new(&config).await.unwrap();
        let version = repo
            .pool()
            .with_connection(|conn| {
                conn.pragma_query_value(None, "user_version", |row| row.get::<_, i32>(0))
            })
            .await
            .unwrap();
        assert_eq!(version, SCHEMA_VERSION);

        repo.pool()
            .with_connection(|conn| conn.pragma_update(None, "user_version", SCHEMA_VERSION + 1))
            .await
            .unwrap();
        repo.pool().close();

        let pool = ConnectionPool::open(&config).await.unwrap();
        assert!(matches!(
            SqliteRepository::from_pool(pool).await,
            Err(DbError::Migration(_))
        ));
    }

    async fn synced_at(repo: &SqliteRepository, id: &str) -> String {
        let values: Vec<String> = repo
            .pool()
            .query(
                "SELECT synced_at FROM campaigns WHERE id = ?1",
                vec![SqlValue::Text(id.to_string())],
                QueryOptions::default(),
                |row| row.get(0),
            )
            .await
            .unwrap();
        values.into_iter().next().unwrap()
    }

    // Test 12: Unchanged records keep their write time, changed ones get a new one
    #[tokio::test]
    async fn test_unchanged_upsert_keeps_synced_at() {
        let repo = SqliteRepository::in_memory().await.unwrap();
        let records = vec![
            campaign("c1", at(2025, 1, 2, 12)),
            campaign("c2", at(2025, 1, 3, 12)),
        ];

        repo.upsert_records(EntityType::Campaigns, &records)
            .await
            .unwrap();
        let first_c1 = synced_at(&repo, "c1").await;
        let first_c2 = synced_at(&repo, "c2").await;

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let mut changed = records.clone();
        changed[1].metrics.opens = Some(300);
        let written = repo
            .upsert_records(EntityType::Campaigns, &changed)
            .await
            .unwrap();

        assert_eq!(written, 2);
        assert_eq!(synced_at(&repo, "c1").await, first_c1);
        assert_ne!(synced_at(&repo, "c2").await, first_c2);
    }

    // Test 13: An unknown stored status is reported, not defaulted
    #[tokio::test]
    async fn test_unknown_status_is_invalid_data() {
        let repo = SqliteRepository::in_memory().await.unwrap();
        repo.pool()
            .execute(
                "INSERT INTO sync_status (entity_type, status, updated_at) VALUES ('flows', 'paused', '2025-01-01T00:00:00Z')",
                vec![],
            )
            .await
            .unwrap();

        let err = repo.get_sync_status(EntityType::Flows).await.unwrap_err();
        assert!(matches!(err, DbError::InvalidData(ref msg) if msg.contains("paused")));
    }
}
