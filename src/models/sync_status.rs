//! Sync status and sync result models

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::EntityType;

/// Per-entity sync bookkeeping, one row per entity type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStatus {
    /// Entity type this row describes
    pub entity_type: EntityType,

    /// Start time of the last successful sync
    pub last_sync_at: Option<DateTime<Utc>>,

    /// Current state
    pub status: SyncStatusValue,

    /// Records written by the last successful sync
    pub record_count: u64,

    /// Whether the last finished sync succeeded
    pub success: bool,

    /// Error message if the last sync failed
    pub error_message: Option<String>,
}

impl SyncStatus {
    /// Create a status for an entity that has never been synced
    pub fn new(entity_type: EntityType) -> Self {
        Self {
            entity_type,
            last_sync_at: None,
            status: SyncStatusValue::NotSynced,
            record_count: 0,
            success: false,
            error_message: None,
        }
    }

    /// Mark as running
    pub fn syncing(mut self) -> Self {
        self.status = SyncStatusValue::Syncing;
        self
    }

    /// Mark as successful; `started_at` becomes the next incremental lower bound
    pub fn synced(mut self, record_count: u64, started_at: DateTime<Utc>) -> Self {
        self.last_sync_at = Some(started_at);
        self.status = SyncStatusValue::Synced;
        self.record_count = record_count;
        self.success = true;
        self.error_message = None;
        self
    }

    /// Mark as failed, keeping the last successful sync time
    pub fn failed(mut self, error: impl Into<String>) -> Self {
        self.status = SyncStatusValue::Failed;
        self.success = false;
        self.error_message = Some(error.into());
        self
    }
}

/// State of an entity type's sync
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatusValue {
    /// Never synced
    #[default]
    NotSynced,
    /// Sync currently running
    Syncing,
    /// Last sync succeeded
    Synced,
    /// Last sync failed
    Failed,
}

impl SyncStatusValue {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatusValue::NotSynced => "not_synced",
            SyncStatusValue::Syncing => "syncing",
            SyncStatusValue::Synced => "synced",
            SyncStatusValue::Failed => "failed",
        }
    }

    /// Parse the stored column value
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "not_synced" => Some(SyncStatusValue::NotSynced),
            "syncing" => Some(SyncStatusValue::Syncing),
            "synced" => Some(SyncStatusValue::Synced),
            "failed" => Some(SyncStatusValue::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for SyncStatusValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of syncing one entity type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntitySyncResult {
    pub entity_type: EntityType,
    pub success: bool,
    /// Records written
    pub count: u64,
    /// Records dropped by validation
    pub skipped: u64,
    pub message: String,
}

impl EntitySyncResult {
    pub fn success(entity_type: EntityType, count: u64, skipped: u64) -> Self {
        Self {
            entity_type,
            success: true,
            count,
            skipped,
            message: format!("Synced {} {}", count, entity_type),
        }
    }

    pub fn failure(entity_type: EntityType, message: impl Into<String>) -> Self {
        Self {
            entity_type,
            success: false,
            count: 0,
            skipped: 0,
            message: message.into(),
        }
    }
}

/// Outcome of a multi-entity sync
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncAllResult {
    /// True only if every attempted entity succeeded
    pub success: bool,
    pub entity_results: BTreeMap<EntityType, EntitySyncResult>,
    pub errors: Vec<String>,
}

/// Options for a multi-entity sync
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncOptions {
    /// Ignore the incremental lower bound and fetch everything
    pub force: bool,
    /// Fetch only records changed since the last successful sync
    pub incremental: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_status_transitions() {
        let started = Utc::now();
        let mut status = SyncStatus::new(EntityType::Campaigns);
        assert_eq!(status.status, SyncStatusValue::NotSynced);
        assert!(!status.success);

        status = status.syncing();
        assert_eq!(status.status, SyncStatusValue::Syncing);

        status = status.synced(42, started);
        assert_eq!(status.status, SyncStatusValue::Synced);
        assert_eq!(status.record_count, 42);
        assert_eq!(status.last_sync_at, Some(started));
        assert!(status.success);

        status = status.syncing().failed("upstream 500");
        assert_eq!(status.status, SyncStatusValue::Failed);
        assert_eq!(status.error_message, Some("upstream 500".to_string()));
        // failure keeps the last successful watermark
        assert_eq!(status.last_sync_at, Some(started));
        assert_eq!(status.record_count, 42);
    }

    #[test]
    fn test_sync_status_value_serialization() {
        let values = vec![
            (SyncStatusValue::NotSynced, r#""not_synced""#),
            (SyncStatusValue::Syncing, r#""syncing""#),
            (SyncStatusValue::Synced, r#""synced""#),
            (SyncStatusValue::Failed, r#""failed""#),
        ];

        for (value, expected_json) in values {
            let json = serde_json::to_string(&value).unwrap();
            assert_eq!(json, expected_json);
            assert_eq!(SyncStatusValue::parse(value.as_str()), Some(value));
        }
        assert_eq!(SyncStatusValue::parse("pending"), None);
    }

    #[test]
    fn test_sync_all_result_serializes_entity_keys() {
        let mut result = SyncAllResult::default();
        result.entity_results.insert(
            EntityType::Flows,
            EntitySyncResult::failure(EntityType::Flows, "boom"),
        );
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["entity_results"]["flows"]["success"], false);
    }
}
