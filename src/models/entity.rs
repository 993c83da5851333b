//! Entity domain models
//!
//! The four synchronized resource kinds and the locally stored row shape.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::error::SyncError;

/// Synchronized resource kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Campaigns,
    Flows,
    Forms,
    Segments,
}

impl EntityType {
    /// Every entity type, in canonical order
    pub const ALL: [EntityType; 4] = [
        EntityType::Campaigns,
        EntityType::Flows,
        EntityType::Forms,
        EntityType::Segments,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Campaigns => "campaigns",
            EntityType::Flows => "flows",
            EntityType::Forms => "forms",
            EntityType::Segments => "segments",
        }
    }

    /// JSON:API resource type, used in `fields[...]` and payload validation
    pub fn resource_type(&self) -> &'static str {
        match self {
            EntityType::Campaigns => "campaign",
            EntityType::Flows => "flow",
            EntityType::Forms => "form",
            EntityType::Segments => "segment",
        }
    }

    /// Local table holding records of this kind
    pub fn table_name(&self) -> &'static str {
        self.as_str()
    }

    /// Listing path relative to the API base URL
    pub fn path(&self) -> String {
        format!("/{}", self.as_str())
    }

    /// Attribute carrying the last-modified timestamp upstream
    pub fn updated_field(&self) -> &'static str {
        match self {
            EntityType::Campaigns | EntityType::Forms => "updated_at",
            EntityType::Flows | EntityType::Segments => "updated",
        }
    }

    /// Attribute carrying the creation timestamp upstream
    pub fn created_field(&self) -> &'static str {
        match self {
            EntityType::Campaigns | EntityType::Forms => "created_at",
            EntityType::Flows | EntityType::Segments => "created",
        }
    }

    /// Cache key pattern covering every cached read of this entity
    pub fn cache_pattern(&self) -> String {
        format!("/{}*", self.as_str())
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "campaigns" | "campaign" => Ok(EntityType::Campaigns),
            "flows" | "flow" => Ok(EntityType::Flows),
            "forms" | "form" => Ok(EntityType::Forms),
            "segments" | "segment" => Ok(EntityType::Segments),
            _ => Err(SyncError::UnknownEntity(s.to_string())),
        }
    }
}

/// Performance counters promoted to columns
///
/// `None` means the upstream did not report the metric; it is stored as NULL
/// and never conflated with zero.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntityMetrics {
    pub recipients: Option<i64>,
    pub delivered: Option<i64>,
    pub opens: Option<i64>,
    pub clicks: Option<i64>,
    pub views: Option<i64>,
    pub submits: Option<i64>,
    pub conversions: Option<i64>,
    pub profile_count: Option<i64>,
    pub open_rate: Option<f64>,
    pub click_rate: Option<f64>,
    pub conversion_rate: Option<f64>,
    pub revenue: Option<f64>,
}

impl EntityMetrics {
    fn counters(&self) -> [(&'static str, Option<i64>); 8] {
        [
            ("recipients", self.recipients),
            ("delivered", self.delivered),
            ("opens", self.opens),
            ("clicks", self.clicks),
            ("views", self.views),
            ("submits", self.submits),
            ("conversions", self.conversions),
            ("profile_count", self.profile_count),
        ]
    }

    fn ratios(&self) -> [(&'static str, Option<f64>); 4] {
        [
            ("open_rate", self.open_rate),
            ("click_rate", self.click_rate),
            ("conversion_rate", self.conversion_rate),
            ("revenue", self.revenue),
        ]
    }
}

/// One stored campaign, flow, form or segment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    /// Externally assigned identifier, unique per entity type
    pub id: String,

    /// Display name
    pub name: String,

    /// Upstream lifecycle status (`draft`, `live`, `sent`, ...)
    pub status: Option<String>,

    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub metrics: EntityMetrics,

    /// Attributes not promoted to columns
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl EntityRecord {
    /// Create a record with no metrics or metadata
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            status: None,
            created_at: None,
            updated_at: None,
            metrics: EntityMetrics::default(),
            metadata: serde_json::Value::Object(serde_json::Map::new()),
        }
    }

    /// Set lifecycle status
    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }

    /// Set lifecycle timestamps
    pub fn with_timestamps(
        mut self,
        created_at: Option<DateTime<Utc>>,
        updated_at: Option<DateTime<Utc>>,
    ) -> Self {
        self.created_at = created_at;
        self.updated_at = updated_at;
        self
    }

    /// Set metrics
    pub fn with_metrics(mut self, metrics: EntityMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    /// Check the record-level invariants
    pub fn validate(&self) -> Result<(), SyncError> {
        if self.id.trim().is_empty() {
            return Err(SyncError::Transform("record has an empty id".to_string()));
        }
        if self.name.trim().is_empty() {
            return Err(SyncError::Transform(format!(
                "record {} has an empty name",
                self.id
            )));
        }
        for (name, value) in self.metrics.counters() {
            if matches!(value, Some(v) if v < 0) {
                return Err(SyncError::Transform(format!(
                    "record {} has negative {}",
                    self.id, name
                )));
            }
        }
        for (name, value) in self.metrics.ratios() {
            if let Some(v) = value {
                if !v.is_finite() || v < 0.0 {
                    return Err(SyncError::Transform(format!(
                        "record {} has invalid {}: {}",
                        self.id, name, v
                    )));
                }
            }
        }
        if let (Some(created), Some(updated)) = (self.created_at, self.updated_at) {
            if updated < created {
                return Err(SyncError::Transform(format!(
                    "record {} was updated ({}) before it was created ({})",
                    self.id, updated, created
                )));
            }
        }
        Ok(())
    }
}

/// Closed time interval used for range queries and date filters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    /// Whole calendar days: from `start` 00:00:00.000 to `end` 23:59:59.999 UTC
    pub fn days(start: NaiveDate, end: NaiveDate) -> Self {
        let end_of_day = NaiveTime::from_hms_milli_opt(23, 59, 59, 999).unwrap_or(NaiveTime::MIN);
        Self {
            start: Utc.from_utc_datetime(&start.and_time(NaiveTime::MIN)),
            end: Utc.from_utc_datetime(&end.and_time(end_of_day)),
        }
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        at >= self.start && at <= self.end
    }
}
