//! Mapping of upstream resources to stored entity records
//!
//! Metrics may arrive as top-level attributes or inside a nested
//! `statistics`/`metrics`/`stats` object, as numbers or numeric strings.
//! Absent metrics stay `None`. Attributes that are not promoted to a column
//! are kept in the record's metadata.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tracing::warn;

use crate::client::Resource;
use crate::error::SyncError;
use crate::models::{EntityMetrics, EntityRecord, EntityType};

const METRIC_CONTAINERS: &[&str] = &["statistics", "metrics", "stats"];

const RECIPIENTS: &[&str] = &["recipients", "recipient_count"];
const DELIVERED: &[&str] = &["delivered", "delivered_count"];
const OPENS: &[&str] = &["opens", "opens_unique", "open_count"];
const CLICKS: &[&str] = &["clicks", "clicks_unique", "click_count"];
const VIEWS: &[&str] = &["views", "viewed_form", "view_count"];
const SUBMITS: &[&str] = &["submits", "submitted_form", "submit_count"];
const CONVERSIONS: &[&str] = &["conversions", "conversion_uniques", "conversion_count"];
const PROFILE_COUNT: &[&str] = &["profile_count"];
const OPEN_RATE: &[&str] = &["open_rate"];
const CLICK_RATE: &[&str] = &["click_rate"];
const CONVERSION_RATE: &[&str] = &["conversion_rate", "submit_rate"];
const REVENUE: &[&str] = &["revenue", "conversion_value"];

/// Records that passed validation plus the number dropped
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransformOutcome {
    pub records: Vec<EntityRecord>,
    pub skipped: u64,
}

/// Transform a page of resources, skipping the ones that fail
///
/// Each skip is logged at warn level with the offending id.
pub fn transform_resources(entity: EntityType, resources: Vec<Resource>) -> TransformOutcome {
    let mut outcome = TransformOutcome::default();

    for resource in resources {
        let id = resource.id.clone();
        match transform_resource(entity, resource) {
            Ok(record) => outcome.records.push(record),
            Err(e) => {
                warn!(entity = %entity, id = %id, error = %e, "Skipping invalid record");
                outcome.skipped += 1;
            }
        }
    }

    outcome
}

/// Transform and validate one resource
pub fn transform_resource(entity: EntityType, resource: Resource) -> Result<EntityRecord, SyncError> {
    let mut fields = Fields::new(resource.attributes);

    let name = match fields.top.remove("name") {
        Some(Value::String(name)) => name,
        _ => {
            return Err(SyncError::Transform(format!(
                "{} {} has no name",
                entity.resource_type(),
                resource.id
            )))
        }
    };

    let status = match fields.top.remove("status") {
        Some(Value::String(status)) => Some(status),
        _ => derived_status(&fields.top),
    };

    let created_at = fields.timestamp(entity.created_field())?;
    let updated_at = fields.timestamp(entity.updated_field())?;
    let metrics = fields.metrics()?;

    let mut metadata = fields.into_metadata();
    if !resource.relationships.is_empty() {
        metadata.insert(
            "relationships".to_string(),
            Value::Object(resource.relationships),
        );
    }

    let record = EntityRecord {
        id: resource.id,
        name,
        status,
        created_at,
        updated_at,
        metrics,
        metadata: Value::Object(metadata),
    };
    record.validate()?;
    Ok(record)
}

/// Status for resources that only report flags
fn derived_status(attributes: &Map<String, Value>) -> Option<String> {
    if let Some(Value::Bool(active)) = attributes.get("is_active") {
        return Some(if *active { "active" } else { "inactive" }.to_string());
    }
    if let Some(Value::Bool(true)) = attributes.get("archived") {
        return Some("archived".to_string());
    }
    None
}

/// Attribute bag being consumed into a record
struct Fields {
    top: Map<String, Value>,
    nested: Map<String, Value>,
}

impl Fields {
    fn new(mut attributes: Map<String, Value>) -> Self {
        let mut nested = Map::new();
        for container in METRIC_CONTAINERS {
            if matches!(attributes.get(*container), Some(Value::Object(_))) {
                if let Some(Value::Object(inner)) = attributes.remove(*container) {
                    nested.extend(inner);
                }
            }
        }
        Self {
            top: attributes,
            nested,
        }
    }

    /// Remove every alias from both levels, returning the first non-null
    /// value (top level wins)
    fn take(&mut self, aliases: &[&str]) -> Option<Value> {
        let mut found = None;
        for alias in aliases {
            let top = self.top.remove(*alias).filter(|v| !v.is_null());
            let nested = self.nested.remove(*alias).filter(|v| !v.is_null());
            if found.is_none() {
                found = top.or(nested);
            }
        }
        found
    }

    fn counter(&mut self, aliases: &[&str]) -> Result<Option<i64>, SyncError> {
        self.take(aliases)
            .map(|value| parse_counter(aliases[0], &value))
            .transpose()
    }

    fn ratio(&mut self, aliases: &[&str]) -> Result<Option<f64>, SyncError> {
        self.take(aliases)
            .map(|value| parse_ratio(aliases[0], &value))
            .transpose()
    }

    fn timestamp(&mut self, key: &str) -> Result<Option<DateTime<Utc>>, SyncError> {
        match self.top.remove(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(s)) => DateTime::parse_from_rfc3339(&s)
                .map(|dt| Some(dt.with_timezone(&Utc)))
                .map_err(|e| SyncError::Transform(format!("invalid {} {:?}: {}", key, s, e))),
            Some(other) => Err(SyncError::Transform(format!(
                "invalid {}: {}",
                key, other
            ))),
        }
    }

    fn metrics(&mut self) -> Result<EntityMetrics, SyncError> {
        Ok(EntityMetrics {
            recipients: self.counter(RECIPIENTS)?,
            delivered: self.counter(DELIVERED)?,
            opens: self.counter(OPENS)?,
            clicks: self.counter(CLICKS)?,
            views: self.counter(VIEWS)?,
            submits: self.counter(SUBMITS)?,
            conversions: self.counter(CONVERSIONS)?,
            profile_count: self.counter(PROFILE_COUNT)?,
            open_rate: self.ratio(OPEN_RATE)?,
            click_rate: self.ratio(CLICK_RATE)?,
            conversion_rate: self.ratio(CONVERSION_RATE)?,
            revenue: self.ratio(REVENUE)?,
        })
    }

    /// Whatever was not promoted to a column
    fn into_metadata(self) -> Map<String, Value> {
        let mut metadata = self.top;
        if !self.nested.is_empty() {
            metadata.insert("statistics".to_string(), Value::Object(self.nested));
        }
        metadata
    }
}

fn numeric_text(s: &str) -> String {
    s.trim().replace(',', "")
}

fn parse_counter(field: &str, value: &Value) -> Result<i64, SyncError> {
    let whole = |f: f64| (f.is_finite() && f.fract() == 0.0).then_some(f as i64);

    let parsed = match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().and_then(whole)),
        Value::String(s) => {
            let text = numeric_text(s);
            text.parse::<i64>()
                .ok()
                .or_else(|| text.parse::<f64>().ok().and_then(whole))
        }
        _ => None,
    };

    parsed.ok_or_else(|| SyncError::Transform(format!("{} is not a whole number: {}", field, value)))
}

fn parse_ratio(field: &str, value: &Value) -> Result<f64, SyncError> {
    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => numeric_text(s).parse::<f64>().ok(),
        _ => None,
    };

    parsed.ok_or_else(|| SyncError::Transform(format!("{} is not a number: {}", field, value)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn resource(entity: EntityType, id: &str, attributes: Value) -> Resource {
        Resource {
            id: id.to_string(),
            resource_type: entity.resource_type().to_string(),
            attributes: attributes.as_object().cloned().unwrap_or_default(),
            relationships: Map::new(),
        }
    }

    // Test 1: Nested statistics are flattened and numeric strings parsed
    #[test]
    fn test_flattens_nested_metrics() {
        let res = resource(
            EntityType::Campaigns,
            "c1",
            json!({
                "name": "Spring sale",
                "status": "Sent",
                "created_at": "2025-01-01T00:00:00Z",
                "updated_at": "2025-01-02T10:30:00+00:00",
                "statistics": {
                    "recipients": "1,200",
                    "opens_unique": 300,
                    "open_rate": "0.25",
                    "conversion_value": 99.5
                }
            }),
        );

        let record = transform_resource(EntityType::Campaigns, res).unwrap();
        assert_eq!(record.name, "Spring sale");
        assert_eq!(record.status.as_deref(), Some("Sent"));
        assert_eq!(
            record.updated_at,
            Some(Utc.with_ymd_and_hms(2025, 1, 2, 10, 30, 0).unwrap())
        );
        assert_eq!(record.metrics.recipients, Some(1200));
        assert_eq!(record.metrics.opens, Some(300));
        assert_eq!(record.metrics.open_rate, Some(0.25));
        assert_eq!(record.metrics.revenue, Some(99.5));
        assert_eq!(record.metadata, json!({}));
    }

    // Test 2: Missing metrics stay None rather than zero
    #[test]
    fn test_missing_metrics_are_none() {
        let res = resource(EntityType::Flows, "f1", json!({"name": "Welcome", "status": "live"}));

        let record = transform_resource(EntityType::Flows, res).unwrap();
        assert_eq!(record.metrics, EntityMetrics::default());
        assert_eq!(record.metrics.recipients, None);
    }

    // Test 3: Unpromoted attributes land in metadata
    #[test]
    fn test_extra_attributes_kept_in_metadata() {
        let res = resource(
            EntityType::Flows,
            "f1",
            json!({
                "name": "Welcome",
                "trigger_type": "List",
                "archived": false,
                "created": "2024-05-01T00:00:00Z",
                "updated": "2024-06-01T00:00:00Z",
                "stats": {"opens": 5, "bounce_rate": 0.01}
            }),
        );

        let record = transform_resource(EntityType::Flows, res).unwrap();
        assert_eq!(record.metrics.opens, Some(5));
        assert!(record.created_at.is_some());
        assert_eq!(
            record.metadata,
            json!({
                "trigger_type": "List",
                "archived": false,
                "statistics": {"bounce_rate": 0.01}
            })
        );
    }

    // Test 4: Segment status and profile count
    #[test]
    fn test_segment_fields() {
        let res = resource(
            EntityType::Segments,
            "s1",
            json!({"name": "VIP", "is_active": true, "profile_count": 42}),
        );

        let record = transform_resource(EntityType::Segments, res).unwrap();
        assert_eq!(record.status.as_deref(), Some("active"));
        assert_eq!(record.metrics.profile_count, Some(42));
    }

    // Test 5: Invalid records are rejected
    #[test]
    fn test_invalid_records_rejected() {
        let cases = [
            json!({"status": "draft"}),
            json!({"name": "neg", "recipients": -1}),
            json!({"name": "frac", "recipients": "12.5"}),
            json!({"name": "text", "clicks": "many"}),
            json!({"name": "ts", "created_at": "yesterday"}),
            json!({
                "name": "order",
                "created_at": "2025-02-01T00:00:00Z",
                "updated_at": "2025-01-01T00:00:00Z"
            }),
        ];

        for attrs in cases {
            let res = resource(EntityType::Forms, "x", attrs.clone());
            let result = transform_resource(EntityType::Forms, res);
            assert!(
                matches!(result, Err(SyncError::Transform(_))),
                "expected rejection for {}",
                attrs
            );
        }
    }

    // Test 6: Batch transform skips and counts bad records
    #[test]
    fn test_transform_resources_counts_skips() {
        let resources = vec![
            resource(EntityType::Forms, "ok1", json!({"name": "Popup", "views": "10"})),
            resource(EntityType::Forms, "bad", json!({"views": 3})),
            resource(EntityType::Forms, "ok2", json!({"name": "Footer"})),
        ];

        let outcome = transform_resources(EntityType::Forms, resources);
        assert_eq!(outcome.skipped, 1);
        let ids: Vec<&str> = outcome.records.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["ok1", "ok2"]);
        assert_eq!(outcome.records[0].metrics.views, Some(10));
    }

    // Test 7: Relationships are preserved in metadata
    #[test]
    fn test_relationships_in_metadata() {
        let mut res = resource(EntityType::Campaigns, "c1", json!({"name": "Launch"}));
        res.relationships.insert(
            "campaign-messages".to_string(),
            json!({"data": [{"type": "campaign-message", "id": "m1"}]}),
        );

        let record = transform_resource(EntityType::Campaigns, res).unwrap();
        assert_eq!(
            record.metadata["relationships"]["campaign-messages"]["data"][0]["id"],
            json!("m1")
        );
    }
}
