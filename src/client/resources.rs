//! Per-resource listing wrappers
//!
//! Each entity type has its own sparse fieldset, sort and update-timestamp
//! filter. Raw JSON:API objects are checked against [`Resource`] here so that
//! untyped payloads never travel past the client.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use super::http_client::{ApiClient, Collection};
use super::query::{ApiQuery, FilterOp};
use crate::error::ApiError;
use crate::models::EntityType;

/// A validated JSON:API resource object
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Resource {
    pub id: String,

    #[serde(rename = "type")]
    pub resource_type: String,

    #[serde(default)]
    pub attributes: Map<String, Value>,

    #[serde(default)]
    pub relationships: Map<String, Value>,
}

impl Resource {
    /// Ids of related objects under `relationships.<name>.data`
    pub fn related_ids(&self, name: &str) -> Vec<&str> {
        match self.relationships.get(name).and_then(|r| r.get("data")) {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|i| i.get("id").and_then(Value::as_str))
                .collect(),
            Some(item @ Value::Object(_)) => {
                item.get("id").and_then(Value::as_str).into_iter().collect()
            }
            _ => Vec::new(),
        }
    }
}

/// Validated resources of one listing
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchedEntities {
    pub resources: Vec<Resource>,

    /// Objects dropped because they failed the schema check
    pub rejected: u64,
}

/// Paged fetch of entity listings
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EntitySource: Send + Sync {
    /// Fetch every record of `entity`, optionally only those updated at or
    /// after `since`
    async fn fetch_entities(
        &self,
        entity: EntityType,
        since: Option<DateTime<Utc>>,
    ) -> Result<FetchedEntities, ApiError>;
}

/// Query for one entity listing
pub fn entity_query(
    entity: EntityType,
    since: Option<DateTime<Utc>>,
    page_size: u32,
    campaign_channel: &str,
) -> ApiQuery {
    let resource_type = entity.resource_type();
    let mut query = match entity {
        EntityType::Campaigns => ApiQuery::new()
            .filter("messages.channel", FilterOp::Equals, campaign_channel)
            .include("campaign-messages")
            .fields(
                resource_type,
                ["name", "status", "archived", "send_time", "created_at", "updated_at"],
            )
            .fields("campaign-message", ["label", "channel", "content"]),
        EntityType::Flows => ApiQuery::new().fields(
            resource_type,
            ["name", "status", "archived", "trigger_type", "created", "updated"],
        ),
        EntityType::Forms => ApiQuery::new().fields(
            resource_type,
            ["name", "status", "ab_test", "created_at", "updated_at"],
        ),
        EntityType::Segments => ApiQuery::new()
            .fields(
                resource_type,
                ["name", "is_active", "is_processing", "created", "updated", "profile_count"],
            )
            .additional_fields(resource_type, ["profile_count"]),
    };

    if let Some(since) = since {
        query = query.since(entity.updated_field(), since);
    }
    // campaigns listing does not accept page[size]
    if entity != EntityType::Campaigns {
        query = query.page_size(page_size);
    }
    query.sort(entity.updated_field())
}

impl ApiClient {
    pub async fn campaigns(&self, since: Option<DateTime<Utc>>) -> Result<FetchedEntities, ApiError> {
        self.fetch_entity(EntityType::Campaigns, since).await
    }

    pub async fn flows(&self, since: Option<DateTime<Utc>>) -> Result<FetchedEntities, ApiError> {
        self.fetch_entity(EntityType::Flows, since).await
    }

    pub async fn forms(&self, since: Option<DateTime<Utc>>) -> Result<FetchedEntities, ApiError> {
        self.fetch_entity(EntityType::Forms, since).await
    }

    pub async fn segments(&self, since: Option<DateTime<Utc>>) -> Result<FetchedEntities, ApiError> {
        self.fetch_entity(EntityType::Segments, since).await
    }

    async fn fetch_entity(
        &self,
        entity: EntityType,
        since: Option<DateTime<Utc>>,
    ) -> Result<FetchedEntities, ApiError> {
        let config = self.config();
        let query = entity_query(entity, since, config.page_size, &config.campaign_channel);
        let collection = self.fetch_all(&entity.path(), &query).await?;
        Ok(validate_collection(entity, collection))
    }
}

#[async_trait]
impl EntitySource for ApiClient {
    async fn fetch_entities(
        &self,
        entity: EntityType,
        since: Option<DateTime<Utc>>,
    ) -> Result<FetchedEntities, ApiError> {
        self.fetch_entity(entity, since).await
    }
}

/// Schema-check every primary object and fold included campaign messages in
fn validate_collection(entity: EntityType, collection: Collection) -> FetchedEntities {
    let expected_type = entity.resource_type();
    let mut fetched = FetchedEntities::default();

    for item in collection.data {
        match serde_json::from_value::<Resource>(item) {
            Ok(resource) if resource.resource_type == expected_type => {
                fetched.resources.push(resource)
            }
            Ok(resource) => {
                warn!(
                    entity = %entity,
                    id = %resource.id,
                    resource_type = %resource.resource_type,
                    "Skipping resource of unexpected type"
                );
                fetched.rejected += 1;
            }
            Err(e) => {
                warn!(entity = %entity, error = %e, "Skipping malformed resource");
                fetched.rejected += 1;
            }
        }
    }

    if entity == EntityType::Campaigns && !collection.included.is_empty() {
        attach_campaign_messages(&mut fetched.resources, &collection.included);
    }

    debug!(
        entity = %entity,
        accepted = fetched.resources.len(),
        rejected = fetched.rejected,
        "Validated listing"
    );
    fetched
}

/// Copy related campaign-message attributes into `attributes.campaign_messages`
fn attach_campaign_messages(campaigns: &mut [Resource], included: &[Value]) {
    let messages: HashMap<&str, &Value> = included
        .iter()
        .filter(|v| v.get("type").and_then(Value::as_str) == Some("campaign-message"))
        .filter_map(|v| {
            let id = v.get("id").and_then(Value::as_str)?;
            Some((id, v.get("attributes").unwrap_or(&Value::Null)))
        })
        .collect();

    for campaign in campaigns.iter_mut() {
        let attached: Vec<Value> = campaign
            .related_ids("campaign-messages")
            .into_iter()
            .filter_map(|id| messages.get(id).map(|attrs| (*attrs).clone()))
            .collect();
        if !attached.is_empty() {
            campaign
                .attributes
                .insert("campaign_messages".to_string(), Value::Array(attached));
        }
    }
}
