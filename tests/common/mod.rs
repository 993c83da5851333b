//! Common test utilities and helpers for integration tests

#![allow(dead_code)]

use std::sync::Arc;

use serde_json::{json, Value};
use tempfile::TempDir;
use wiremock::ResponseTemplate;

use marketing_sync::client::ApiClient;
use marketing_sync::config::{ApiConfig, DatabaseConfig, RateLimitConfig, RetryConfig, SyncConfig};
use marketing_sync::database::SqliteRepository;
use marketing_sync::models::EntityType;
use marketing_sync::sync::SyncOrchestrator;

/// API configuration pointing at a mock server, with no backoff delays
pub fn api_config(server_uri: &str, max_retries: u32) -> ApiConfig {
    ApiConfig {
        base_url: format!("{}/api", server_uri),
        api_key: Some("pk_test".to_string()),
        max_pages: 10,
        retry: RetryConfig {
            max_retries,
            initial_backoff_ms: 0,
            max_backoff_ms: 0,
            backoff_multiplier: 2.0,
            jitter: false,
            max_jitter_ms: 0,
        },
        rate_limit: RateLimitConfig {
            min_interval_ms: 0,
            max_concurrent: 4,
            rate_limit_wait_secs: 0,
            low_water_mark: 0,
            max_delay_secs: 2,
            jitter_ms: 0,
        },
        ..ApiConfig::default()
    }
}

/// Create a client against a mock server
pub fn test_client(server_uri: &str, max_retries: u32) -> ApiClient {
    ApiClient::new(api_config(server_uri, max_retries)).expect("Failed to create API client")
}

/// File-backed database configuration inside `dir`
pub fn database_config(dir: &TempDir, max_connections: usize) -> DatabaseConfig {
    DatabaseConfig {
        path: dir.path().join("sync.db").to_string_lossy().into_owned(),
        min_connections: 1,
        max_connections,
        acquire_timeout_ms: 5_000,
        ..DatabaseConfig::default()
    }
}

/// Open a repository on a fresh file in `dir`
pub async fn create_test_repository(dir: &TempDir) -> Arc<SqliteRepository> {
    Arc::new(
        SqliteRepository::new(&database_config(dir, 4))
            .await
            .expect("Failed to create test database"),
    )
}

/// Orchestrator over a real client and a file-backed repository
pub async fn create_test_orchestrator(
    server_uri: &str,
    repository: Arc<SqliteRepository>,
    max_retries: u32,
) -> SyncOrchestrator {
    let orchestrator = SyncOrchestrator::new(
        repository,
        Arc::new(test_client(server_uri, max_retries)),
        SyncConfig {
            entities: EntityType::ALL.to_vec(),
            incremental: false,
            entity_timeout_secs: 30,
            ..SyncConfig::default()
        },
    );
    orchestrator
        .initialize()
        .await
        .expect("Failed to initialize sync status");
    orchestrator
}

/// 200 response with a JSON:API body
pub fn json_response(body: Value) -> ResponseTemplate {
    ResponseTemplate::new(200)
        .insert_header("content-type", "application/vnd.api+json")
        .set_body_json(body)
}

/// Single-page listing body
pub fn listing(resources: Vec<Value>) -> Value {
    json!({ "data": resources, "links": { "next": null } })
}

/// Resource object with the entity's own timestamp attribute names
pub fn resource(entity: EntityType, id: &str, name: &str, updated: &str) -> Value {
    let mut attributes = serde_json::Map::new();
    attributes.insert("name".to_string(), json!(name));
    attributes.insert("status".to_string(), json!("live"));
    attributes.insert(
        entity.created_field().to_string(),
        json!("2025-01-01T00:00:00Z"),
    );
    attributes.insert(entity.updated_field().to_string(), json!(updated));

    json!({
        "id": id,
        "type": entity.resource_type(),
        "attributes": attributes,
    })
}
