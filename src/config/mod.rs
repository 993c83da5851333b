//! Configuration management for marketing-sync
//!
//! This module handles loading, parsing, and validating application configuration
//! from YAML files and environment variables.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::models::EntityType;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Config {
    /// External API configuration
    #[serde(default)]
    pub api: ApiConfig,

    /// Response cache configuration
    #[serde(default)]
    pub cache: CacheConfig,

    /// Database configuration
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Sync configuration
    #[serde(default)]
    pub sync: SyncConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::FileRead(format!("Failed to read config file: {}", e)))?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from a YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        // First, expand environment variables in the YAML string
        let expanded = expand_env_vars(yaml);
        serde_yaml::from_str(&expanded)
            .map_err(|e| ConfigError::Parse(format!("Failed to parse YAML: {}", e)))
    }

    /// Load configuration from environment variables with prefix MARKETING_SYNC_
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Config::default();
        config.apply_env()?;
        Ok(config)
    }

    /// Override fields from MARKETING_SYNC_* environment variables
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Ok(url) = std::env::var("MARKETING_SYNC_API_BASE_URL") {
            self.api.base_url = url;
        }
        if let Ok(key) = std::env::var("MARKETING_SYNC_API_KEY") {
            self.api.api_key = Some(key);
        }
        if let Ok(revision) = std::env::var("MARKETING_SYNC_API_REVISION") {
            self.api.revision = revision;
        }

        if let Ok(path) = std::env::var("MARKETING_SYNC_DATABASE_PATH") {
            self.database.path = path;
        }
        if let Some(max) = parse_env("MARKETING_SYNC_DATABASE_MAX_CONNECTIONS")? {
            self.database.max_connections = max;
        }
        if let Some(enabled) = parse_env("MARKETING_SYNC_CACHE_ENABLED")? {
            self.cache.enabled = enabled;
        }
        if let Some(interval) = parse_env("MARKETING_SYNC_SYNC_INTERVAL_SECS")? {
            self.sync.interval_secs = interval;
        }

        if let Ok(level) = std::env::var("MARKETING_SYNC_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(format) = std::env::var("MARKETING_SYNC_LOG_FORMAT") {
            self.logging.format = format;
        }

        Ok(())
    }

    /// Check cross-field constraints that serde defaults cannot express
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.api.api_key.as_deref() {
            Some(key) if !key.trim().is_empty() => {}
            _ => return Err(ConfigError::MissingRequired("api.api_key".to_string())),
        }

        if self.database.max_connections == 0 {
            return Err(ConfigError::InvalidValue(
                "database.max_connections must be at least 1".to_string(),
            ));
        }
        if self.database.min_connections > self.database.max_connections {
            return Err(ConfigError::InvalidValue(format!(
                "database.min_connections ({}) exceeds max_connections ({})",
                self.database.min_connections, self.database.max_connections
            )));
        }
        if !(self.database.high_water_mark > 0.0 && self.database.high_water_mark <= 1.0) {
            return Err(ConfigError::InvalidValue(format!(
                "database.high_water_mark must be in (0, 1], got {}",
                self.database.high_water_mark
            )));
        }

        for (name, retry) in [("api.retry", &self.api.retry), ("database.retry", &self.database.retry)] {
            if retry.backoff_multiplier < 1.0 {
                return Err(ConfigError::InvalidValue(format!(
                    "{}.backoff_multiplier must be >= 1.0, got {}",
                    name, retry.backoff_multiplier
                )));
            }
        }

        if self.api.rate_limit.max_concurrent == 0 {
            return Err(ConfigError::InvalidValue(
                "api.rate_limit.max_concurrent must be at least 1".to_string(),
            ));
        }

        if self.sync.entity_timeout_secs == 0 {
            return Err(ConfigError::InvalidValue(
                "sync.entity_timeout_secs must be at least 1".to_string(),
            ));
        }
        if self.sync.interval_secs == 0 {
            return Err(ConfigError::InvalidValue(
                "sync.interval_secs must be at least 1".to_string(),
            ));
        }

        if self.sync.entities.is_empty() {
            return Err(ConfigError::InvalidValue(
                "sync.entities must name at least one entity type".to_string(),
            ));
        }

        Ok(())
    }
}

/// External API configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApiConfig {
    /// Base URL of the upstream API, e.g. `https://a.klaviyo.com/api`
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Private API key
    pub api_key: Option<String>,

    /// Authorization scheme placed before the key
    #[serde(default = "default_auth_scheme")]
    pub auth_scheme: String,

    /// API revision date sent in the `revision` header
    #[serde(default = "default_revision")]
    pub revision: String,

    /// Accept header value
    #[serde(default = "default_accept")]
    pub accept: String,

    /// `page[size]` for listing requests
    #[serde(default = "default_page_size")]
    pub page_size: u32,

    /// Per-request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub timeout_secs: u64,

    /// Upper bound on pages followed for a single listing
    #[serde(default = "default_max_pages")]
    pub max_pages: usize,

    /// Message channel campaigns are listed for
    #[serde(default = "default_campaign_channel")]
    pub campaign_channel: String,

    /// Retry configuration
    #[serde(default)]
    pub retry: RetryConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key: None,
            auth_scheme: default_auth_scheme(),
            revision: default_revision(),
            accept: default_accept(),
            page_size: default_page_size(),
            timeout_secs: default_request_timeout(),
            max_pages: default_max_pages(),
            campaign_channel: default_campaign_channel(),
            retry: RetryConfig::default(),
            rate_limit: RateLimitConfig::default(),
        }
    }
}

fn default_base_url() -> String {
    "https://a.klaviyo.com/api".to_string()
}

fn default_auth_scheme() -> String {
    "Klaviyo-API-Key".to_string()
}

fn default_revision() -> String {
    "2024-10-15".to_string()
}

fn default_accept() -> String {
    "application/vnd.api+json".to_string()
}

fn default_page_size() -> u32 {
    50
}

fn default_request_timeout() -> u64 {
    30
}

fn default_max_pages() -> usize {
    500
}

fn default_campaign_channel() -> String {
    "email".to_string()
}

/// Retry configuration for transient failures
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of retry attempts after the first try
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Initial backoff duration in milliseconds
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,

    /// Maximum backoff duration in milliseconds
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,

    /// Backoff multiplier
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Whether to add jitter to backoff
    #[serde(default = "default_jitter")]
    pub jitter: bool,

    /// Upper bound on the random jitter in milliseconds
    #[serde(default = "default_max_jitter")]
    pub max_jitter_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: default_jitter(),
            max_jitter_ms: default_max_jitter(),
        }
    }
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_backoff() -> u64 {
    1000
}

fn default_max_backoff() -> u64 {
    30_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_jitter() -> bool {
    true
}

fn default_max_jitter() -> u64 {
    1000
}

/// Rate limiting configuration for the API client
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RateLimitConfig {
    /// Minimum interval between requests to the same host in milliseconds
    #[serde(default = "default_min_interval")]
    pub min_interval_ms: u64,

    /// Maximum number of concurrent requests
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    /// Wait time when rate limited without a Retry-After header (in seconds)
    #[serde(default = "default_rate_limit_wait")]
    pub rate_limit_wait_secs: u64,

    /// Remaining-call budget at or below which requests wait for the reset
    #[serde(default = "default_low_water_mark")]
    pub low_water_mark: u64,

    /// Upper bound on a tracker-imposed delay in seconds
    #[serde(default = "default_max_tracker_delay")]
    pub max_delay_secs: u64,

    /// Upper bound on jitter added to a tracker-imposed delay in milliseconds
    #[serde(default = "default_tracker_jitter")]
    pub jitter_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            min_interval_ms: default_min_interval(),
            max_concurrent: default_max_concurrent(),
            rate_limit_wait_secs: default_rate_limit_wait(),
            low_water_mark: default_low_water_mark(),
            max_delay_secs: default_max_tracker_delay(),
            jitter_ms: default_tracker_jitter(),
        }
    }
}

fn default_min_interval() -> u64 {
    0
}

fn default_max_concurrent() -> usize {
    4
}

fn default_rate_limit_wait() -> u64 {
    10
}

fn default_low_water_mark() -> u64 {
    1
}

fn default_max_tracker_delay() -> u64 {
    60
}

fn default_tracker_jitter() -> u64 {
    250
}

/// Response cache configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CacheConfig {
    /// Whether the reporting read path goes through the cache
    #[serde(default = "default_cache_enabled")]
    pub enabled: bool,

    /// Time-to-live for cached reads in seconds
    #[serde(default = "default_cache_ttl")]
    pub default_ttl_secs: u64,

    /// Maximum number of entries held at once
    #[serde(default = "default_cache_max_entries")]
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: default_cache_enabled(),
            default_ttl_secs: default_cache_ttl(),
            max_entries: default_cache_max_entries(),
        }
    }
}

fn default_cache_enabled() -> bool {
    true
}

fn default_cache_ttl() -> u64 {
    300 // 5 minutes
}

fn default_cache_max_entries() -> usize {
    10_000
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DatabaseConfig {
    /// Path to SQLite database file (`:memory:` for a private in-memory store)
    #[serde(default = "default_database_path")]
    pub path: String,

    /// Connections opened eagerly and kept through idle reaping
    #[serde(default = "default_min_connections")]
    pub min_connections: usize,

    /// Hard ceiling on open connections
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Idle connections above the minimum are closed after this many seconds
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    /// Per-statement timeout in milliseconds
    #[serde(default = "default_statement_timeout")]
    pub statement_timeout_ms: u64,

    /// How long an acquirer queues for a connection before failing
    #[serde(default = "default_acquire_timeout")]
    pub acquire_timeout_ms: u64,

    /// Utilization ratio above which a saturation warning is logged
    #[serde(default = "default_high_water_mark")]
    pub high_water_mark: f64,

    /// Pool health sampling interval in seconds
    #[serde(default = "default_health_check_interval")]
    pub health_check_interval_secs: u64,

    /// Retry configuration for transient database errors
    #[serde(default = "default_database_retry")]
    pub retry: RetryConfig,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
            min_connections: default_min_connections(),
            max_connections: default_max_connections(),
            idle_timeout_secs: default_idle_timeout(),
            statement_timeout_ms: default_statement_timeout(),
            acquire_timeout_ms: default_acquire_timeout(),
            high_water_mark: default_high_water_mark(),
            health_check_interval_secs: default_health_check_interval(),
            retry: default_database_retry(),
        }
    }
}

fn default_database_path() -> String {
    "data/marketing-sync.db".to_string()
}

fn default_min_connections() -> usize {
    1
}

fn default_max_connections() -> usize {
    8
}

fn default_idle_timeout() -> u64 {
    300
}

fn default_statement_timeout() -> u64 {
    30_000
}

fn default_acquire_timeout() -> u64 {
    10_000
}

fn default_high_water_mark() -> f64 {
    0.8
}

fn default_health_check_interval() -> u64 {
    30
}

fn default_database_retry() -> RetryConfig {
    RetryConfig {
        max_retries: 3,
        initial_backoff_ms: 50,
        max_backoff_ms: 2000,
        backoff_multiplier: 2.0,
        jitter: true,
        max_jitter_ms: 50,
    }
}

/// Sync configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncConfig {
    /// Entity types synchronized by `sync_all` and the scheduler
    #[serde(default = "default_entities")]
    pub entities: Vec<EntityType>,

    /// Use the last successful sync time as a lower bound by default
    #[serde(default = "default_incremental")]
    pub incremental: bool,

    /// Time budget for a single entity sync in seconds
    #[serde(default = "default_entity_timeout")]
    pub entity_timeout_secs: u64,

    /// Interval between scheduled syncs in seconds
    #[serde(default = "default_sync_interval")]
    pub interval_secs: u64,

    /// Upper bound on random jitter added to each scheduled run in seconds
    #[serde(default = "default_sync_jitter")]
    pub jitter_secs: u64,

    /// Delay before the first scheduled run in seconds
    #[serde(default = "default_initial_delay")]
    pub initial_delay_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            entities: default_entities(),
            incremental: default_incremental(),
            entity_timeout_secs: default_entity_timeout(),
            interval_secs: default_sync_interval(),
            jitter_secs: default_sync_jitter(),
            initial_delay_secs: default_initial_delay(),
        }
    }
}

fn default_entities() -> Vec<EntityType> {
    EntityType::ALL.to_vec()
}

fn default_incremental() -> bool {
    true
}

fn default_entity_timeout() -> u64 {
    600
}

fn default_sync_interval() -> u64 {
    3600 // 1 hour
}

fn default_sync_jitter() -> u64 {
    60
}

fn default_initial_delay() -> u64 {
    5
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (`json` or `pretty`)
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

/// Typed environment override; a value that does not parse is an error
fn parse_env<T: std::str::FromStr>(name: &str) -> Result<Option<T>, ConfigError> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Parse(format!("Invalid {}", name))),
        Err(_) => Ok(None),
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error, Clone, PartialEq)]
pub enum ConfigError {
    /// Error reading configuration file
    #[error("Failed to read configuration file: {0}")]
    FileRead(String),

    /// Error parsing configuration
    #[error("Failed to parse configuration: {0}")]
    Parse(String),

    /// Invalid configuration value
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),

    /// Missing required configuration
    #[error("Missing required configuration: {0}")]
    MissingRequired(String),
}

/// Expand environment variables in a string
///
/// Supports `${VAR_NAME}` syntax; unknown variables are left as written.
fn expand_env_vars(input: &str) -> String {
    let re = regex_lite::Regex::new(r"\$\{([^}]+)\}")
        .expect("Invalid regex pattern for environment variable expansion");

    re.replace_all(input, |caps: &regex_lite::Captures| {
        let var_name = &caps[1];
        std::env::var(var_name).unwrap_or_else(|_| caps[0].to_string())
    })
    .into_owned()
}
