//! Application error types for marketing-sync
//!
//! This module defines the error taxonomy shared by the API client, the
//! persistence gateway, the response cache and the sync orchestrator.
//! All error types use `thiserror` for ergonomic error handling.

use std::time::Duration;

use thiserror::Error;

use crate::models::EntityType;

/// Errors raised by the external API client
///
/// `Clone` so that a single deduplicated request can hand the same error to
/// every caller waiting on it.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ApiError {
    /// Network timeout
    #[error("Network timeout")]
    NetworkTimeout,

    /// Connection refused
    #[error("Connection refused")]
    ConnectionRefused,

    /// Generic network error
    #[error("Network error: {0}")]
    Network(String),

    /// Rate limited by upstream
    #[error("Rate limited, retry after {0} seconds")]
    RateLimited(u64),

    /// Upstream 5xx
    #[error("Server error: HTTP {0}")]
    ServerError(u16),

    /// Upstream 4xx other than 401/403/404/429
    #[error("Client error: HTTP {status}: {body}")]
    ClientError { status: u16, body: String },

    /// Resource not found
    #[error("Resource not found")]
    NotFound,

    /// Credentials rejected
    #[error("Unauthorized")]
    Unauthorized,

    /// Body was not JSON on an endpoint expected to return JSON
    #[error("Expected JSON response but got '{content_type}': {excerpt}")]
    NonJsonResponse {
        content_type: String,
        excerpt: String,
    },

    /// JSON body that could not be parsed or has the wrong shape
    #[error("Invalid data: {0}")]
    InvalidData(String),

    /// Malformed caller input
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

/// Database-related errors
#[derive(Debug, Error)]
pub enum DbError {
    /// SQLite error
    #[error("Database error: {0}")]
    Sqlite(rusqlite::Error),

    /// The database could not be opened
    #[error("Failed to open database: {0}")]
    Open(String),

    /// The connection's background worker has shut down
    #[error("Database connection closed")]
    ConnectionClosed,

    /// No pooled connection became available in time
    #[error("Timed out after {waited_ms}ms waiting for a pooled connection")]
    PoolTimeout { waited_ms: u64 },

    /// The pool has been closed
    #[error("Connection pool is closed")]
    PoolClosed,

    /// A statement exceeded its timeout and was interrupted
    #[error("Statement timed out after {timeout_ms}ms")]
    StatementTimeout { timeout_ms: u64 },

    /// Migration error
    #[error("Migration error: {0}")]
    Migration(String),

    /// Stored data could not be decoded
    #[error("Invalid stored data: {0}")]
    InvalidData(String),
}

impl From<rusqlite::Error> for DbError {
    fn from(err: rusqlite::Error) -> Self {
        match err {
            rusqlite::Error::FromSqlConversionFailure(column, _, cause) => {
                DbError::InvalidData(format!("column {}: {}", column, cause))
            }
            other => DbError::Sqlite(other),
        }
    }
}

impl From<tokio_rusqlite::Error> for DbError {
    fn from(err: tokio_rusqlite::Error) -> Self {
        match err {
            tokio_rusqlite::Error::Rusqlite(e) => DbError::from(e),
            tokio_rusqlite::Error::ConnectionClosed => DbError::ConnectionClosed,
            other => DbError::InvalidData(other.to_string()),
        }
    }
}

/// Cache-related errors
#[derive(Debug, Error, Clone, PartialEq)]
pub enum CacheError {
    /// Serialization error
    #[error("Cache serialization error: {0}")]
    Serialization(String),

    /// Invalidation pattern could not be compiled
    #[error("Invalid cache key pattern: {0}")]
    InvalidPattern(String),
}

/// Synchronization-related errors
#[derive(Debug, Error)]
pub enum SyncError {
    /// Upstream fetch failed
    #[error("API error: {0}")]
    Api(#[from] ApiError),

    /// Persistence failed
    #[error("Database error: {0}")]
    Database(#[from] DbError),

    /// External record could not be mapped to a local row
    #[error("Transform error: {0}")]
    Transform(String),

    /// A sync for this entity type is already running
    #[error("Sync already in progress for {0}")]
    AlreadyRunning(EntityType),

    /// Entity type name not recognized
    #[error("Unknown entity type: {0}")]
    UnknownEntity(String),

    /// Entity sync exceeded its time budget
    #[error("Sync timed out after {0} seconds")]
    Timeout(u64),

    /// Manual trigger sent while the scheduler is not running
    #[error("Sync scheduler is not running")]
    SchedulerUnavailable,
}

/// Application-level error type
///
/// Aggregates the domain-specific error types for the binary.
#[derive(Debug, Error)]
pub enum AppError {
    /// API error
    #[error("API error: {0}")]
    Api(#[from] ApiError),

    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] DbError),

    /// Cache error
    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    /// Sync error
    #[error("Sync error: {0}")]
    Sync(#[from] SyncError),
}

/// Trait for determining if an error is retryable
pub trait RetryableError {
    /// Returns true if the error is retryable
    fn is_retryable(&self) -> bool;

    /// Minimum wait the server asked for before the next attempt
    fn retry_after(&self) -> Option<Duration> {
        None
    }
}

impl RetryableError for ApiError {
    fn is_retryable(&self) -> bool {
        match self {
            // Retryable errors
            ApiError::NetworkTimeout => true,
            ApiError::ConnectionRefused => true,
            ApiError::Network(_) => true,
            ApiError::RateLimited(_) => true,
            ApiError::ServerError(code) if *code >= 500 => true,
            ApiError::NonJsonResponse { .. } => true,

            // Non-retryable errors
            ApiError::ServerError(_) => false,
            ApiError::ClientError { .. } => false,
            ApiError::NotFound => false,
            ApiError::Unauthorized => false,
            ApiError::InvalidData(_) => false,
            ApiError::InvalidRequest(_) => false,
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            ApiError::RateLimited(secs) => Some(Duration::from_secs(*secs)),
            _ => None,
        }
    }
}

impl RetryableError for DbError {
    fn is_retryable(&self) -> bool {
        match self {
            DbError::Sqlite(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            DbError::ConnectionClosed => true,
            DbError::PoolTimeout { .. } => true,
            _ => false,
        }
    }
}
