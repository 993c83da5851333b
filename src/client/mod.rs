//! Client for the upstream marketing API
//!
//! This module provides:
//! - Rate limit tracking from response headers
//! - JSON:API query construction
//! - Retry with exponential backoff
//! - The deduplicating, paging HTTP client
//! - Per-resource listing wrappers

pub mod http_client;
pub mod query;
pub mod rate_limit;
pub mod resources;
pub mod retry;

pub use http_client::{ApiClient, Collection};
pub use query::{format_timestamp, ApiQuery, Filter, FilterOp, FilterValue};
pub use rate_limit::{RateLimitState, RateLimitTracker};
pub use resources::{entity_query, EntitySource, FetchedEntities, Resource};
pub use retry::RetryManager;

#[cfg(test)]
pub use resources::MockEntitySource;
