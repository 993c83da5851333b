//! Domain models for marketing-sync
//!
//! This module contains the core domain models used throughout the application.

pub mod entity;
pub mod sync_status;

// Re-export commonly used types
pub use entity::{EntityMetrics, EntityRecord, EntityType, TimeRange};
pub use sync_status::{EntitySyncResult, SyncAllResult, SyncOptions, SyncStatus, SyncStatusValue};
