//! Data synchronization
//!
//! This module provides:
//! - [`transform`]: upstream resources to stored entity records
//! - [`orchestrator`]: per-entity and multi-entity sync with status bookkeeping
//! - [`reporting`]: cached read path over the stored data
//! - [`scheduler`]: periodic background sync with a manual trigger
//!
//! # Example
//!
//! ```ignore
//! use marketing_sync::sync::SyncOrchestrator;
//!
//! let orchestrator = SyncOrchestrator::new(repository, client, config.sync.clone());
//! orchestrator.initialize().await?;
//!
//! let result = orchestrator
//!     .sync_all(&[EntityType::Campaigns, EntityType::Flows], SyncOptions::default())
//!     .await;
//! ```

pub mod orchestrator;
pub mod reporting;
pub mod scheduler;
pub mod transform;

pub use orchestrator::{SyncOrchestrator, INTERRUPTED_MESSAGE};
pub use reporting::{ReportingService, STATUS_CACHE_KEY};
pub use scheduler::{ManualSyncHandle, SchedulerStatus, SyncScheduler, SyncTarget};
pub use transform::{transform_resource, transform_resources, TransformOutcome};
