//! Sync orchestrator
//!
//! Drives one entity type through `syncing` to `synced` or `failed`:
//! fetch every page, transform, batch-upsert, record the outcome. Failures
//! never escape as errors; every call returns a structured result.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use super::reporting::STATUS_CACHE_KEY;
use super::transform::transform_resources;
use crate::cache::ResponseCache;
use crate::client::EntitySource;
use crate::config::SyncConfig;
use crate::database::Repository;
use crate::error::{DbError, SyncError};
use crate::models::{EntitySyncResult, EntityType, SyncAllResult, SyncOptions, SyncStatus};

/// Error message written to status rows left in `syncing` by a previous run
pub const INTERRUPTED_MESSAGE: &str = "Sync interrupted before completion";

/// Entity types with a sync in progress
#[derive(Default)]
struct RunningSet(Mutex<HashSet<EntityType>>);

impl RunningSet {
    fn lock(&self) -> MutexGuard<'_, HashSet<EntityType>> {
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Marks an entity as running until dropped
struct RunningGuard {
    running: Arc<RunningSet>,
    entity: EntityType,
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.running.lock().remove(&self.entity);
    }
}

/// Coordinates fetching, transforming and storing entity data
#[derive(Clone)]
pub struct SyncOrchestrator {
    repository: Arc<dyn Repository>,
    source: Arc<dyn EntitySource>,
    cache: Option<Arc<dyn ResponseCache>>,
    config: SyncConfig,
    running: Arc<RunningSet>,
}

impl SyncOrchestrator {
    pub fn new(
        repository: Arc<dyn Repository>,
        source: Arc<dyn EntitySource>,
        config: SyncConfig,
    ) -> Self {
        Self {
            repository,
            source,
            cache: None,
            config,
            running: Arc::new(RunningSet::default()),
        }
    }

    /// Invalidate this cache's entries for an entity after it syncs
    pub fn with_cache(mut self, cache: Arc<dyn ResponseCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Options implied by the configuration
    pub fn default_options(&self) -> SyncOptions {
        SyncOptions {
            force: false,
            incremental: self.config.incremental,
        }
    }

    /// Bootstrap status rows and recover from a crashed run
    ///
    /// Creates `not_synced` rows for entity types that have none and marks
    /// rows still `syncing` as failed.
    pub async fn initialize(&self) -> Result<(), DbError> {
        let created = self.repository.init_sync_statuses(&EntityType::ALL).await?;
        let interrupted = self.repository.reset_interrupted(INTERRUPTED_MESSAGE).await?;

        if interrupted > 0 {
            warn!(interrupted, "Marked interrupted syncs as failed");
        }
        info!(created, "Sync status initialized");
        Ok(())
    }

    pub fn is_running(&self, entity: EntityType) -> bool {
        self.running.lock().contains(&entity)
    }

    fn try_begin(&self, entity: EntityType) -> Option<RunningGuard> {
        let mut running = self.running.lock();
        if !running.insert(entity) {
            return None;
        }
        Some(RunningGuard {
            running: self.running.clone(),
            entity,
        })
    }

    /// Sync one entity type
    ///
    /// Refused without touching the status row when a sync of the same
    /// entity type is already running.
    pub async fn sync_entity(&self, entity: EntityType, options: SyncOptions) -> EntitySyncResult {
        let Some(_guard) = self.try_begin(entity) else {
            let err = SyncError::AlreadyRunning(entity);
            warn!(entity = %entity, "Sync refused, already running");
            return EntitySyncResult::failure(entity, err.to_string());
        };

        let started_at = Utc::now();
        info!(entity = %entity, force = options.force, incremental = options.incremental, "Starting sync");

        let previous = match self.repository.get_sync_status(entity).await {
            Ok(status) => status.unwrap_or_else(|| SyncStatus::new(entity)),
            Err(e) => {
                error!(entity = %entity, error = %e, "Failed to read sync status");
                return EntitySyncResult::failure(entity, SyncError::from(e).to_string());
            }
        };

        if let Err(e) = self
            .repository
            .update_sync_status(&previous.clone().syncing())
            .await
        {
            error!(entity = %entity, error = %e, "Failed to mark sync as running");
            return EntitySyncResult::failure(entity, SyncError::from(e).to_string());
        }

        let since = if options.incremental && !options.force {
            previous.last_sync_at
        } else {
            None
        };

        let timeout_secs = self.config.entity_timeout_secs;
        let outcome = tokio::time::timeout(
            Duration::from_secs(timeout_secs),
            self.fetch_and_store(entity, since),
        )
        .await
        .unwrap_or(Err(SyncError::Timeout(timeout_secs)));

        let result = match outcome {
            Ok((count, skipped)) => {
                match self
                    .repository
                    .update_sync_status(&previous.synced(count, started_at))
                    .await
                {
                    Ok(()) => {
                        info!(entity = %entity, count, skipped, "Sync completed");
                        self.invalidate(entity).await;
                        EntitySyncResult::success(entity, count, skipped)
                    }
                    Err(e) => {
                        error!(entity = %entity, error = %e, "Failed to record sync completion");
                        EntitySyncResult::failure(entity, SyncError::from(e).to_string())
                    }
                }
            }
            Err(e) => {
                let message = e.to_string();
                error!(entity = %entity, error = %message, "Sync failed");
                if let Err(db_err) = self
                    .repository
                    .update_sync_status(&previous.failed(message.clone()))
                    .await
                {
                    error!(entity = %entity, error = %db_err, "Failed to record sync failure");
                }
                EntitySyncResult::failure(entity, message)
            }
        };

        self.invalidate_status().await;
        result
    }

    /// Fetch, transform and write; returns (written, skipped)
    async fn fetch_and_store(
        &self,
        entity: EntityType,
        since: Option<DateTime<Utc>>,
    ) -> Result<(u64, u64), SyncError> {
        let fetched = self.source.fetch_entities(entity, since).await?;
        let received = fetched.resources.len();

        let outcome = transform_resources(entity, fetched.resources);
        let skipped = fetched.rejected + outcome.skipped;

        if outcome.records.is_empty() {
            debug!(entity = %entity, received, skipped, "Nothing to write");
            return Ok((0, skipped));
        }

        let written = self
            .repository
            .upsert_records(entity, &outcome.records)
            .await?;
        debug!(entity = %entity, received, written, skipped, "Batch written");
        Ok((written, skipped))
    }

    /// Sync several entity types concurrently
    ///
    /// Every requested entity gets a result; one entity failing does not
    /// stop the others.
    pub async fn sync_all(&self, entities: &[EntityType], options: SyncOptions) -> SyncAllResult {
        let mut requested = entities.to_vec();
        requested.sort();
        requested.dedup();

        let handles: Vec<_> = requested
            .into_iter()
            .map(|entity| {
                let orchestrator = self.clone();
                let handle =
                    tokio::spawn(async move { orchestrator.sync_entity(entity, options).await });
                (entity, handle)
            })
            .collect();

        let mut result = SyncAllResult {
            success: true,
            ..Default::default()
        };

        for (entity, handle) in handles {
            let entity_result = match handle.await {
                Ok(r) => r,
                Err(e) => {
                    error!(entity = %entity, error = %e, "Sync task aborted");
                    let message = format!("Sync task aborted: {}", e);
                    self.record_abort(entity, &message).await;
                    EntitySyncResult::failure(entity, message)
                }
            };

            if !entity_result.success {
                result.success = false;
                result
                    .errors
                    .push(format!("{}: {}", entity, entity_result.message));
            }
            result.entity_results.insert(entity, entity_result);
        }

        info!(
            success = result.success,
            entities = result.entity_results.len(),
            errors = result.errors.len(),
            "Sync run finished"
        );
        result
    }

    /// Sync the configured entity types with the configured options
    pub async fn sync_configured(&self) -> SyncAllResult {
        let entities = self.config.entities.clone();
        self.sync_all(&entities, self.default_options()).await
    }

    /// Status row fix-up for a task that panicked mid-sync
    async fn record_abort(&self, entity: EntityType, message: &str) {
        let status = match self.repository.get_sync_status(entity).await {
            Ok(status) => status.unwrap_or_else(|| SyncStatus::new(entity)),
            Err(e) => {
                error!(entity = %entity, error = %e, "Failed to read sync status");
                return;
            }
        };
        if let Err(e) = self
            .repository
            .update_sync_status(&status.failed(message))
            .await
        {
            error!(entity = %entity, error = %e, "Failed to record sync failure");
        }
    }

    async fn invalidate(&self, entity: EntityType) {
        let Some(cache) = &self.cache else {
            return;
        };
        match cache.delete_pattern(&entity.cache_pattern()).await {
            Ok(removed) => debug!(entity = %entity, removed, "Invalidated cached reads"),
            Err(e) => warn!(entity = %entity, error = %e, "Cache invalidation failed"),
        }
    }

    async fn invalidate_status(&self) {
        if let Some(cache) = &self.cache {
            if let Err(e) = cache.delete(STATUS_CACHE_KEY).await {
                warn!(error = %e, "Cache invalidation failed");
            }
        }
    }
}
