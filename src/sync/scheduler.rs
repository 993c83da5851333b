//! Periodic sync scheduler
//!
//! Runs `sync_all` over the configured entity types after an initial delay
//! and then every `interval_secs`, each run pushed back by a random jitter so
//! that several instances do not hit the upstream API in lockstep. Manual
//! syncs are accepted through a [`ManualSyncHandle`].

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use tokio::sync::{broadcast, mpsc, oneshot, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::orchestrator::SyncOrchestrator;
use crate::error::SyncError;
use crate::models::{EntitySyncResult, EntityType, SyncAllResult, SyncOptions};

/// What the scheduler has done so far
#[derive(Debug, Clone, Default)]
pub struct SchedulerStatus {
    /// Completed runs, scheduled and manual
    pub runs: u64,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_result: Option<SyncAllResult>,
    /// Estimated start of the next scheduled run
    pub next_run_at: Option<DateTime<Utc>>,
}

/// Target of a manual sync
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncTarget {
    Entity(EntityType),
    All,
}

struct ManualSyncRequest {
    target: SyncTarget,
    options: SyncOptions,
    response: oneshot::Sender<SyncAllResult>,
}

/// Background scheduler for the sync orchestrator
pub struct SyncScheduler {
    orchestrator: SyncOrchestrator,
    status: Arc<RwLock<SchedulerStatus>>,
    shutdown_rx: broadcast::Receiver<()>,
    manual_sync_rx: mpsc::Receiver<ManualSyncRequest>,
    manual_sync_tx: mpsc::Sender<ManualSyncRequest>,
}

impl SyncScheduler {
    pub fn new(orchestrator: SyncOrchestrator, shutdown_rx: broadcast::Receiver<()>) -> Self {
        let (manual_sync_tx, manual_sync_rx) = mpsc::channel(32);

        Self {
            orchestrator,
            status: Arc::new(RwLock::new(SchedulerStatus::default())),
            shutdown_rx,
            manual_sync_rx,
            manual_sync_tx,
        }
    }

    /// Get a handle for triggering manual syncs
    pub fn manual_sync_handle(&self) -> ManualSyncHandle {
        ManualSyncHandle {
            tx: self.manual_sync_tx.clone(),
        }
    }

    /// Shared view of the scheduler status, readable while it runs
    pub fn status_handle(&self) -> Arc<RwLock<SchedulerStatus>> {
        self.status.clone()
    }

    /// Run until the shutdown signal arrives
    ///
    /// A sync in progress is finished before shutdown is observed.
    pub async fn run(mut self) {
        let config = self.orchestrator.config().clone();
        let interval = Duration::from_secs(config.interval_secs);

        info!(
            entities = ?config.entities,
            interval_secs = config.interval_secs,
            initial_delay_secs = config.initial_delay_secs,
            "Starting sync scheduler"
        );

        let mut next_run = Instant::now() + Duration::from_secs(config.initial_delay_secs);
        self.set_next_run(next_run).await;

        loop {
            tokio::select! {
                _ = self.shutdown_rx.recv() => {
                    info!("Shutdown signal received, stopping sync scheduler");
                    break;
                }
                Some(request) = self.manual_sync_rx.recv() => {
                    self.handle_manual_sync(request).await;
                }
                _ = tokio::time::sleep_until(next_run) => {
                    info!("Performing scheduled sync");
                    let result = self.orchestrator.sync_configured().await;
                    self.record(result).await;

                    let jitter = jitter(config.jitter_secs);
                    next_run = Instant::now() + interval + jitter;
                    self.set_next_run(next_run).await;
                    debug!(
                        interval_secs = config.interval_secs,
                        jitter_secs = jitter.as_secs(),
                        "Scheduled next sync"
                    );
                }
            }
        }

        info!("Sync scheduler stopped");
    }

    async fn handle_manual_sync(&self, request: ManualSyncRequest) {
        info!(target = ?request.target, force = request.options.force, "Manual sync triggered");

        let result = match request.target {
            SyncTarget::Entity(entity) => {
                self.orchestrator
                    .sync_all(&[entity], request.options)
                    .await
            }
            SyncTarget::All => {
                let entities = self.orchestrator.config().entities.clone();
                self.orchestrator.sync_all(&entities, request.options).await
            }
        };

        self.record(result.clone()).await;
        if request.response.send(result).is_err() {
            warn!("Manual sync requester went away before the result");
        }
    }

    async fn record(&self, result: SyncAllResult) {
        let mut status = self.status.write().await;
        status.runs += 1;
        status.last_run_at = Some(Utc::now());
        status.last_result = Some(result);
    }

    async fn set_next_run(&self, at: Instant) {
        let wait = at.saturating_duration_since(Instant::now());
        let estimate = chrono::Duration::from_std(wait)
            .ok()
            .map(|d| Utc::now() + d);
        self.status.write().await.next_run_at = estimate;
    }
}

fn jitter(max_secs: u64) -> Duration {
    if max_secs == 0 {
        return Duration::ZERO;
    }
    Duration::from_secs(rand::thread_rng().gen_range(0..max_secs))
}

/// Handle for triggering manual syncs
#[derive(Clone)]
pub struct ManualSyncHandle {
    tx: mpsc::Sender<ManualSyncRequest>,
}

impl ManualSyncHandle {
    async fn trigger(
        &self,
        target: SyncTarget,
        options: SyncOptions,
    ) -> Result<SyncAllResult, SyncError> {
        let (response_tx, response_rx) = oneshot::channel();

        self.tx
            .send(ManualSyncRequest {
                target,
                options,
                response: response_tx,
            })
            .await
            .map_err(|_| SyncError::SchedulerUnavailable)?;

        response_rx
            .await
            .map_err(|_| SyncError::SchedulerUnavailable)
    }

    /// Sync one entity type now
    pub async fn trigger_entity(
        &self,
        entity: EntityType,
        options: SyncOptions,
    ) -> Result<EntitySyncResult, SyncError> {
        let mut result = self.trigger(SyncTarget::Entity(entity), options).await?;
        Ok(result
            .entity_results
            .remove(&entity)
            .unwrap_or_else(|| EntitySyncResult::failure(entity, "No result reported")))
    }

    /// Sync every configured entity type now
    pub async fn trigger_all(&self, options: SyncOptions) -> Result<SyncAllResult, SyncError> {
        self.trigger(SyncTarget::All, options).await
    }
}
