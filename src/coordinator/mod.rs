// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Sync engine coordinator.
//!
//! The orchestrator that ties together:
//! - The rate-limited origin via [`crate::origin::Throttled`]
//! - Webhook change capture per base via [`crate::webhook::WebhookCapture`]
//! - The two-lane [`crate::queue::UpdateQueue`] applied through
//!   [`crate::replication::MirrorApplier`]
//! - Full scans via [`crate::scan::Scanner`]
//! - Lifecycle bookkeeping via [`crate::sync_state::SyncStateManager`] and
//!   [`crate::requests::SyncRequestStore`]
//!
//! # Architecture
//!
//! 1. `start()` reconciles the schema, adopts or creates a subscription per
//!    base, spawns the tick and request tasks, then runs a full sync if the
//!    schema changed or the mirror is stale
//! 2. Every tick polls all bases into the high lane and drains the queue
//!    (skipped when the previous tick is still running)
//! 3. Queued manual requests trigger a full sync
//! 4. `shutdown()` stops both tasks and closes the store
//!
//! All state lives in the engine object; nothing is global.

mod full_sync;
mod tick;
mod types;

pub use types::{BaseHealth, EngineState, HealthCheck, TickOutcome};

use crate::alert::{Alerter, TracingAlerter};
use crate::config::MirrorConfig;
use crate::error::{MirrorError, Result};
use crate::mapping::{ColumnData, MappingRegistry, TableMapping};
use crate::metrics;
use crate::origin::{NoOpOrigin, OriginClient, Record, Throttled};
use crate::queue::{DrainReport, UpdateQueue};
use crate::replication::{MirrorApplier, Replicator};
use crate::requests::SyncRequestStore;
use crate::resilience::RateLimiter;
use crate::scan::{FullSyncReport, Scanner};
use crate::schema::{SchemaReconciler, SqliteSchemaReconciler};
use crate::store::MirrorStore;
use crate::sync_state::{SyncMetadata, SyncPhase, SyncStateManager};
use crate::webhook::WebhookCapture;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};

/// Everything the background tasks share.
pub(crate) struct SyncCore<O: OriginClient> {
    config: MirrorConfig,
    registry: Arc<MappingRegistry>,
    store: MirrorStore,
    origin: Arc<Throttled<O>>,
    replicator: Replicator<Throttled<O>>,
    applier: MirrorApplier<Throttled<O>>,
    queue: UpdateQueue,
    /// One capture per base. Holding this lock is what makes a tick
    /// single-flight.
    webhooks: Mutex<Vec<WebhookCapture<Throttled<O>>>>,
    scanner: Scanner<Throttled<O>>,
    sync_state: SyncStateManager,
    requests: SyncRequestStore,
    alerter: Arc<dyn Alerter>,
    /// At most one full sync at a time.
    full_sync_lock: Mutex<()>,
}

/// The mirror sync engine.
///
/// Keeps the mirror database consistent with the origin. Construct with
/// [`new`](MirrorSyncEngine::new) (no-op origin, for wiring) or
/// [`with_origin`](MirrorSyncEngine::with_origin), then call
/// [`start`](MirrorSyncEngine::start).
pub struct MirrorSyncEngine<O: OriginClient = NoOpOrigin> {
    core: Arc<SyncCore<O>>,

    /// Engine state (broadcast to watchers)
    state_tx: watch::Sender<EngineState>,
    state_rx: watch::Receiver<EngineState>,

    /// Shutdown signal
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,

    /// Tick and request task handles
    handles: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl MirrorSyncEngine<NoOpOrigin> {
    /// Engine over the no-op origin (wiring and standalone mode).
    pub async fn new(config: MirrorConfig, registry: MappingRegistry) -> Result<Self> {
        Self::with_origin(config, registry, NoOpOrigin, Arc::new(TracingAlerter)).await
    }
}

impl<O: OriginClient> MirrorSyncEngine<O> {
    /// Engine over a real origin client.
    ///
    /// Opens the mirror store from `config.store`. Every call to `origin`
    /// goes through one rate limiter built from `config.rate_limit`.
    pub async fn with_origin(
        config: MirrorConfig,
        registry: MappingRegistry,
        origin: O,
        alerter: Arc<dyn Alerter>,
    ) -> Result<Self> {
        let store = MirrorStore::open(&config.store).await?;
        Ok(Self::with_store(config, registry, origin, alerter, store))
    }

    /// Engine over an already opened store.
    pub fn with_store(
        config: MirrorConfig,
        registry: MappingRegistry,
        origin: O,
        alerter: Arc<dyn Alerter>,
        store: MirrorStore,
    ) -> Self {
        let registry = Arc::new(registry);
        let limiter = Arc::new(RateLimiter::from_config(&config.rate_limit));
        let origin = Arc::new(Throttled::new(origin, limiter));
        let replicator = Replicator::new(Arc::clone(&origin), store.clone());
        let applier = MirrorApplier::new(replicator.clone(), Arc::clone(&registry));

        let webhooks = registry
            .base_ids()
            .into_iter()
            .map(|base_id| {
                let fields = registry.tracked_fields_for_base(&base_id);
                WebhookCapture::new(
                    base_id,
                    fields,
                    Arc::clone(&origin),
                    Arc::clone(&alerter),
                    config.webhooks.clone(),
                )
            })
            .collect();

        let core = SyncCore {
            registry,
            queue: UpdateQueue::new(config.queue.retry_policy(), Arc::clone(&alerter)),
            scanner: Scanner::new(Arc::clone(&origin), store.clone(), config.scan.clone()),
            sync_state: SyncStateManager::new(store.clone(), config.schedule.stale_threshold_duration()),
            requests: SyncRequestStore::new(store.clone()),
            webhooks: Mutex::new(webhooks),
            full_sync_lock: Mutex::new(()),
            origin,
            replicator,
            applier,
            alerter,
            store,
            config,
        };

        let (state_tx, state_rx) = watch::channel(EngineState::Created);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Self {
            core: Arc::new(core),
            state_tx,
            state_rx,
            shutdown_tx,
            shutdown_rx,
            handles: Mutex::new(Vec::new()),
        }
    }

    pub fn store(&self) -> &MirrorStore {
        &self.core.store
    }

    pub fn registry(&self) -> &Arc<MappingRegistry> {
        &self.core.registry
    }

    pub fn origin(&self) -> &Arc<Throttled<O>> {
        &self.core.origin
    }

    pub fn queue(&self) -> &UpdateQueue {
        &self.core.queue
    }

    pub fn sync_state(&self) -> &SyncStateManager {
        &self.core.sync_state
    }

    pub fn requests(&self) -> &SyncRequestStore {
        &self.core.requests
    }

    /// Schema reconciler over this engine's store and mappings.
    pub fn schema_reconciler(&self) -> SqliteSchemaReconciler {
        SqliteSchemaReconciler::new(self.core.store.clone(), Arc::clone(&self.core.registry))
    }

    /// Get current engine state.
    pub fn state(&self) -> EngineState {
        *self.state_rx.borrow()
    }

    /// Get a receiver to watch state changes.
    pub fn state_receiver(&self) -> watch::Receiver<EngineState> {
        self.state_rx.clone()
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state(), EngineState::Running)
    }

    fn set_state(&self, state: EngineState) {
        let _ = self.state_tx.send(state);
        metrics::set_engine_state(&state.to_string());
    }

    /// Health snapshot for monitoring endpoints. No origin calls.
    pub async fn health(&self) -> HealthCheck {
        let state = self.state();
        let bases = self.core.webhooks.try_lock().ok().map(|webhooks| {
            webhooks
                .iter()
                .map(|w| BaseHealth {
                    base_id: w.base_id().to_string(),
                    state: w.state(),
                    subscription_id: w.subscription_id().map(str::to_string),
                    cursor: w.cursor(),
                })
                .collect()
        });
        let sync = match self.core.sync_state.get_sync_metadata().await {
            Ok(sync) => sync,
            Err(e) => {
                warn!(error = %e, "Failed to read sync metadata for health check");
                None
            }
        };

        let ready = state == EngineState::Running;
        let healthy = ready && !matches!(sync.as_ref().map(SyncMetadata::phase), Some(SyncPhase::Failed));

        HealthCheck {
            state,
            ready,
            healthy,
            queue: self.core.queue.status(),
            bases,
            rate_limit_in_flight: self.core.origin.limiter().in_flight(),
            sync,
        }
    }

    /// Start the engine.
    ///
    /// 1. Reconciles the schema
    /// 2. Adopts or creates a subscription per base (failures are alerted and
    ///    retried on the next tick)
    /// 3. Spawns the tick and request tasks
    /// 4. Runs a full sync if the schema changed or the mirror is stale
    pub async fn start(&self, schema: &dyn SchemaReconciler) -> Result<()> {
        if self.state() != EngineState::Created {
            return Err(MirrorError::InvalidState {
                expected: "Created".to_string(),
                actual: self.state().to_string(),
            });
        }

        info!(
            tables = self.core.registry.iter().count(),
            bases = self.core.registry.base_ids().len(),
            "Starting mirror sync engine"
        );
        self.set_state(EngineState::Starting);

        let schema_changed = match schema.ensure_schema_up_to_date().await {
            Ok(changed) => changed,
            Err(e) => {
                error!(error = %e, "Schema reconciliation failed");
                self.set_state(EngineState::Failed);
                return Err(e);
            }
        };

        self.core.initialize_webhooks().await;

        self.spawn_tick_task().await;
        self.spawn_request_task().await;
        self.set_state(EngineState::Running);
        info!("Mirror sync engine running");

        let needs_sync = if schema_changed {
            info!("Schema changed, full sync required");
            true
        } else {
            self.core.sync_state.is_initial_sync_needed().await
        };

        if needs_sync {
            if let Err(e) = self.core.perform_full_sync(None).await {
                // Already recorded and alerted
                warn!(error = %e, "Initial full sync failed, engine keeps running");
            }
        }

        Ok(())
    }

    async fn spawn_tick_task(&self) {
        let core = Arc::clone(&self.core);
        let shutdown_rx = self.shutdown_rx.clone();
        let handle = tokio::spawn(async move {
            core.run_tick_loop(shutdown_rx).await;
        });
        debug!("Spawned tick task");
        self.handles.lock().await.push(handle);
    }

    async fn spawn_request_task(&self) {
        let core = Arc::clone(&self.core);
        let shutdown_rx = self.shutdown_rx.clone();
        let handle = tokio::spawn(async move {
            core.run_request_loop(shutdown_rx).await;
        });
        debug!("Spawned request task");
        self.handles.lock().await.push(handle);
    }

    /// One poll-then-drain cycle. Skipped if another tick is running.
    pub async fn tick(&self) -> TickOutcome {
        self.core.tick().await
    }

    /// Pull pending changes from every base into the high lane.
    ///
    /// Returns the number of deduplicated actions enqueued.
    pub async fn poll_for_updates(&self) -> usize {
        self.core.poll_for_updates().await
    }

    /// Apply everything currently queued.
    pub async fn process_update_queue(&self) -> DrainReport {
        self.core.process_update_queue().await
    }

    /// Run a full sync, optionally limited to the named mirror tables.
    ///
    /// Failures are recorded in the sync metadata and alerted before being
    /// returned.
    pub async fn perform_full_sync(&self, table_filter: Option<&[String]>) -> Result<FullSyncReport> {
        self.core.perform_full_sync(table_filter).await
    }

    /// Drain until the queue is idle. Returns `false` on timeout.
    pub async fn wait_for_queue_to_empty(&self, timeout: Duration) -> bool {
        self.core.wait_for_queue_to_empty(timeout).await
    }

    /// Run a full sync if manual requests are queued and none is running.
    pub async fn process_sync_requests(&self) -> Result<Option<FullSyncReport>> {
        self.core.process_sync_requests().await
    }

    /// Queue a manual re-sync request.
    pub async fn submit_sync_request(&self, requested_by: &str) -> Result<i64> {
        self.core.requests.submit(requested_by).await
    }

    // =========================================================================
    // Write-through
    // =========================================================================

    fn mapping(&self, mirror_table: &str) -> Result<&TableMapping> {
        self.core
            .registry
            .by_mirror_table(mirror_table)
            .ok_or_else(|| MirrorError::Mapping(format!("Unknown mirror table: {}", mirror_table)))
    }

    /// Create a record at the origin and mirror it.
    pub async fn insert(&self, mirror_table: &str, data: &ColumnData) -> Result<Record> {
        let mapping = self.mapping(mirror_table)?;
        self.core.replicator.write_through_insert(mapping, data).await
    }

    /// Update a record at the origin and mirror it.
    pub async fn update(&self, mirror_table: &str, record_id: &str, data: &ColumnData) -> Result<Record> {
        let mapping = self.mapping(mirror_table)?;
        self.core.replicator.write_through_update(mapping, record_id, data).await
    }

    /// Delete a record at the origin and from the mirror.
    pub async fn delete(&self, mirror_table: &str, record_id: &str) -> Result<bool> {
        let mapping = self.mapping(mirror_table)?;
        self.core.replicator.write_through_delete(mapping, record_id).await
    }

    /// Shutdown the engine gracefully.
    ///
    /// 1. Signal the tick and request tasks to stop
    /// 2. Wait for in-flight work to finish (with timeout)
    /// 3. Checkpoint and close the store
    pub async fn shutdown(&self) {
        info!("Shutting down mirror sync engine");
        self.set_state(EngineState::ShuttingDown);
        let _ = self.shutdown_tx.send(true);

        let handles: Vec<_> = std::mem::take(&mut *self.handles.lock().await);
        let drain_timeout = self.core.config.queue.drain_timeout_duration();
        for (i, handle) in handles.into_iter().enumerate() {
            match tokio::time::timeout(drain_timeout, handle).await {
                Ok(Ok(())) => debug!(task = i + 1, "Task completed gracefully"),
                Ok(Err(e)) => warn!(task = i + 1, error = %e, "Task panicked during shutdown"),
                Err(_) => warn!(task = i + 1, "Task timed out during shutdown"),
            }
        }

        let pending = self.core.queue.status();
        if pending.total() > 0 {
            warn!(high = pending.high, low = pending.low, "Stopping with queued actions");
        }

        self.core.store.close().await;
        self.set_state(EngineState::Stopped);
        info!("Mirror sync engine stopped");
    }
}

impl<O: OriginClient> SyncCore<O> {
    /// Adopt or create every base's subscription. Failures are alerted; the
    /// next tick retries.
    async fn initialize_webhooks(&self) {
        let mut webhooks = self.webhooks.lock().await;
        for capture in webhooks.iter_mut() {
            if let Err(e) = capture.ensure_initialized().await {
                let message = format!(
                    "Failed to initialize change capture for base {}: {}",
                    capture.base_id(),
                    e
                );
                error!("{}", message);
                self.alerter.alert(crate::alert::AlertLevel::Error, &message);
            }
        }
    }
}
