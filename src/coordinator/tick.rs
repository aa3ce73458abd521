//! Tick: poll every base for changes, then drain the queue.
//!
//! The webhook registry lock doubles as the re-entrancy guard. A tick that
//! finds it held is skipped, not queued, so a slow origin never piles up
//! overlapping ticks.
//!
//! A tick whose drain dropped an action does not count as an incremental
//! sync, and queues a full sync request so the dropped record is rescanned.

use super::{SyncCore, TickOutcome};
use crate::metrics;
use crate::origin::{OriginClient, Throttled};
use crate::queue::{deduplicate_actions, DrainReport, Priority};
use crate::webhook::WebhookCapture;
use tokio::sync::watch;
use tracing::{debug, info, warn, Instrument};

/// `requested_by` of sync requests raised for dropped updates.
const REPAIR_REQUESTER: &str = "update-queue";

impl<O: OriginClient> SyncCore<O> {
    pub(crate) async fn tick(&self) -> TickOutcome {
        let Ok(mut webhooks) = self.webhooks.try_lock() else {
            debug!("Previous tick still running, skipping");
            metrics::record_tick("skipped");
            return TickOutcome::Skipped;
        };

        let (actions_polled, failed_bases) = self.poll_bases(&mut webhooks).await;
        let drain = self.queue.process(&self.applier).await;
        drop(webhooks);

        if drain.dropped > 0 {
            self.request_repair_sync(drain.dropped).await;
        }
        let clean = failed_bases == 0 && drain.dropped == 0;
        if clean {
            self.sync_state.mark_incremental_sync().await;
        }

        metrics::record_tick(if clean { "completed" } else { "partial" });
        TickOutcome::Completed {
            actions_polled,
            failed_bases,
            drain,
        }
    }

    /// Queue one full sync request unless one is already waiting.
    async fn request_repair_sync(&self, dropped: usize) {
        match self.requests.queued().await {
            Ok(queued) if !queued.is_empty() => {
                debug!(dropped, "Full sync already requested");
            }
            Ok(_) => match self.requests.submit(REPAIR_REQUESTER).await {
                Ok(id) => warn!(dropped, request_id = id, "Dropped updates, full sync requested"),
                Err(e) => warn!(dropped, error = %e, "Failed to request full sync after dropped updates"),
            },
            Err(e) => warn!(dropped, error = %e, "Failed to read sync requests"),
        }
    }

    pub(crate) async fn poll_for_updates(&self) -> usize {
        let mut webhooks = self.webhooks.lock().await;
        self.poll_bases(&mut webhooks).await.0
    }

    pub(crate) async fn process_update_queue(&self) -> DrainReport {
        self.queue.process(&self.applier).await
    }

    /// Returns (actions enqueued, bases that failed).
    async fn poll_bases(&self, webhooks: &mut [WebhookCapture<Throttled<O>>]) -> (usize, usize) {
        let mut enqueued = 0;
        let mut failed = 0;

        for capture in webhooks.iter_mut() {
            let span = tracing::info_span!("webhook", base_id = %capture.base_id());
            match capture.pop_actions().instrument(span).await {
                Ok(actions) if actions.is_empty() => {}
                Ok(actions) => {
                    let actions = deduplicate_actions(actions);
                    debug!(base_id = %capture.base_id(), count = actions.len(), "Enqueueing webhook actions");
                    enqueued += actions.len();
                    self.queue.push(actions, Priority::High);
                }
                Err(e) => {
                    // Other bases still get polled
                    warn!(base_id = %capture.base_id(), error = %e, "Failed to poll base");
                    failed += 1;
                }
            }
        }

        (enqueued, failed)
    }

    pub(crate) async fn run_tick_loop(&self, mut shutdown_rx: watch::Receiver<bool>) {
        let span = tracing::info_span!("tick");

        async move {
            // Mark initial shutdown value as seen so changed() only fires on actual changes
            let _ = shutdown_rx.borrow_and_update();

            let interval = self.config.schedule.tick_interval_duration();
            info!(interval_ms = interval.as_millis() as u64, "Starting tick task");

            let mut timer = tokio::time::interval(interval);
            // Skip missed ticks instead of bursting to catch up
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    biased;

                    result = shutdown_rx.changed() => {
                        if result.is_err() || *shutdown_rx.borrow() {
                            info!("Shutdown signal received, stopping tick task");
                            break;
                        }
                        continue;
                    }

                    _ = timer.tick() => {}
                }

                if let TickOutcome::Completed { actions_polled, failed_bases, drain } = self.tick().await {
                    if actions_polled > 0 || failed_bases > 0 {
                        debug!(actions_polled, failed_bases, applied = drain.applied, "Tick complete");
                    }
                }
            }

            info!("Tick task stopped");
        }
        .instrument(span)
        .await
    }
}
