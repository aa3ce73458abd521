//! Full sync: scan every table into the low lane while a drain loop applies
//! it, then mark the sync complete.
//!
//! ```text
//! mark_sync_started
//!      │
//!      ├── scanner.perform_full_sync ──push(Low)──▶ queue
//!      │                                              │
//!      └── drain loop (until scan done) ◀─────────────┘
//!      │
//! wait_for_empty(drain_timeout)   (timeout logged, not fatal)
//!      │
//! mark_sync_completed
//! ```
//!
//! Any error inside the bracket is caught once, recorded with
//! `mark_sync_failed`, alerted and returned. Manual requests queued when the
//! sync starts are claimed up front and completed only if it succeeds.

use super::SyncCore;
use crate::alert::AlertLevel;
use crate::error::Result;
use crate::metrics;
use crate::origin::OriginClient;
use crate::queue::Priority;
use crate::scan::FullSyncReport;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{watch, MutexGuard};
use tracing::{debug, error, info, warn, Instrument};

/// Pause between drain passes while the scan is still producing.
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(50);

impl<O: OriginClient> SyncCore<O> {
    pub(crate) async fn perform_full_sync(&self, filter: Option<&[String]>) -> Result<FullSyncReport> {
        let guard = self.full_sync_lock.lock().await;
        self.run_full_sync(guard, filter).await
    }

    async fn run_full_sync(&self, _guard: MutexGuard<'_, ()>, filter: Option<&[String]>) -> Result<FullSyncReport> {
        let claimed = match self.requests.claim_queued().await {
            Ok(ids) => ids,
            Err(e) => {
                warn!(error = %e, "Failed to claim queued sync requests");
                Vec::new()
            }
        };

        self.alerter.alert(AlertLevel::Info, "Full sync starting");
        let start = Instant::now();
        let span = tracing::info_span!("full_sync", requests = claimed.len());

        match self.full_sync_bracket(filter).instrument(span).await {
            Ok(report) => {
                let duration = start.elapsed();
                metrics::record_full_sync("success", report.records, duration);
                if let Err(e) = self.requests.complete(&claimed).await {
                    warn!(error = %e, "Failed to complete sync requests");
                }

                if !report.failed_tables.is_empty() {
                    let tables: Vec<&str> = report.failed_tables.iter().map(|f| f.mirror_table.as_str()).collect();
                    self.alerter.alert(
                        AlertLevel::Warning,
                        &format!("Full sync skipped {} tables: {}", tables.len(), tables.join(", ")),
                    );
                }
                self.alerter.alert(
                    AlertLevel::Info,
                    &format!(
                        "Full sync completed successfully: {} records from {} tables in {}s",
                        report.records,
                        report.tables_scanned,
                        duration.as_secs()
                    ),
                );
                Ok(report)
            }
            Err(e) => {
                metrics::record_full_sync("failed", 0, start.elapsed());
                if let Err(mark_err) = self.sync_state.mark_sync_failed(&e.to_string()).await {
                    error!(error = %mark_err, "Failed to record sync failure");
                }
                if let Err(reset_err) = self.requests.reset_to_queued(&claimed).await {
                    warn!(error = %reset_err, "Failed to requeue sync requests");
                }
                let message = format!("Full sync failed: {}", e);
                error!("{}", message);
                self.alerter.alert(AlertLevel::Error, &message);
                Err(e)
            }
        }
    }

    async fn full_sync_bracket(&self, filter: Option<&[String]>) -> Result<FullSyncReport> {
        self.sync_state.mark_sync_started().await?;

        let scan_done = AtomicBool::new(false);
        let scan = async {
            let result = self
                .scanner
                .perform_full_sync(|action| self.queue.push(vec![action], Priority::Low), filter)
                .await;
            scan_done.store(true, Ordering::Release);
            result
        };
        let drain = async {
            loop {
                self.queue.process(&self.applier).await;
                if scan_done.load(Ordering::Acquire) {
                    break;
                }
                tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
            }
        };
        let (report, ()) = tokio::join!(scan, drain);
        let report = report?;

        let timeout = self.config.queue.drain_timeout_duration();
        if !self.wait_for_queue_to_empty(timeout).await {
            let status = self.queue.status();
            error!(
                timeout_secs = timeout.as_secs(),
                high = status.high,
                low = status.low,
                "Queue did not empty before timeout, marking sync complete anyway"
            );
        }

        self.sync_state.mark_sync_completed().await?;
        info!(records = report.records, tables = report.tables_scanned, "Full sync complete");
        Ok(report)
    }

    pub(crate) async fn wait_for_queue_to_empty(&self, timeout: Duration) -> bool {
        self.queue.wait_for_empty(&self.applier, timeout).await
    }

    pub(crate) async fn process_sync_requests(&self) -> Result<Option<FullSyncReport>> {
        let Ok(guard) = self.full_sync_lock.try_lock() else {
            debug!("Full sync in progress, requests stay queued");
            return Ok(None);
        };

        let queued = self.requests.queued().await?;
        if queued.is_empty() {
            return Ok(None);
        }

        let requested_by: Vec<&str> = queued.iter().map(|r| r.requested_by.as_str()).collect();
        info!(count = queued.len(), requested_by = ?requested_by, "Processing manual sync requests");
        self.run_full_sync(guard, None).await.map(Some)
    }

    pub(crate) async fn run_request_loop(&self, mut shutdown_rx: watch::Receiver<bool>) {
        let span = tracing::info_span!("sync_requests");

        async move {
            let _ = shutdown_rx.borrow_and_update();

            let interval = self.config.schedule.request_poll_interval_duration();
            let mut timer = tokio::time::interval(interval);
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    biased;

                    result = shutdown_rx.changed() => {
                        if result.is_err() || *shutdown_rx.borrow() {
                            info!("Shutdown signal received, stopping request task");
                            break;
                        }
                        continue;
                    }

                    _ = timer.tick() => {}
                }

                if let Err(e) = self.process_sync_requests().await {
                    warn!(error = %e, "Failed to process sync requests");
                }
            }

            info!("Request task stopped");
        }
        .instrument(span)
        .await
    }
}
