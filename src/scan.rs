//! Initial sync scanner: full table scans turned into low-priority actions.
//!
//! Used for bootstrap, recovery after schema changes, and manual re-sync
//! requests. Tables come from the field-mapping metadata, not from the
//! in-memory declarations, so a scan always reflects what the schema
//! reconciler last wrote.
//!
//! # Algorithm
//!
//! 1. Discover distinct (base, table) pairs with their enabled field ids
//! 2. Put the configured high-volume table first
//! 3. Per table, sequentially: scan (fixed-delay retry), then hand one
//!    upsert action per record to the caller, payload attached
//! 4. A table that fails every attempt is recorded and skipped

use crate::config::ScanConfig;
use crate::error::{MirrorError, Result};
use crate::origin::{OriginClient, Record, TableRef};
use crate::queue::ChangeAction;
use crate::resilience::{retry_with_backoff, RetryPolicy};
use crate::store::MirrorStore;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// One table to scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanTarget {
    pub base_id: String,
    pub table_id: String,
    pub mirror_table: String,
    /// Enabled field ids attached to every action from this table.
    pub field_ids: BTreeSet<String>,
}

impl ScanTarget {
    pub fn table_ref(&self) -> TableRef {
        TableRef::new(&self.base_id, &self.table_id)
    }
}

/// A table abandoned after every scan attempt failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableFailure {
    pub mirror_table: String,
    pub table: TableRef,
    pub error: String,
}

/// Outcome of [`Scanner::perform_full_sync`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FullSyncReport {
    /// Actions handed to the enqueue callback.
    pub records: usize,
    pub tables_scanned: usize,
    pub failed_tables: Vec<TableFailure>,
}

/// Logs scan progress until dropped.
struct Heartbeat {
    handle: JoinHandle<()>,
}

impl Heartbeat {
    fn start(mirror_table: String, interval: std::time::Duration, processed: Arc<AtomicUsize>, total: Arc<AtomicUsize>) -> Self {
        let handle = tokio::spawn(async move {
            let mut timer = tokio::time::interval(interval);
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // First tick completes immediately
            timer.tick().await;
            loop {
                timer.tick().await;
                info!(
                    table = %mirror_table,
                    processed = processed.load(Ordering::Relaxed),
                    total = total.load(Ordering::Relaxed),
                    "Scan still running"
                );
            }
        });
        Self { handle }
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Full-table scanner.
pub struct Scanner<O> {
    origin: Arc<O>,
    store: MirrorStore,
    config: ScanConfig,
}

impl<O: OriginClient> Scanner<O> {
    pub fn new(origin: Arc<O>, store: MirrorStore, config: ScanConfig) -> Self {
        Self { origin, store, config }
    }

    /// Tables to scan, in the order they will be scanned.
    ///
    /// `filter` limits discovery to the named mirror tables; names that match
    /// nothing are logged.
    pub async fn discover_tables(&self, filter: Option<&[String]>) -> Result<Vec<ScanTarget>> {
        let rows = self.store.field_mappings().await?;
        let mut targets: Vec<ScanTarget> = Vec::new();

        for row in rows.into_iter().filter(|r| r.enabled) {
            if let Some(names) = filter {
                if !names.contains(&row.mirror_table) {
                    continue;
                }
            }
            match targets
                .iter_mut()
                .find(|t| t.base_id == row.base_id && t.table_id == row.table_id)
            {
                Some(target) => {
                    target.field_ids.insert(row.field_id);
                }
                None => targets.push(ScanTarget {
                    base_id: row.base_id,
                    table_id: row.table_id,
                    mirror_table: row.mirror_table,
                    field_ids: BTreeSet::from([row.field_id]),
                }),
            }
        }

        if let Some(names) = filter {
            let missing: Vec<&str> = names
                .iter()
                .filter(|n| !targets.iter().any(|t| &t.mirror_table == *n))
                .map(String::as_str)
                .collect();
            if !missing.is_empty() {
                warn!(tables = ?missing, "Requested tables have no enabled field mappings");
            }
        }

        if let Some(ref first) = self.config.high_volume_table {
            if let Some(pos) = targets.iter().position(|t| &t.table_id == first) {
                let target = targets.remove(pos);
                targets.insert(0, target);
            }
        }

        Ok(targets)
    }

    /// Scan one table and enqueue an upsert per record.
    ///
    /// Returns the number of actions enqueued. Nothing is enqueued when every
    /// attempt fails.
    pub async fn process_table<F>(&self, target: &ScanTarget, enqueue: &mut F) -> Result<usize>
    where
        F: FnMut(ChangeAction),
    {
        let start = Instant::now();
        let processed = Arc::new(AtomicUsize::new(0));
        let total = Arc::new(AtomicUsize::new(0));
        let _heartbeat = Heartbeat::start(
            target.mirror_table.clone(),
            self.config.heartbeat_interval_duration(),
            Arc::clone(&processed),
            Arc::clone(&total),
        );

        let records = self.scan_with_retry(target).await?;
        total.store(records.len(), Ordering::Relaxed);
        let large = records.len() > self.config.progress_threshold;
        let every = self.config.progress_every.max(1);
        let count = records.len();

        for (i, record) in records.into_iter().enumerate() {
            let action = ChangeAction::upsert(&target.base_id, &target.table_id, &record.id)
                .with_fields(target.field_ids.iter().cloned())
                .with_record(record);
            enqueue(action);
            processed.store(i + 1, Ordering::Relaxed);
            if large && (i + 1) % every == 0 {
                info!(table = %target.mirror_table, processed = i + 1, total = count, "Scan progress");
            }
        }

        let duration = start.elapsed();
        crate::metrics::record_scan_table(&target.mirror_table, count, duration);
        info!(
            table = %target.mirror_table,
            records = count,
            duration_ms = duration.as_millis() as u64,
            "Table scanned"
        );
        Ok(count)
    }

    async fn scan_with_retry(&self, target: &ScanTarget) -> Result<Vec<Record>> {
        let policy = RetryPolicy::fixed(self.config.max_retries, self.config.retry_delay_duration());
        let table = target.table_ref();

        retry_with_backoff("scan_table", &policy, |_: &MirrorError| true, |attempt| {
            debug!(table = %target.mirror_table, attempt, "Scanning table");
            self.origin.scan_table(&table)
        })
        .await
        .map_err(|failure| {
            crate::metrics::record_scan_failure(&target.mirror_table);
            let details = serde_json::json!({
                "baseId": target.base_id,
                "tableId": target.table_id,
                "fieldIds": target.field_ids,
                "maxRetries": self.config.max_retries,
                "lastErrorType": failure.error.kind(),
                "lastErrorMessage": failure.error.to_string(),
            });
            MirrorError::Scan {
                attempts: failure.attempts,
                details: details.to_string(),
            }
        })
    }

    /// Scan every discovered table, handing actions to `enqueue`.
    ///
    /// Table failures are collected in the report; only discovery errors
    /// fail the whole call.
    pub async fn perform_full_sync<F>(&self, mut enqueue: F, filter: Option<&[String]>) -> Result<FullSyncReport>
    where
        F: FnMut(ChangeAction),
    {
        let targets = self.discover_tables(filter).await?;
        info!(tables = targets.len(), "Starting full table scan");

        let mut report = FullSyncReport::default();
        for target in &targets {
            let span = info_span!("scan", base_id = %target.base_id, table = %target.mirror_table);
            match self.process_table(target, &mut enqueue).instrument(span).await {
                Ok(count) => {
                    report.records += count;
                    report.tables_scanned += 1;
                }
                Err(e) => {
                    error!(table = %target.mirror_table, error = %e, "Abandoning table");
                    report.failed_tables.push(TableFailure {
                        mirror_table: target.mirror_table.clone(),
                        table: target.table_ref(),
                        error: e.to_string(),
                    });
                }
            }
        }

        info!(
            records = report.records,
            tables_scanned = report.tables_scanned,
            failed = report.failed_tables.len(),
            "Full table scan finished"
        );
        Ok(report)
    }
}
