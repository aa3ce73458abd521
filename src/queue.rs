//! Update queue with per-record deduplication.
//!
//! Buffers [`ChangeAction`]s from every base and applies them one at a time
//! through an [`ActionSink`].
//!
//! # Design
//!
//! ```text
//! webhook poll ──▶ push(High) ──┐
//!                               ├──▶ pending: HashMap<key, entry> (merge on enqueue)
//! full scan ────▶ push(Low) ────┘          │
//!                                          ▼
//!                          high lane ──▶ low lane ──▶ ActionSink::apply
//!                                                          │ failure
//!                                                          ▼
//!                        back of lane, deferred by backoff, dropped after max attempts
//! ```
//!
//! A record has at most one pending entry. Actions for the same record merge:
//! field ids union, delete flag OR, record payload from the later action.
//!
//! A failed entry is never retried in the drain that failed it, and not before
//! its backoff delay has passed. Until then the drain skips over it, so a
//! deferred high entry does not hold up the low lane.

use crate::alert::{AlertLevel, Alerter};
use crate::error::Result;
use crate::origin::{BoxFuture, Record};
use crate::replication::ApplyOutcome;
use crate::resilience::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// One change to apply to the mirror.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeAction {
    pub base_id: String,
    pub table_id: String,
    pub record_id: String,
    /// Fields that changed. `None` means unknown or all.
    pub field_ids: Option<BTreeSet<String>>,
    pub is_delete: bool,
    /// Full record when the producer already has it (scans).
    pub record: Option<Record>,
}

/// Identity of the record an action targets.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ActionKey {
    pub base_id: String,
    pub table_id: String,
    pub record_id: String,
}

impl std::fmt::Display for ActionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.base_id, self.table_id, self.record_id)
    }
}

impl ChangeAction {
    /// Upsert with no field filter.
    pub fn upsert(base_id: impl Into<String>, table_id: impl Into<String>, record_id: impl Into<String>) -> Self {
        Self {
            base_id: base_id.into(),
            table_id: table_id.into(),
            record_id: record_id.into(),
            field_ids: None,
            is_delete: false,
            record: None,
        }
    }

    pub fn delete(base_id: impl Into<String>, table_id: impl Into<String>, record_id: impl Into<String>) -> Self {
        Self {
            is_delete: true,
            ..Self::upsert(base_id, table_id, record_id)
        }
    }

    /// Restrict to changed fields. An empty set means no filter.
    pub fn with_fields<I, S>(mut self, field_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let set: BTreeSet<String> = field_ids.into_iter().map(Into::into).collect();
        self.field_ids = if set.is_empty() { None } else { Some(set) };
        self
    }

    pub fn with_record(mut self, record: Record) -> Self {
        self.record = Some(record);
        self
    }

    pub fn key(&self) -> ActionKey {
        ActionKey {
            base_id: self.base_id.clone(),
            table_id: self.table_id.clone(),
            record_id: self.record_id.clone(),
        }
    }

    /// Fold a later action for the same record into this one.
    pub fn merge(&mut self, later: ChangeAction) {
        self.field_ids = match (self.field_ids.take(), later.field_ids) {
            (None, None) => None,
            (Some(a), None) => Some(a),
            (None, Some(b)) => Some(b),
            (Some(mut a), Some(b)) => {
                a.extend(b);
                Some(a)
            }
        };
        self.is_delete |= later.is_delete;
        self.record = later.record;
    }
}

/// Collapse actions to one per record, in first-seen order.
pub fn deduplicate_actions(actions: Vec<ChangeAction>) -> Vec<ChangeAction> {
    let mut index: HashMap<ActionKey, usize> = HashMap::new();
    let mut out: Vec<ChangeAction> = Vec::with_capacity(actions.len());

    for action in actions {
        match index.get(&action.key()) {
            Some(&idx) => out[idx].merge(action),
            None => {
                index.insert(action.key(), out.len());
                out.push(action);
            }
        }
    }
    out
}

/// Queue lane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Priority {
    /// Webhook changes; always drained first.
    High,
    /// Full scan output.
    Low,
}

/// Pending counts per lane.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStatus {
    pub high: usize,
    pub low: usize,
}

impl QueueStatus {
    pub fn total(&self) -> usize {
        self.high + self.low
    }
}

/// Result of one drain.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DrainReport {
    pub applied: usize,
    pub skipped: usize,
    /// Failed attempts that were re-queued.
    pub retried: usize,
    /// Entries dropped after max attempts.
    pub dropped: usize,
}

/// Applies one action to the mirror.
pub trait ActionSink: Send + Sync {
    fn apply<'a>(&'a self, action: &'a ChangeAction) -> BoxFuture<'a, ApplyOutcome>;
}

#[derive(Debug)]
struct Entry {
    action: ChangeAction,
    attempts: u32,
    priority: Priority,
    /// Earliest time of the next attempt after a failure.
    retry_at: Option<Instant>,
    /// Drain that last failed this entry.
    failed_in: Option<u64>,
}

impl Entry {
    fn is_due(&self, now: Instant, drain: u64) -> bool {
        self.failed_in != Some(drain) && self.retry_at.map_or(true, |at| at <= now)
    }
}

#[derive(Debug, Default)]
struct Lanes {
    high: VecDeque<ActionKey>,
    low: VecDeque<ActionKey>,
    pending: HashMap<ActionKey, Entry>,
    in_flight: usize,
    /// Incremented at the start of every drain.
    drain: u64,
}

impl Lanes {
    fn lane_mut(&mut self, priority: Priority) -> &mut VecDeque<ActionKey> {
        match priority {
            Priority::High => &mut self.high,
            Priority::Low => &mut self.low,
        }
    }

    fn status(&self) -> QueueStatus {
        QueueStatus {
            high: self.high.len(),
            low: self.low.len(),
        }
    }

    fn is_idle(&self) -> bool {
        self.pending.is_empty() && self.in_flight == 0
    }

    /// Merge into a pending entry or append a new one.
    fn enqueue(&mut self, action: ChangeAction, priority: Priority) {
        let key = action.key();
        if let Some(entry) = self.pending.get_mut(&key) {
            entry.action.merge(action);
            if priority == Priority::High && entry.priority == Priority::Low {
                entry.priority = Priority::High;
                self.low.retain(|k| k != &key);
                self.high.push_back(key);
            }
            return;
        }
        self.lane_mut(priority).push_back(key.clone());
        self.pending.insert(
            key,
            Entry {
                action,
                attempts: 0,
                priority,
                retry_at: None,
                failed_in: None,
            },
        );
    }

    /// First due entry, high lane before low.
    fn pop(&mut self, now: Instant, drain: u64) -> Option<Entry> {
        let key = take_due(&mut self.high, &self.pending, now, drain)
            .or_else(|| take_due(&mut self.low, &self.pending, now, drain))?;
        let entry = self.pending.remove(&key)?;
        self.in_flight += 1;
        Some(entry)
    }

    /// Re-queue a failed entry at the back of its lane.
    ///
    /// If newer actions for the record arrived meanwhile, the failed one is
    /// folded underneath them and the newer entry's attempt count is kept.
    /// The failed entry's backoff still applies.
    fn requeue(&mut self, mut failed: Entry) {
        let key = failed.action.key();
        if let Some(newer) = self.pending.remove(&key) {
            failed.action.merge(newer.action);
            failed.attempts = newer.attempts;
            if newer.priority == Priority::High && failed.priority == Priority::Low {
                failed.priority = Priority::High;
            }
            self.high.retain(|k| k != &key);
            self.low.retain(|k| k != &key);
        }
        let priority = failed.priority;
        self.lane_mut(priority).push_back(key.clone());
        self.pending.insert(key, failed);
    }
}

fn take_due(
    lane: &mut VecDeque<ActionKey>,
    pending: &HashMap<ActionKey, Entry>,
    now: Instant,
    drain: u64,
) -> Option<ActionKey> {
    let idx = lane
        .iter()
        .position(|key| pending.get(key).map_or(true, |entry| entry.is_due(now, drain)))?;
    lane.remove(idx)
}

/// Two-lane update queue.
///
/// Interior mutability throughout; share it behind an `Arc`. The lane lock is
/// never held across an await. Draining is serialized by a separate async
/// lock so two drains never apply entries concurrently.
pub struct UpdateQueue {
    lanes: Mutex<Lanes>,
    drain_lock: tokio::sync::Mutex<()>,
    idle: Notify,
    retry: RetryPolicy,
    alerter: Arc<dyn Alerter>,
}

impl UpdateQueue {
    /// `retry` bounds the attempts per action and spaces them out.
    pub fn new(retry: RetryPolicy, alerter: Arc<dyn Alerter>) -> Self {
        Self {
            lanes: Mutex::new(Lanes::default()),
            drain_lock: tokio::sync::Mutex::new(()),
            idle: Notify::new(),
            retry,
            alerter,
        }
    }

    fn max_attempts(&self) -> u32 {
        self.retry.max_attempts.clamp(1, u32::MAX as usize) as u32
    }

    fn lanes(&self) -> MutexGuard<'_, Lanes> {
        self.lanes.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Enqueue actions, merging into pending entries for the same record.
    pub fn push(&self, actions: Vec<ChangeAction>, priority: Priority) {
        if actions.is_empty() {
            return;
        }
        let status = {
            let mut lanes = self.lanes();
            for action in actions {
                lanes.enqueue(action, priority);
            }
            lanes.status()
        };
        crate::metrics::set_queue_depth(status.high, status.low);
    }

    pub fn status(&self) -> QueueStatus {
        self.lanes().status()
    }

    pub fn is_empty(&self) -> bool {
        self.lanes().pending.is_empty()
    }

    /// Nothing pending and nothing being applied.
    pub fn is_idle(&self) -> bool {
        self.lanes().is_idle()
    }

    /// Drop every pending entry. Returns how many were dropped.
    pub fn clear(&self) -> usize {
        let dropped = {
            let mut lanes = self.lanes();
            let dropped = lanes.pending.len();
            lanes.pending.clear();
            lanes.high.clear();
            lanes.low.clear();
            dropped
        };
        crate::metrics::set_queue_depth(0, 0);
        if dropped > 0 {
            warn!(dropped, "Cleared update queue");
        }
        self.notify_if_idle();
        dropped
    }

    fn notify_if_idle(&self) {
        if self.is_idle() {
            self.idle.notify_waiters();
        }
    }

    /// Apply pending entries until no due entry is left.
    ///
    /// High entries always go first, including ones enqueued mid-drain.
    /// Entries waiting out a retry delay stay queued for a later drain.
    pub async fn process<S: ActionSink + ?Sized>(&self, sink: &S) -> DrainReport {
        let _guard = self.drain_lock.lock().await;
        let start = Instant::now();
        let mut report = DrainReport::default();
        let drain = {
            let mut lanes = self.lanes();
            lanes.drain += 1;
            lanes.drain
        };

        loop {
            let Some(mut entry) = self.lanes().pop(Instant::now(), drain) else {
                break;
            };
            entry.attempts += 1;
            let result = sink.apply(&entry.action).await;
            self.finish(entry, result, drain, &mut report);
        }

        if report != DrainReport::default() {
            let status = self.status();
            crate::metrics::set_queue_depth(status.high, status.low);
            crate::metrics::record_drain(report.applied, report.retried + report.dropped, start.elapsed());
            info!(
                applied = report.applied,
                skipped = report.skipped,
                retried = report.retried,
                dropped = report.dropped,
                duration_ms = start.elapsed().as_millis() as u64,
                "Drained update queue"
            );
        }
        self.notify_if_idle();
        report
    }

    fn finish(&self, mut entry: Entry, result: Result<ApplyOutcome>, drain: u64, report: &mut DrainReport) {
        let key = entry.action.key();
        match result {
            Ok(outcome) => {
                self.lanes().in_flight -= 1;
                crate::metrics::record_action_applied(outcome.as_str());
                match outcome {
                    ApplyOutcome::Unmapped => {
                        warn!(key = %key, "No mapping for table, skipping action");
                        report.skipped += 1;
                    }
                    _ => {
                        debug!(key = %key, outcome = outcome.as_str(), "Applied action");
                        report.applied += 1;
                    }
                }
            }
            Err(e) => {
                crate::metrics::record_action_applied("failed");
                if entry.attempts >= self.max_attempts() {
                    self.lanes().in_flight -= 1;
                    let message = format!(
                        "Update failed after {} attempts, giving up: {}",
                        entry.attempts, key
                    );
                    warn!(key = %key, error = %e, "{}", message);
                    self.alerter.alert(AlertLevel::Error, &message);
                    crate::metrics::record_action_dropped();
                    report.dropped += 1;
                } else {
                    let delay = self.retry.delay_for_attempt(entry.attempts as usize);
                    warn!(
                        key = %key,
                        attempt = entry.attempts,
                        retry_in_ms = delay.as_millis() as u64,
                        error = %e,
                        "Apply failed, re-queueing"
                    );
                    entry.retry_at = Some(Instant::now() + delay);
                    entry.failed_in = Some(drain);
                    let mut lanes = self.lanes();
                    lanes.in_flight -= 1;
                    lanes.requeue(entry);
                    report.retried += 1;
                }
            }
        }
    }

    /// Drain until idle or `timeout` elapses. Returns whether the queue emptied.
    pub async fn wait_for_empty<S: ActionSink + ?Sized>(&self, sink: &S, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        let drain = async {
            loop {
                let notified = self.idle.notified();
                if self.is_idle() {
                    return;
                }
                self.process(sink).await;
                if self.is_idle() {
                    return;
                }
                // Another drain holds the lock or entries arrived mid-drain
                tokio::select! {
                    _ = notified => {}
                    _ = tokio::time::sleep(Duration::from_millis(50)) => {}
                }
            }
        };
        tokio::time::timeout_at(deadline, drain).await.is_ok()
    }
}

impl std::fmt::Debug for UpdateQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpdateQueue")
            .field("status", &self.status())
            .field("max_attempts", &self.retry.max_attempts)
            .finish()
    }
}
