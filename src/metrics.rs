//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics for:
//! - Origin API calls and rate limiter waits
//! - Webhook payload consumption and subscription churn
//! - Update queue depth and apply outcomes
//! - Full sync scans
//! - Engine state and tick outcomes
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `mirror_sync_` and follow Prometheus conventions:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track distributions (duration, size)
//!
//! # Usage
//!
//! ```rust,no_run
//! use mirror_sync::metrics;
//! use std::time::Duration;
//!
//! // After draining the update queue
//! metrics::record_drain(40, 2, Duration::from_millis(850));
//!
//! // After a table scan
//! metrics::record_scan_table("tblCourses", 1200, Duration::from_secs(4));
//! ```

use metrics::{counter, gauge, histogram};
use std::time::Duration;

// =============================================================================
// Origin + Rate Limiting
// =============================================================================

/// Record an origin API call outcome and latency.
pub fn record_origin_call(operation: &str, success: bool, duration: Duration) {
    let status = if success { "success" } else { "failure" };
    counter!(
        "mirror_sync_origin_calls_total",
        "operation" => operation.to_string(),
        "status" => status
    )
    .increment(1);
    histogram!(
        "mirror_sync_origin_call_duration_seconds",
        "operation" => operation.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record time spent blocked on the rate limiter.
pub fn record_rate_limit_wait(waited: Duration) {
    counter!("mirror_sync_rate_limit_waits_total").increment(1);
    histogram!("mirror_sync_rate_limit_wait_seconds").record(waited.as_secs_f64());
}

/// Record a retried operation.
pub fn record_retry(operation: &str) {
    counter!("mirror_sync_retries_total", "operation" => operation.to_string()).increment(1);
}

/// Record mirror SQLite retry (for SQLITE_BUSY/SQLITE_LOCKED).
pub fn record_mirror_retry(operation: &str) {
    counter!("mirror_sync_mirror_retries_total", "operation" => operation.to_string()).increment(1);
}

// =============================================================================
// Webhook Capture
// =============================================================================

/// Record payloads read from a base's subscription.
pub fn record_webhook_payloads(base_id: &str, count: usize) {
    counter!("mirror_sync_webhook_payloads_total", "base_id" => base_id.to_string())
        .increment(count as u64);
}

/// Record an error payload.
pub fn record_webhook_payload_error(base_id: &str, code: &str) {
    counter!(
        "mirror_sync_webhook_payload_errors_total",
        "base_id" => base_id.to_string(),
        "code" => code.to_string()
    )
    .increment(1);
}

/// Record a subscription being recreated, by reason.
pub fn record_subscription_recreated(base_id: &str, reason: &str) {
    counter!(
        "mirror_sync_subscription_recreations_total",
        "base_id" => base_id.to_string(),
        "reason" => reason.to_string()
    )
    .increment(1);
}

/// Record change actions produced by one poll of a base.
pub fn record_actions_polled(base_id: &str, count: usize) {
    counter!("mirror_sync_actions_polled_total", "base_id" => base_id.to_string())
        .increment(count as u64);
}

// =============================================================================
// Update Queue
// =============================================================================

/// Set queue depth gauges per lane.
pub fn set_queue_depth(high: usize, low: usize) {
    gauge!("mirror_sync_queue_depth", "lane" => "high").set(high as f64);
    gauge!("mirror_sync_queue_depth", "lane" => "low").set(low as f64);
}

/// Record one applied action by outcome (applied, deleted, skipped, failed).
pub fn record_action_applied(outcome: &str) {
    counter!("mirror_sync_actions_total", "outcome" => outcome.to_string()).increment(1);
}

/// Record an action dropped after exhausting its attempts.
pub fn record_action_dropped() {
    counter!("mirror_sync_actions_dropped_total").increment(1);
}

/// Record one queue drain.
pub fn record_drain(applied: usize, failed: usize, duration: Duration) {
    counter!("mirror_sync_drains_total").increment(1);
    histogram!("mirror_sync_drain_size").record(applied as f64);
    if failed > 0 {
        counter!("mirror_sync_drain_failures_total").increment(failed as u64);
    }
    histogram!("mirror_sync_drain_duration_seconds").record(duration.as_secs_f64());
}

// =============================================================================
// Full Sync
// =============================================================================

/// Record a completed table scan.
pub fn record_scan_table(table: &str, records: usize, duration: Duration) {
    counter!("mirror_sync_scan_records_total", "table" => table.to_string())
        .increment(records as u64);
    histogram!("mirror_sync_scan_duration_seconds", "table" => table.to_string())
        .record(duration.as_secs_f64());
}

/// Record a table scan that failed after all retries.
pub fn record_scan_failure(table: &str) {
    counter!("mirror_sync_scan_failures_total", "table" => table.to_string()).increment(1);
}

/// Record a full sync by outcome (completed, failed).
pub fn record_full_sync(outcome: &str, records: usize, duration: Duration) {
    counter!("mirror_sync_full_syncs_total", "outcome" => outcome.to_string()).increment(1);
    histogram!("mirror_sync_full_sync_records").record(records as f64);
    histogram!("mirror_sync_full_sync_duration_seconds").record(duration.as_secs_f64());
}

// =============================================================================
// Engine
// =============================================================================

/// Record an operator alert by level.
pub fn record_alert(level: &str) {
    counter!("mirror_sync_alerts_total", "level" => level.to_string()).increment(1);
}

/// Gauge for engine state.
pub fn set_engine_state(state: &str) {
    // Encode state as numeric for alerting
    let value = match state {
        "Created" => 0.0,
        "Starting" => 1.0,
        "Running" => 2.0,
        "ShuttingDown" => 3.0,
        "Stopped" => 4.0,
        "Failed" => 5.0,
        _ => -1.0,
    };
    gauge!("mirror_sync_engine_state").set(value);
}

/// Record a tick by outcome (completed, partial, skipped).
pub fn record_tick(outcome: &str) {
    counter!("mirror_sync_ticks_total", "outcome" => outcome.to_string()).increment(1);
}
