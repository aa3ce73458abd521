//! Configuration for the mirror sync engine.
//!
//! All configuration types needed to run the engine. Configuration is passed
//! to [`MirrorSyncEngine::new()`](crate::MirrorSyncEngine::new) and can be
//! constructed programmatically or deserialized from YAML/JSON.
//!
//! # Quick Start
//!
//! ```rust
//! use mirror_sync::config::MirrorConfig;
//!
//! let mut config = MirrorConfig::default();
//! config.origin.access_token = "pat-secret".into();
//! config.scan.high_volume_table = Some("tblWebEvents".into());
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! MirrorConfig
//! ├── origin: OriginConfig          # API base URL, token, timeout
//! ├── rate_limit: RateLimitConfig   # account-wide sliding window
//! ├── webhooks: WebhookConfig       # subscription creation + cleanup opt-in
//! ├── queue: QueueConfig            # apply attempts, retry backoff, drain timeout
//! ├── scan: ScanConfig              # full scan retries, heartbeat, ordering
//! ├── schedule: ScheduleConfig      # tick, staleness threshold, request polling
//! └── store: StoreConfig            # SQLite mirror database
//! ```
//!
//! # YAML Example
//!
//! ```yaml
//! origin:
//!   api_base_url: "https://api.airtable.com/v0"
//!   access_token: "pat..."
//! rate_limit:
//!   max_requests: 5
//!   window: "1s"
//! webhooks:
//!   allow_destructive_cleanup: false
//! schedule:
//!   tick_interval: "5s"
//!   stale_threshold: "24h"
//! store:
//!   sqlite_path: "/var/lib/app/mirror.db"
//! ```

use crate::resilience::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::time::Duration;

fn parse_or(value: &str, fallback: Duration) -> Duration {
    humantime::parse_duration(value).unwrap_or(fallback)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config
// ═══════════════════════════════════════════════════════════════════════════════

/// The top-level config object passed to `MirrorSyncEngine::new()`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MirrorConfig {
    #[serde(default)]
    pub origin: OriginConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub webhooks: WebhookConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub scan: ScanConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub store: StoreConfig,
}

impl MirrorConfig {
    /// Create a config with short timings and an in-memory store.
    pub fn for_testing() -> Self {
        Self {
            origin: OriginConfig::default(),
            rate_limit: RateLimitConfig::unlimited(),
            webhooks: WebhookConfig::for_testing(),
            queue: QueueConfig::for_testing(),
            scan: ScanConfig::for_testing(),
            schedule: ScheduleConfig::for_testing(),
            store: StoreConfig::in_memory(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// OriginConfig: REST endpoint of the origin service
// ═══════════════════════════════════════════════════════════════════════════════

/// Connection settings for the origin service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OriginConfig {
    /// Base URL including the API version segment.
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,

    /// Personal access token sent as a bearer token.
    #[serde(default, skip_serializing)]
    pub access_token: String,

    /// Per-request timeout as a duration string.
    #[serde(default = "default_request_timeout")]
    pub request_timeout: String,
}

fn default_api_base_url() -> String {
    "https://api.airtable.com/v0".to_string()
}

fn default_request_timeout() -> String {
    "30s".to_string()
}

impl Default for OriginConfig {
    fn default() -> Self {
        Self {
            api_base_url: default_api_base_url(),
            access_token: String::new(),
            request_timeout: default_request_timeout(),
        }
    }
}

impl OriginConfig {
    pub fn request_timeout_duration(&self) -> Duration {
        parse_or(&self.request_timeout, Duration::from_secs(30))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// RateLimitConfig: one budget per origin account
// ═══════════════════════════════════════════════════════════════════════════════

/// Sliding-window rate limit shared by every origin call.
///
/// At most `max_requests` calls are admitted in any rolling `window`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_max_requests")]
    pub max_requests: usize,

    /// Window length as a duration string (e.g., "1s").
    #[serde(default = "default_window")]
    pub window: String,
}

fn default_max_requests() -> usize {
    5 // origin allows 5 req/s per account
}

fn default_window() -> String {
    "1s".to_string()
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: default_max_requests(),
            window: default_window(),
        }
    }
}

impl RateLimitConfig {
    pub fn new(max_requests: usize, window: Duration) -> Self {
        Self {
            max_requests,
            window: humantime::format_duration(window).to_string(),
        }
    }

    /// Effectively no limit, for tests.
    pub fn unlimited() -> Self {
        Self {
            max_requests: 1_000_000,
            window: "1ms".to_string(),
        }
    }

    pub fn window_duration(&self) -> Duration {
        parse_or(&self.window, Duration::from_secs(1))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// WebhookConfig: subscription lifecycle
// ═══════════════════════════════════════════════════════════════════════════════

/// Subscription management settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    /// Attempts when creating a subscription.
    #[serde(default = "default_creation_attempts")]
    pub creation_attempts: usize,

    /// Linear backoff step: attempt `n` waits `n * step`.
    #[serde(default = "default_creation_backoff_step")]
    pub creation_backoff_step: String,

    /// Delete every subscription on a base when the origin's subscription
    /// limit is hit. Destroys other consumers' subscriptions; off by default.
    #[serde(default = "default_false")]
    pub allow_destructive_cleanup: bool,
}

fn default_creation_attempts() -> usize {
    3
}

fn default_creation_backoff_step() -> String {
    "1s".to_string()
}

fn default_false() -> bool {
    false
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            creation_attempts: 3,
            creation_backoff_step: default_creation_backoff_step(),
            allow_destructive_cleanup: false,
        }
    }
}

impl WebhookConfig {
    pub fn for_testing() -> Self {
        Self {
            creation_attempts: 3,
            creation_backoff_step: "1ms".to_string(),
            allow_destructive_cleanup: false,
        }
    }

    pub fn creation_backoff_step_duration(&self) -> Duration {
        parse_or(&self.creation_backoff_step, Duration::from_secs(1))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// QueueConfig: applying change actions
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Attempts per action before it is dropped with an alert.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the first retry of a failed action. Doubles per attempt.
    #[serde(default = "default_retry_initial_delay")]
    pub retry_initial_delay: String,

    /// Cap on the delay between retries.
    #[serde(default = "default_retry_max_delay")]
    pub retry_max_delay: String,

    /// How long to wait for the queue to empty after a full sync.
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout: String,
}

fn default_max_attempts() -> u32 {
    5
}

fn default_retry_initial_delay() -> String {
    "2s".to_string()
}

fn default_retry_max_delay() -> String {
    "1m".to_string()
}

fn default_drain_timeout() -> String {
    "10m".to_string()
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            retry_initial_delay: default_retry_initial_delay(),
            retry_max_delay: default_retry_max_delay(),
            drain_timeout: default_drain_timeout(),
        }
    }
}

impl QueueConfig {
    pub fn for_testing() -> Self {
        Self {
            max_attempts: 3,
            retry_initial_delay: "20ms".to_string(),
            retry_max_delay: "100ms".to_string(),
            drain_timeout: "5s".to_string(),
        }
    }

    pub fn retry_initial_delay_duration(&self) -> Duration {
        parse_or(&self.retry_initial_delay, Duration::from_secs(2))
    }

    pub fn retry_max_delay_duration(&self) -> Duration {
        parse_or(&self.retry_max_delay, Duration::from_secs(60))
    }

    /// Backoff between attempts to apply one queued action.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::exponential(
            self.max_attempts.max(1) as usize,
            self.retry_initial_delay_duration(),
            self.retry_max_delay_duration(),
        )
    }

    pub fn drain_timeout_duration(&self) -> Duration {
        parse_or(&self.drain_timeout, Duration::from_secs(600))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ScanConfig: full table scans
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanConfig {
    /// Scan attempts per table before the table is abandoned.
    #[serde(default = "default_scan_max_retries")]
    pub max_retries: usize,

    /// Fixed delay between scan attempts.
    #[serde(default = "default_scan_retry_delay")]
    pub retry_delay: String,

    /// Heartbeat log interval while a table is being processed.
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval: String,

    /// Tables with more records than this log periodic progress.
    #[serde(default = "default_progress_threshold")]
    pub progress_threshold: usize,

    /// Progress line every N records for large tables.
    #[serde(default = "default_progress_every")]
    pub progress_every: usize,

    /// Origin table id scanned before every other table.
    #[serde(default)]
    pub high_volume_table: Option<String>,
}

fn default_scan_max_retries() -> usize {
    3
}

fn default_scan_retry_delay() -> String {
    "1s".to_string()
}

fn default_heartbeat_interval() -> String {
    "10s".to_string()
}

fn default_progress_threshold() -> usize {
    10_000
}

fn default_progress_every() -> usize {
    5_000
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay: default_scan_retry_delay(),
            heartbeat_interval: default_heartbeat_interval(),
            progress_threshold: 10_000,
            progress_every: 5_000,
            high_volume_table: None,
        }
    }
}

impl ScanConfig {
    pub fn for_testing() -> Self {
        Self {
            retry_delay: "1ms".to_string(),
            heartbeat_interval: "50ms".to_string(),
            ..Self::default()
        }
    }

    pub fn retry_delay_duration(&self) -> Duration {
        parse_or(&self.retry_delay, Duration::from_secs(1))
    }

    pub fn heartbeat_interval_duration(&self) -> Duration {
        parse_or(&self.heartbeat_interval, Duration::from_secs(10))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ScheduleConfig: periodic work
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    /// Interval between poll-and-drain ticks.
    #[serde(default = "default_tick_interval")]
    pub tick_interval: String,

    /// A full sync is needed when the last sync is older than this.
    #[serde(default = "default_stale_threshold")]
    pub stale_threshold: String,

    /// How often manual re-sync requests are checked.
    #[serde(default = "default_request_poll_interval")]
    pub request_poll_interval: String,
}

fn default_tick_interval() -> String {
    "5s".to_string()
}

fn default_stale_threshold() -> String {
    "24h".to_string()
}

fn default_request_poll_interval() -> String {
    "30s".to_string()
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            tick_interval: default_tick_interval(),
            stale_threshold: default_stale_threshold(),
            request_poll_interval: default_request_poll_interval(),
        }
    }
}

impl ScheduleConfig {
    pub fn for_testing() -> Self {
        Self {
            tick_interval: "20ms".to_string(),
            stale_threshold: "24h".to_string(),
            request_poll_interval: "20ms".to_string(),
        }
    }

    pub fn tick_interval_duration(&self) -> Duration {
        parse_or(&self.tick_interval, Duration::from_secs(5))
    }

    pub fn stale_threshold_duration(&self) -> Duration {
        parse_or(&self.stale_threshold, Duration::from_secs(24 * 3600))
    }

    pub fn request_poll_interval_duration(&self) -> Duration {
        parse_or(&self.request_poll_interval, Duration::from_secs(30))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// StoreConfig: SQLite mirror database
// ═══════════════════════════════════════════════════════════════════════════════

/// Mirror database settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Path to the SQLite database, or `:memory:`.
    pub sqlite_path: String,

    /// Whether to use WAL mode (recommended for file databases).
    #[serde(default = "default_true")]
    pub wal_mode: bool,
}

fn default_true() -> bool {
    true
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            sqlite_path: "mirror.db".to_string(),
            wal_mode: true,
        }
    }
}

impl StoreConfig {
    pub fn in_memory() -> Self {
        Self {
            sqlite_path: ":memory:".to_string(),
            wal_mode: false,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = MirrorConfig::default();
        assert_eq!(config.origin.api_base_url, "https://api.airtable.com/v0");
        assert_eq!(config.rate_limit.max_requests, 5);
        assert_eq!(config.rate_limit.window_duration(), Duration::from_secs(1));
        assert_eq!(config.webhooks.creation_attempts, 3);
        assert!(!config.webhooks.allow_destructive_cleanup);
        assert_eq!(config.queue.max_attempts, 5);
        assert_eq!(config.queue.retry_initial_delay_duration(), Duration::from_secs(2));
        assert_eq!(config.scan.max_retries, 3);
        assert_eq!(config.scan.heartbeat_interval_duration(), Duration::from_secs(10));
        assert_eq!(config.scan.progress_threshold, 10_000);
        assert_eq!(config.scan.progress_every, 5_000);
        assert_eq!(config.schedule.stale_threshold_duration(), Duration::from_secs(86_400));
        assert_eq!(config.store.sqlite_path, "mirror.db");
    }

    #[test]
    fn test_duration_parsing_various_formats() {
        let test_cases = [
            ("5s", Duration::from_secs(5)),
            ("1m", Duration::from_secs(60)),
            ("500ms", Duration::from_millis(500)),
            ("48h", Duration::from_secs(48 * 3600)),
        ];

        for (input, expected) in test_cases {
            let config = ScheduleConfig {
                tick_interval: input.to_string(),
                ..Default::default()
            };
            assert_eq!(config.tick_interval_duration(), expected, "Failed for input: {}", input);
        }
    }

    #[test]
    fn test_invalid_duration_falls_back() {
        let config = QueueConfig {
            drain_timeout: "soon".to_string(),
            ..Default::default()
        };
        assert_eq!(config.drain_timeout_duration(), Duration::from_secs(600));
    }

    #[test]
    fn test_queue_retry_policy_doubles_and_caps() {
        let policy = QueueConfig::default().retry_policy();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(8));
        assert_eq!(policy.delay_for_attempt(10), Duration::from_secs(60));
    }

    #[test]
    fn test_rate_limit_new_round_trips_window() {
        let config = RateLimitConfig::new(2, Duration::from_millis(500));
        assert_eq!(config.max_requests, 2);
        assert_eq!(config.window_duration(), Duration::from_millis(500));
    }

    #[test]
    fn test_deserialize_partial_yaml_like_json() {
        let json = r#"{
            "webhooks": { "allow_destructive_cleanup": true },
            "scan": { "high_volume_table": "tblEvents" },
            "store": { "sqlite_path": "/tmp/m.db" }
        }"#;
        let config: MirrorConfig = serde_json::from_str(json).unwrap();
        assert!(config.webhooks.allow_destructive_cleanup);
        assert_eq!(config.webhooks.creation_attempts, 3);
        assert_eq!(config.scan.high_volume_table.as_deref(), Some("tblEvents"));
        assert!(config.store.wal_mode);
        assert_eq!(config.schedule.tick_interval, "5s");
    }

    #[test]
    fn test_access_token_not_serialized() {
        let mut config = MirrorConfig::default();
        config.origin.access_token = "secret".to_string();
        let json = serde_json::to_string(&config).unwrap();
        assert!(!json.contains("secret"));
    }

    #[test]
    fn test_for_testing_is_fast() {
        let config = MirrorConfig::for_testing();
        assert_eq!(config.store.sqlite_path, ":memory:");
        assert!(config.scan.retry_delay_duration() < Duration::from_millis(10));
        assert!(config.webhooks.creation_backoff_step_duration() < Duration::from_millis(10));
    }
}
