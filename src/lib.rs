//! # Mirror Sync
//!
//! Keeps a SQLite mirror consistent with a rate-limited, eventually consistent
//! origin record service (bases of tables of records).
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────────┐
//! │                              mirror-sync                                  │
//! │                                                                           │
//! │  ┌────────────────┐   ┌──────────────┐   ┌──────────────────────────────┐ │
//! │  │ WebhookCapture │──►│ UpdateQueue  │──►│ Replicator (origin → mirror) │ │
//! │  │ (per base)     │   │ high │ low   │   │ upsert / delete in a tx      │ │
//! │  └────────────────┘   └──────────────┘   └──────────────────────────────┘ │
//! │         ▲                    ▲                          │                 │
//! │         │             ┌──────────────┐                  ▼                 │
//! │         │             │ Scanner      │          ┌──────────────┐          │
//! │         │             │ (full scans) │          │ MirrorStore  │          │
//! │         │             └──────────────┘          │ (SQLite)     │          │
//! │         │                    │                  └──────────────┘          │
//! │  ┌──────┴────────────────────┴───┐                                        │
//! │  │ Throttled origin (RateLimiter)│                                        │
//! │  └───────────────────────────────┘                                        │
//! └───────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Two Paths Into the Mirror
//!
//! 1. **Incremental (webhooks)**: every tick reads new change payloads per
//!    base and applies them with high priority
//! 2. **Full sync (scans)**: bootstrap, schema changes, staleness and manual
//!    requests scan every mapped table into the low-priority lane
//!
//! ## Usage
//!
//! ```rust,no_run
//! use mirror_sync::{MappingRegistry, MirrorConfig, MirrorSyncEngine, TableMapping};
//!
//! #[tokio::main]
//! async fn main() -> mirror_sync::Result<()> {
//!     let registry = MappingRegistry::new(vec![
//!         TableMapping::new("courses", "appXXXX", "tblYYYY").column("name", "fldZZZZ"),
//!     ])?;
//!     let engine = MirrorSyncEngine::new(MirrorConfig::default(), registry).await?;
//!
//!     let schema = engine.schema_reconciler();
//!     engine.start(&schema).await?;
//!
//!     // Engine ticks until shutdown
//!     engine.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod alert;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod mapping;
pub mod metrics;
pub mod origin;
pub mod queue;
pub mod replication;
pub mod requests;
pub mod resilience;
pub mod scan;
pub mod schema;
pub mod store;
pub mod sync_state;
pub mod webhook;

// Re-exports for convenience
pub use alert::{AlertLevel, Alerter, TracingAlerter};
pub use config::{MirrorConfig, OriginConfig, QueueConfig, RateLimitConfig, ScanConfig, ScheduleConfig, StoreConfig, WebhookConfig};
pub use coordinator::{EngineState, HealthCheck, MirrorSyncEngine, TickOutcome};
pub use error::{MirrorError, Result};
pub use mapping::{ColumnData, MappingRegistry, TableMapping};
pub use origin::{HttpOrigin, NoOpOrigin, OriginClient, Throttled};
pub use queue::{deduplicate_actions, ChangeAction, Priority, UpdateQueue};
pub use replication::{ApplyOutcome, Replicator};
pub use resilience::{retry_with_backoff, RateLimiter, RetryPolicy};
pub use scan::{FullSyncReport, Scanner};
pub use schema::{SchemaReconciler, SqliteSchemaReconciler};
pub use store::MirrorStore;
pub use sync_state::{SyncMetadata, SyncStateManager};
