//! Engine state and report types.
//!
//! # State Transitions
//!
//! ```text
//!                  start()
//! Created ───────────────────→ Starting
//!    │                              │
//!    │ (shutdown before start)      │ (schema reconciled, tasks spawned)
//!    ↓                              ↓
//! Stopped                       Running
//!    ↑                              │
//!    │                    shutdown()│
//!    │                              ↓
//!    └────────────────── ShuttingDown
//!
//! Starting ──(schema reconciliation failed)──→ Failed
//! ```
//!
//! # State Descriptions
//!
//! - **Created**: Initial state after construction. No background tasks.
//! - **Starting**: `start()` called; reconciling schema, adopting subscriptions.
//! - **Running**: Tick and request tasks active. Initial full sync (if needed)
//!   runs while in this state.
//! - **ShuttingDown**: `shutdown()` called. Background tasks are finishing.
//! - **Stopped**: Store closed. Safe to drop.
//! - **Failed**: Startup failed. Check logs for details.

use crate::queue::{DrainReport, QueueStatus};
use crate::sync_state::SyncMetadata;
use crate::webhook::CaptureState;

/// State of the sync engine.
///
/// See module docs for the state transition diagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Engine created but not started.
    Created,

    /// Reconciling schema and adopting subscriptions.
    Starting,

    /// Ticking: polling bases and draining the queue.
    Running,

    /// Shutting down gracefully.
    ShuttingDown,

    /// Stopped. Safe to drop.
    Stopped,

    /// Failed to start.
    Failed,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineState::Created => write!(f, "Created"),
            EngineState::Starting => write!(f, "Starting"),
            EngineState::Running => write!(f, "Running"),
            EngineState::ShuttingDown => write!(f, "ShuttingDown"),
            EngineState::Stopped => write!(f, "Stopped"),
            EngineState::Failed => write!(f, "Failed"),
        }
    }
}

/// What one call to `tick()` did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// A previous tick still holds the webhook registry.
    Skipped,
    Completed {
        /// Deduplicated actions pulled from every base.
        actions_polled: usize,
        /// Bases whose poll failed.
        failed_bases: usize,
        drain: DrainReport,
    },
}

/// Change capture status of one base.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BaseHealth {
    pub base_id: String,
    pub state: CaptureState,
    pub subscription_id: Option<String>,
    pub cursor: Option<u64>,
}

/// Health snapshot for monitoring endpoints.
///
/// Performs no origin calls; sync metadata is read from the local store.
#[derive(Debug, Clone)]
pub struct HealthCheck {
    pub state: EngineState,
    /// Engine is running.
    pub ready: bool,
    /// Ready and the last full sync did not fail.
    pub healthy: bool,
    pub queue: QueueStatus,
    /// `None` while a tick holds the registry.
    pub bases: Option<Vec<BaseHealth>>,
    /// Origin calls admitted in the current rate-limit window.
    pub rate_limit_in_flight: usize,
    pub sync: Option<SyncMetadata>,
}
