// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Sync lifecycle state, persisted as a singleton metadata row.
//!
//! ```text
//!                mark_sync_started()
//!   NeverSynced ─────────────────────▶ InProgress
//!                                       │      │
//!                 mark_sync_completed() │      │ mark_sync_failed(reason)
//!                                       ▼      ▼
//!                               Completed      Failed
//! ```
//!
//! `Stale` is derived, not stored: the most recent sync (incremental if one
//! was recorded, else full) is older than the threshold. A sync that has
//! claimed to be in progress for longer than the threshold counts as stuck
//! and is treated as stale too.
//!
//! Every update is an idempotent `INSERT .. ON CONFLICT DO UPDATE` on the
//! row with id `singleton`, so the row is created on first use.

use crate::error::Result;
use crate::store::{execute_with_retry, MirrorStore};
use chrono::{DateTime, Utc};
use sqlx::Row;
use std::time::Duration;
use tracing::{debug, info, warn};

const SYNC_METADATA_ID: &str = "singleton";

/// Status recorded by the last lifecycle transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    InProgress,
    Success,
    Failed,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InProgress => "in_progress",
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "in_progress" => Some(Self::InProgress),
            "success" => Some(Self::Success),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle phase derived from the metadata row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    NeverSynced,
    InProgress,
    Completed,
    Failed,
}

/// The singleton sync metadata row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncMetadata {
    pub sync_in_progress: bool,
    pub last_full_sync_at: Option<DateTime<Utc>>,
    pub last_incremental_sync_at: Option<DateTime<Utc>>,
    pub last_status: Option<SyncStatus>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SyncMetadata {
    pub fn phase(&self) -> SyncPhase {
        match self.last_status {
            _ if self.sync_in_progress => SyncPhase::InProgress,
            Some(SyncStatus::Failed) => SyncPhase::Failed,
            _ if self.last_full_sync_at.is_some() => SyncPhase::Completed,
            _ => SyncPhase::NeverSynced,
        }
    }

    /// Most recent sync of either kind.
    pub fn last_sync_at(&self) -> Option<DateTime<Utc>> {
        self.last_incremental_sync_at.or(self.last_full_sync_at)
    }
}

fn from_millis(ms: Option<i64>) -> Option<DateTime<Utc>> {
    ms.and_then(DateTime::from_timestamp_millis)
}

/// Reads and writes the sync metadata row.
#[derive(Debug, Clone)]
pub struct SyncStateManager {
    store: MirrorStore,
    threshold: Duration,
}

impl SyncStateManager {
    pub fn new(store: MirrorStore, threshold: Duration) -> Self {
        Self { store, threshold }
    }

    pub fn threshold(&self) -> Duration {
        self.threshold
    }

    /// Whether a full sync should run now.
    ///
    /// Never fails: a metadata read error means "yes".
    pub async fn is_initial_sync_needed(&self) -> bool {
        let metadata = match self.get_sync_metadata().await {
            Ok(Some(metadata)) => metadata,
            Ok(None) => {
                info!("No sync metadata, initial sync needed");
                return true;
            }
            Err(e) => {
                warn!(error = %e, "Failed to read sync metadata, assuming sync needed");
                return true;
            }
        };

        if metadata.last_full_sync_at.is_none() {
            info!("No completed full sync on record");
            return true;
        }

        let Some(last_sync) = metadata.last_sync_at() else {
            return true;
        };
        // Negative when the clock moved backwards; treat as fresh
        let age = Utc::now()
            .signed_duration_since(last_sync)
            .to_std()
            .unwrap_or(Duration::ZERO);

        if age > self.threshold {
            if metadata.sync_in_progress {
                warn!(
                    age_secs = age.as_secs(),
                    "Sync has been in progress past the stale threshold, treating as stuck"
                );
            } else {
                info!(age_secs = age.as_secs(), "Last sync is stale");
            }
            return true;
        }

        debug!(age_secs = age.as_secs(), "Mirror is fresh");
        false
    }

    pub async fn mark_sync_started(&self) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        let pool = self.store.pool();
        execute_with_retry("mark_sync_started", || async move {
            sqlx::query(
                r#"
                INSERT INTO sync_metadata (id, sync_in_progress, last_status, last_error, created_at, updated_at)
                VALUES (?, 1, ?, NULL, ?, ?)
                ON CONFLICT(id) DO UPDATE SET
                    sync_in_progress = 1,
                    last_status = excluded.last_status,
                    last_error = NULL,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(SYNC_METADATA_ID)
            .bind(SyncStatus::InProgress.as_str())
            .bind(now)
            .bind(now)
            .execute(pool)
            .await
        })
        .await?;
        debug!("Sync marked started");
        Ok(())
    }

    /// Stamps both the full and incremental timestamps.
    pub async fn mark_sync_completed(&self) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        let pool = self.store.pool();
        execute_with_retry("mark_sync_completed", || async move {
            sqlx::query(
                r#"
                INSERT INTO sync_metadata
                    (id, sync_in_progress, last_full_sync_at, last_incremental_sync_at,
                     last_status, last_error, created_at, updated_at)
                VALUES (?, 0, ?, ?, ?, NULL, ?, ?)
                ON CONFLICT(id) DO UPDATE SET
                    sync_in_progress = 0,
                    last_full_sync_at = excluded.last_full_sync_at,
                    last_incremental_sync_at = excluded.last_incremental_sync_at,
                    last_status = excluded.last_status,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(SYNC_METADATA_ID)
            .bind(now)
            .bind(now)
            .bind(SyncStatus::Success.as_str())
            .bind(now)
            .bind(now)
            .execute(pool)
            .await
        })
        .await?;
        debug!("Sync marked completed");
        Ok(())
    }

    pub async fn mark_sync_failed(&self, reason: &str) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        let pool = self.store.pool();
        execute_with_retry("mark_sync_failed", || async move {
            sqlx::query(
                r#"
                INSERT INTO sync_metadata (id, sync_in_progress, last_status, last_error, created_at, updated_at)
                VALUES (?, 0, ?, ?, ?, ?)
                ON CONFLICT(id) DO UPDATE SET
                    sync_in_progress = 0,
                    last_status = excluded.last_status,
                    last_error = excluded.last_error,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(SYNC_METADATA_ID)
            .bind(SyncStatus::Failed.as_str())
            .bind(reason)
            .bind(now)
            .bind(now)
            .execute(pool)
            .await
        })
        .await?;
        debug!(reason, "Sync marked failed");
        Ok(())
    }

    /// Stamp the incremental timestamp. Failures are logged only.
    pub async fn mark_incremental_sync(&self) {
        let now = Utc::now().timestamp_millis();
        let pool = self.store.pool();
        let result = execute_with_retry("mark_incremental_sync", || async move {
            sqlx::query(
                r#"
                INSERT INTO sync_metadata (id, sync_in_progress, last_incremental_sync_at, created_at, updated_at)
                VALUES (?, 0, ?, ?, ?)
                ON CONFLICT(id) DO UPDATE SET
                    last_incremental_sync_at = excluded.last_incremental_sync_at,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(SYNC_METADATA_ID)
            .bind(now)
            .bind(now)
            .bind(now)
            .execute(pool)
            .await
        })
        .await;

        if let Err(e) = result {
            warn!(error = %e, "Failed to record incremental sync");
        }
    }

    pub async fn get_sync_metadata(&self) -> Result<Option<SyncMetadata>> {
        let row = sqlx::query(
            r#"
            SELECT sync_in_progress, last_full_sync_at, last_incremental_sync_at,
                   last_status, last_error, created_at, updated_at
            FROM sync_metadata WHERE id = ?
            "#,
        )
        .bind(SYNC_METADATA_ID)
        .fetch_optional(self.store.pool())
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let created: i64 = row.try_get("created_at")?;
        let updated: i64 = row.try_get("updated_at")?;
        let status: Option<String> = row.try_get("last_status")?;

        Ok(Some(SyncMetadata {
            sync_in_progress: row.try_get::<i64, _>("sync_in_progress")? != 0,
            last_full_sync_at: from_millis(row.try_get("last_full_sync_at")?),
            last_incremental_sync_at: from_millis(row.try_get("last_incremental_sync_at")?),
            last_status: status.as_deref().and_then(SyncStatus::parse),
            last_error: row.try_get("last_error")?,
            created_at: from_millis(Some(created)).unwrap_or_default(),
            updated_at: from_millis(Some(updated)).unwrap_or_default(),
        }))
    }
}
