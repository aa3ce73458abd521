//! Manual re-sync requests.
//!
//! An operator dashboard inserts `queued` rows; the engine claims every
//! queued row when a full sync starts and completes exactly the rows it
//! claimed. Rows submitted after that point stay queued for the next sync.
//!
//! ```text
//! queued ──claim_queued()──▶ running ──complete()──▶ completed
//!                               │
//!                               └──reset_to_queued()──▶ queued   (sync failed)
//! ```

use crate::error::Result;
use crate::store::{execute_with_retry, MirrorStore};
use chrono::{DateTime, Utc};
use sqlx::Row;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    Queued,
    Running,
    Completed,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "running" => Self::Running,
            "completed" => Self::Completed,
            _ => Self::Queued,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncRequest {
    pub id: i64,
    pub requested_by: String,
    pub status: RequestStatus,
    pub requested_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Access to the `sync_requests` table.
#[derive(Debug, Clone)]
pub struct SyncRequestStore {
    store: MirrorStore,
}

impl SyncRequestStore {
    pub fn new(store: MirrorStore) -> Self {
        Self { store }
    }

    /// Queue a request. Returns its id.
    pub async fn submit(&self, requested_by: &str) -> Result<i64> {
        let now = Utc::now().timestamp_millis();
        let pool = self.store.pool();
        let result = execute_with_retry("submit_sync_request", || async move {
            sqlx::query("INSERT INTO sync_requests (requested_by, status, requested_at) VALUES (?, ?, ?)")
                .bind(requested_by)
                .bind(RequestStatus::Queued.as_str())
                .bind(now)
                .execute(pool)
                .await
        })
        .await?;
        Ok(result.last_insert_rowid())
    }

    /// Queued requests, oldest first.
    pub async fn queued(&self) -> Result<Vec<SyncRequest>> {
        self.fetch("WHERE status = 'queued' ORDER BY id").await
    }

    pub async fn get(&self, id: i64) -> Result<Option<SyncRequest>> {
        let pool = self.store.pool();
        let row = sqlx::query(
            "SELECT id, requested_by, status, requested_at, started_at, completed_at FROM sync_requests WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(pool)
        .await?;
        row.map(|r| request_from_row(&r)).transpose()
    }

    async fn fetch(&self, clause: &str) -> Result<Vec<SyncRequest>> {
        let sql = format!(
            "SELECT id, requested_by, status, requested_at, started_at, completed_at FROM sync_requests {}",
            clause
        );
        let rows = sqlx::query(&sql).fetch_all(self.store.pool()).await?;
        rows.iter().map(request_from_row).collect()
    }

    /// Move every queued request to `running` and return the claimed ids.
    ///
    /// Select and update happen in one transaction, so a request submitted
    /// concurrently is either claimed or left queued, never half-claimed.
    pub async fn claim_queued(&self) -> Result<Vec<i64>> {
        let now = Utc::now().timestamp_millis();
        let mut tx = self.store.pool().begin().await?;

        let ids: Vec<i64> = sqlx::query("SELECT id FROM sync_requests WHERE status = 'queued' ORDER BY id")
            .fetch_all(&mut *tx)
            .await?
            .iter()
            .map(|r| r.try_get::<i64, _>("id"))
            .collect::<std::result::Result<_, _>>()?;

        for id in &ids {
            sqlx::query("UPDATE sync_requests SET status = ?, started_at = ? WHERE id = ?")
                .bind(RequestStatus::Running.as_str())
                .bind(now)
                .bind(*id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;

        if !ids.is_empty() {
            debug!(count = ids.len(), "Claimed queued sync requests");
        }
        Ok(ids)
    }

    pub async fn complete(&self, ids: &[i64]) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        self.set_status(ids, RequestStatus::Completed, Some(now)).await
    }

    /// Return claimed requests to the queue after a failed sync.
    pub async fn reset_to_queued(&self, ids: &[i64]) -> Result<()> {
        self.set_status(ids, RequestStatus::Queued, None).await
    }

    async fn set_status(&self, ids: &[i64], status: RequestStatus, completed_at: Option<i64>) -> Result<()> {
        let pool = self.store.pool();
        for &id in ids {
            execute_with_retry("update_sync_request", || async move {
                let query = match status {
                    RequestStatus::Queued => {
                        sqlx::query("UPDATE sync_requests SET status = ?, started_at = NULL WHERE id = ?")
                            .bind(status.as_str())
                            .bind(id)
                    }
                    _ => sqlx::query("UPDATE sync_requests SET status = ?, completed_at = ? WHERE id = ?")
                        .bind(status.as_str())
                        .bind(completed_at)
                        .bind(id),
                };
                query.execute(pool).await
            })
            .await?;
        }
        Ok(())
    }
}

fn request_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<SyncRequest> {
    let status: String = row.try_get("status")?;
    let requested_at: i64 = row.try_get("requested_at")?;
    let started_at: Option<i64> = row.try_get("started_at")?;
    let completed_at: Option<i64> = row.try_get("completed_at")?;
    Ok(SyncRequest {
        id: row.try_get("id")?,
        requested_by: row.try_get("requested_by")?,
        status: RequestStatus::parse(&status),
        requested_at: DateTime::from_timestamp_millis(requested_at).unwrap_or_default(),
        started_at: started_at.and_then(DateTime::from_timestamp_millis),
        completed_at: completed_at.and_then(DateTime::from_timestamp_millis),
    })
}
