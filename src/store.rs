// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQLite mirror store.
//!
//! Holds the mirror tables plus the engine's own bookkeeping tables:
//!
//! | Table | Owner | Contents |
//! |-------|-------|----------|
//! | `mirror_field_mappings` | [`crate::schema`] | Active mapping set |
//! | `sync_metadata` | [`crate::sync_state`] | Singleton lifecycle row |
//! | `sync_requests` | [`crate::requests`] | Manual re-sync requests |
//! | one per [`TableMapping`] | [`crate::replication`] | Mirrored records |
//!
//! Every mirror column is `TEXT`; the primary key `id` holds the origin
//! record id. Mirror writes go through a transaction so a failed upsert
//! leaves the previous row intact.
//!
//! # SQLite Busy Handling
//!
//! SQLite can return SQLITE_BUSY/SQLITE_LOCKED when the database is
//! contended. Writes retry with exponential backoff (10ms doubling to 500ms,
//! 5 attempts) before surfacing the error.

use crate::config::StoreConfig;
use crate::error::{MirrorError, Result};
use crate::mapping::{FieldMappingRow, TableMapping, ID_COLUMN};
use crate::origin::Record;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Configuration for SQLite busy retry behavior
const SQLITE_RETRY_MAX_ATTEMPTS: u32 = 5;
const SQLITE_RETRY_BASE_DELAY_MS: u64 = 10;
const SQLITE_RETRY_MAX_DELAY_MS: u64 = 500;

pub(crate) const FIELD_MAPPINGS_TABLE: &str = "mirror_field_mappings";

/// A mirror row: column name to text value, `id` included.
pub type MirrorRow = BTreeMap<String, Option<String>>;

/// Check if an error is a retryable SQLite busy/locked error
fn is_sqlite_busy_error(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db_err) => {
            // SQLite error codes: SQLITE_BUSY = 5, SQLITE_LOCKED = 6
            if let Some(code) = db_err.code() {
                return code == "5" || code == "6";
            }
            let msg = db_err.message().to_lowercase();
            msg.contains("database is locked") || msg.contains("database is busy")
        }
        _ => false,
    }
}

/// Execute a database operation with retry on SQLITE_BUSY/SQLITE_LOCKED
pub(crate) async fn execute_with_retry<F, Fut, T>(
    operation_name: &str,
    mut f: F,
) -> std::result::Result<T, sqlx::Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, sqlx::Error>>,
{
    let mut attempts = 0;
    let mut delay_ms = SQLITE_RETRY_BASE_DELAY_MS;

    loop {
        attempts += 1;
        match f().await {
            Ok(result) => {
                if attempts > 1 {
                    debug!(operation = operation_name, attempts, "SQLite operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(e) if is_sqlite_busy_error(&e) && attempts < SQLITE_RETRY_MAX_ATTEMPTS => {
                warn!(
                    operation = operation_name,
                    attempts,
                    max_attempts = SQLITE_RETRY_MAX_ATTEMPTS,
                    delay_ms,
                    "SQLite busy, retrying"
                );
                crate::metrics::record_mirror_retry(operation_name);
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                delay_ms = (delay_ms * 2).min(SQLITE_RETRY_MAX_DELAY_MS);
            }
            Err(e) => {
                if is_sqlite_busy_error(&e) {
                    warn!(operation = operation_name, attempts, "SQLite busy, max retries exceeded");
                }
                return Err(e);
            }
        }
    }
}

/// Quote a validated identifier.
fn quote(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// The mirror database.
///
/// Cheap to clone; clones share the pool.
#[derive(Debug, Clone)]
pub struct MirrorStore {
    pool: SqlitePool,
    path: String,
}

impl MirrorStore {
    /// Open (creating if missing) the database described by `config`.
    pub async fn open(config: &StoreConfig) -> Result<Self> {
        let path = config.sqlite_path.clone();
        if path == ":memory:" {
            return Self::in_memory().await;
        }
        info!(path = %path, "Opening mirror store");

        let journal = if config.wal_mode {
            sqlx::sqlite::SqliteJournalMode::Wal
        } else {
            sqlx::sqlite::SqliteJournalMode::Delete
        };
        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", path))
            .map_err(|e| MirrorError::Config(format!("Invalid SQLite path: {}", e)))?
            .journal_mode(journal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5))
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        let store = Self { pool, path };
        store.init_schema().await?;
        Ok(store)
    }

    /// A private in-memory database. One connection, kept open for the pool's lifetime.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| MirrorError::Config(format!("Invalid SQLite path: {}", e)))?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let store = Self {
            pool,
            path: ":memory:".to_string(),
        };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<()> {
        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {} (
                base_id TEXT NOT NULL,
                table_id TEXT NOT NULL,
                field_id TEXT NOT NULL,
                mirror_table TEXT NOT NULL,
                mirror_column TEXT NOT NULL,
                enabled INTEGER NOT NULL,
                PRIMARY KEY (base_id, table_id, field_id)
            )
            "#,
            FIELD_MAPPINGS_TABLE
        ))
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sync_metadata (
                id TEXT PRIMARY KEY,
                sync_in_progress INTEGER NOT NULL DEFAULT 0,
                last_full_sync_at INTEGER,
                last_incremental_sync_at INTEGER,
                last_status TEXT,
                last_error TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sync_requests (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                requested_by TEXT NOT NULL,
                status TEXT NOT NULL,
                requested_at INTEGER NOT NULL,
                started_at INTEGER,
                completed_at INTEGER
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Get database path (for diagnostics).
    pub fn path(&self) -> &str {
        &self.path
    }

    // =========================================================================
    // DDL
    // =========================================================================

    pub async fn table_exists(&self, table: &str) -> Result<bool> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?")
            .bind(table)
            .fetch_one(&self.pool)
            .await?;
        Ok(count > 0)
    }

    pub async fn table_columns(&self, table: &str) -> Result<BTreeSet<String>> {
        let names: Vec<String> = sqlx::query_scalar("SELECT name FROM pragma_table_info(?)")
            .bind(table)
            .fetch_all(&self.pool)
            .await?;
        Ok(names.into_iter().collect())
    }

    /// Create the mirror table for a mapping. Required columns are `NOT NULL`.
    pub async fn create_table(&self, mapping: &TableMapping) -> Result<()> {
        let mut columns = vec![format!("{} TEXT PRIMARY KEY NOT NULL", quote(ID_COLUMN))];
        for col in &mapping.columns {
            let null = if col.nullable { "" } else { " NOT NULL" };
            columns.push(format!("{} TEXT{}", quote(&col.column), null));
        }
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {} ({})",
            quote(&mapping.mirror_table),
            columns.join(", ")
        );
        sqlx::query(&sql).execute(&self.pool).await?;
        info!(table = %mapping.mirror_table, columns = mapping.columns.len(), "Created mirror table");
        Ok(())
    }

    /// Add a column to an existing table.
    ///
    /// SQLite cannot add a `NOT NULL` column without a default, so added
    /// columns are always nullable.
    pub async fn add_column(&self, table: &str, column: &str) -> Result<()> {
        let sql = format!("ALTER TABLE {} ADD COLUMN {} TEXT", quote(table), quote(column));
        sqlx::query(&sql).execute(&self.pool).await?;
        info!(table, column, "Added mirror column");
        Ok(())
    }

    // =========================================================================
    // Mirror rows
    // =========================================================================

    /// Insert or update the row for `record` in one transaction.
    pub async fn upsert_row(&self, mapping: &TableMapping, record: &Record) -> Result<()> {
        let row = mapping.record_to_row(record);
        let table = quote(&mapping.mirror_table);

        let mut names = vec![quote(ID_COLUMN)];
        names.extend(row.iter().map(|(c, _)| quote(c)));
        let placeholders = vec!["?"; names.len()].join(", ");
        let conflict = if row.is_empty() {
            "DO NOTHING".to_string()
        } else {
            let sets: Vec<String> = row
                .iter()
                .map(|(c, _)| format!("{0} = excluded.{0}", quote(c)))
                .collect();
            format!("DO UPDATE SET {}", sets.join(", "))
        };
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT({}) {}",
            table,
            names.join(", "),
            placeholders,
            quote(ID_COLUMN),
            conflict
        );

        let pool = &self.pool;
        let sql = &sql;
        let row = &row;
        execute_with_retry("upsert_row", || async move {
            let mut tx = pool.begin().await?;
            let mut query = sqlx::query(sql).bind(&record.id);
            for (_, value) in row {
                query = query.bind(value.as_deref());
            }
            query.execute(&mut *tx).await?;
            tx.commit().await
        })
        .await?;

        debug!(table = %mapping.mirror_table, record_id = %record.id, "Upserted mirror row");
        Ok(())
    }

    /// Delete a row in one transaction. Returns whether it existed.
    pub async fn delete_row(&self, mapping: &TableMapping, record_id: &str) -> Result<bool> {
        let sql = format!("DELETE FROM {} WHERE {} = ?", quote(&mapping.mirror_table), quote(ID_COLUMN));
        let pool = &self.pool;
        let sql = &sql;
        let affected = execute_with_retry("delete_row", || async move {
            let mut tx = pool.begin().await?;
            let result = sqlx::query(sql).bind(record_id).execute(&mut *tx).await?;
            tx.commit().await?;
            Ok(result.rows_affected())
        })
        .await?;

        debug!(table = %mapping.mirror_table, record_id, existed = affected > 0, "Deleted mirror row");
        Ok(affected > 0)
    }

    /// Read one row back, active and retired columns included.
    pub async fn fetch_row(&self, mapping: &TableMapping, record_id: &str) -> Result<Option<MirrorRow>> {
        let mut columns = vec![ID_COLUMN.to_string()];
        columns.extend(mapping.columns.iter().map(|c| c.column.clone()));
        let select: Vec<String> = columns.iter().map(|c| quote(c)).collect();
        let sql = format!(
            "SELECT {} FROM {} WHERE {} = ?",
            select.join(", "),
            quote(&mapping.mirror_table),
            quote(ID_COLUMN)
        );

        let Some(row) = sqlx::query(&sql)
            .bind(record_id)
            .fetch_optional(&self.pool)
            .await?
        else {
            return Ok(None);
        };

        let mut out = MirrorRow::new();
        for column in columns {
            let value: Option<String> = row.try_get(column.as_str())?;
            out.insert(column, value);
        }
        Ok(Some(out))
    }

    pub async fn count_rows(&self, mapping: &TableMapping) -> Result<i64> {
        let sql = format!("SELECT COUNT(*) FROM {}", quote(&mapping.mirror_table));
        let count: i64 = sqlx::query_scalar(&sql).fetch_one(&self.pool).await?;
        Ok(count)
    }

    // =========================================================================
    // Field-mapping metadata
    // =========================================================================

    /// Replace the metadata table contents in one transaction.
    pub async fn replace_field_mappings(&self, rows: &[FieldMappingRow]) -> Result<()> {
        let pool = &self.pool;
        let delete_sql = format!("DELETE FROM {}", FIELD_MAPPINGS_TABLE);
        let insert_sql = format!(
            "INSERT INTO {} (base_id, table_id, field_id, mirror_table, mirror_column, enabled) \
             VALUES (?, ?, ?, ?, ?, ?)",
            FIELD_MAPPINGS_TABLE
        );
        let (delete_sql, insert_sql) = (&delete_sql, &insert_sql);

        execute_with_retry("replace_field_mappings", || async move {
            let mut tx = pool.begin().await?;
            sqlx::query(delete_sql).execute(&mut *tx).await?;
            for row in rows {
                sqlx::query(insert_sql)
                    .bind(&row.base_id)
                    .bind(&row.table_id)
                    .bind(&row.field_id)
                    .bind(&row.mirror_table)
                    .bind(&row.mirror_column)
                    .bind(row.enabled)
                    .execute(&mut *tx)
                    .await?;
            }
            tx.commit().await
        })
        .await?;

        info!(rows = rows.len(), "Rebuilt field mapping metadata");
        Ok(())
    }

    /// Every stored metadata row, sorted.
    pub async fn field_mappings(&self) -> Result<Vec<FieldMappingRow>> {
        let rows: Vec<(String, String, String, String, String, bool)> = sqlx::query_as(&format!(
            "SELECT base_id, table_id, field_id, mirror_table, mirror_column, enabled FROM {} \
             ORDER BY base_id, table_id, field_id",
            FIELD_MAPPINGS_TABLE
        ))
        .fetch_all(&self.pool)
        .await?;

        let mut out: Vec<FieldMappingRow> = rows
            .into_iter()
            .map(
                |(base_id, table_id, field_id, mirror_table, mirror_column, enabled)| FieldMappingRow {
                    base_id,
                    table_id,
                    field_id,
                    mirror_table,
                    mirror_column,
                    enabled,
                },
            )
            .collect();
        out.sort();
        Ok(out)
    }

    /// Force flush WAL to main database (for clean shutdown).
    pub async fn checkpoint(&self) -> Result<()> {
        let pool = &self.pool;
        execute_with_retry("checkpoint", || async {
            sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)").execute(pool).await
        })
        .await?;
        debug!("WAL checkpoint complete");
        Ok(())
    }

    /// Checkpoint and close the pool.
    pub async fn close(&self) {
        if let Err(e) = self.checkpoint().await {
            warn!(error = %e, "Failed to checkpoint WAL on close");
        }
        self.pool.close().await;
        info!("Mirror store closed");
    }
}
