// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replication core: keeps one mirror row in step with one origin record.
//!
//! Two entry points:
//!
//! - **Write-through** (`write_through_*`): the caller changes a record. The
//!   origin is written first, then the mirror row is upserted or deleted in a
//!   transaction. If the mirror write fails the origin change stands and
//!   [`MirrorError::MirrorWrite`] is returned.
//! - **Apply** ([`Replicator::apply_action`]): a queued [`ChangeAction`] is
//!   brought into the mirror, reading the record from the origin unless the
//!   action already carries it.
//!
//! ```text
//! write_through_update(mapping, id, data)
//!     │  columns → field ids
//!     ▼
//! origin.update_record ──▶ record returned? ──no──▶ origin.get_record
//!     │                          │ yes
//!     ▼                          ▼
//!                 BEGIN; INSERT ... ON CONFLICT(id) DO UPDATE; COMMIT
//! ```

use crate::error::{MirrorError, Result};
use crate::mapping::{ColumnData, MappingRegistry, TableMapping};
use crate::origin::{BoxFuture, OriginClient, Record, WriteReceipt};
use crate::queue::{ActionSink, ChangeAction};
use crate::store::MirrorStore;
use std::sync::Arc;
use tracing::{debug, warn};

/// What applying an action did to the mirror.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Upserted,
    /// Row removed (or already absent).
    Deleted,
    /// No mapping for the action's table.
    Unmapped,
}

impl ApplyOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Upserted => "upserted",
            Self::Deleted => "deleted",
            Self::Unmapped => "unmapped",
        }
    }
}

/// Origin-then-mirror writer.
pub struct Replicator<O> {
    origin: Arc<O>,
    store: MirrorStore,
}

impl<O> Clone for Replicator<O> {
    fn clone(&self) -> Self {
        Self {
            origin: Arc::clone(&self.origin),
            store: self.store.clone(),
        }
    }
}

impl<O: OriginClient> Replicator<O> {
    pub fn new(origin: Arc<O>, store: MirrorStore) -> Self {
        Self { origin, store }
    }

    pub fn store(&self) -> &MirrorStore {
        &self.store
    }

    /// Create a record at the origin, then mirror it.
    pub async fn write_through_insert(&self, mapping: &TableMapping, data: &ColumnData) -> Result<Record> {
        let fields = mapping.data_to_fields(data)?;
        let receipt = self.origin.insert_record(&mapping.table_ref(), fields).await?;
        let record = self.resolve_receipt(mapping, receipt).await?;
        self.mirror_upsert(mapping, &record).await?;
        Ok(record)
    }

    /// Update a record at the origin, then mirror it.
    pub async fn write_through_update(
        &self,
        mapping: &TableMapping,
        record_id: &str,
        data: &ColumnData,
    ) -> Result<Record> {
        let fields = mapping.data_to_fields(data)?;
        let receipt = self
            .origin
            .update_record(&mapping.table_ref(), record_id, fields)
            .await?;
        let record = self.resolve_receipt(mapping, receipt).await?;
        self.mirror_upsert(mapping, &record).await?;
        Ok(record)
    }

    /// Delete a record at the origin, then from the mirror.
    ///
    /// Returns whether a mirror row existed.
    pub async fn write_through_delete(&self, mapping: &TableMapping, record_id: &str) -> Result<bool> {
        self.origin.delete_record(&mapping.table_ref(), record_id).await?;
        self.store
            .delete_row(mapping, record_id)
            .await
            .map_err(|e| mirror_write_error(mapping, record_id, e))
    }

    /// Bring one queued change into the mirror.
    pub async fn apply_action(&self, mapping: &TableMapping, action: &ChangeAction) -> Result<ApplyOutcome> {
        if action.is_delete {
            self.store.delete_row(mapping, &action.record_id).await?;
            return Ok(ApplyOutcome::Deleted);
        }

        let record = match &action.record {
            Some(record) => Some(record.clone()),
            None => {
                self.origin
                    .get_record(&mapping.table_ref(), &action.record_id)
                    .await?
            }
        };

        match record {
            Some(record) => {
                self.store.upsert_row(mapping, &record).await?;
                Ok(ApplyOutcome::Upserted)
            }
            None => {
                debug!(
                    table = %mapping.mirror_table,
                    record_id = %action.record_id,
                    "Record gone from origin, deleting mirror row"
                );
                self.store.delete_row(mapping, &action.record_id).await?;
                Ok(ApplyOutcome::Deleted)
            }
        }
    }

    /// The written record, reading it back when the origin did not return it.
    async fn resolve_receipt(&self, mapping: &TableMapping, receipt: WriteReceipt) -> Result<Record> {
        if let Some(record) = receipt.record {
            return Ok(record);
        }
        self.origin
            .get_record(&mapping.table_ref(), &receipt.id)
            .await?
            .ok_or_else(|| {
                MirrorError::origin(
                    "get_record",
                    Some(404),
                    format!("record {} missing right after write", receipt.id),
                )
            })
    }

    async fn mirror_upsert(&self, mapping: &TableMapping, record: &Record) -> Result<()> {
        self.store
            .upsert_row(mapping, record)
            .await
            .map_err(|e| mirror_write_error(mapping, &record.id, e))
    }
}

fn mirror_write_error(mapping: &TableMapping, record_id: &str, e: MirrorError) -> MirrorError {
    warn!(
        table = %mapping.mirror_table,
        record_id,
        error = %e,
        "Mirror write failed after origin write"
    );
    MirrorError::MirrorWrite {
        table: mapping.mirror_table.clone(),
        record_id: record_id.to_string(),
        message: e.to_string(),
    }
}

/// [`ActionSink`] resolving each action's mapping from the registry.
pub struct MirrorApplier<O> {
    replicator: Replicator<O>,
    registry: Arc<MappingRegistry>,
}

impl<O: OriginClient> MirrorApplier<O> {
    pub fn new(replicator: Replicator<O>, registry: Arc<MappingRegistry>) -> Self {
        Self { replicator, registry }
    }
}

impl<O: OriginClient> ActionSink for MirrorApplier<O> {
    fn apply<'a>(&'a self, action: &'a ChangeAction) -> BoxFuture<'a, ApplyOutcome> {
        Box::pin(async move {
            match self.registry.get(&action.base_id, &action.table_id) {
                Some(mapping) => self.replicator.apply_action(mapping, action).await,
                None => Ok(ApplyOutcome::Unmapped),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::origin::{Fields, NoOpOrigin};
    use serde_json::json;

    fn courses() -> TableMapping {
        TableMapping::new("courses", "app1", "tbl1")
            .column("name", "fldName")
            .column("credits", "fldCredits")
    }

    async fn setup() -> Replicator<NoOpOrigin> {
        let store = MirrorStore::in_memory().await.unwrap();
        store.create_table(&courses()).await.unwrap();
        Replicator::new(Arc::new(NoOpOrigin), store)
    }

    fn data(pairs: &[(&str, serde_json::Value)]) -> ColumnData {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[tokio::test]
    async fn test_write_through_insert_mirrors_returned_record() {
        let replicator = setup().await;
        let mapping = courses();

        let record = replicator
            .write_through_insert(&mapping, &data(&[("name", json!("Algebra"))]))
            .await
            .unwrap();

        let row = replicator.store().fetch_row(&mapping, &record.id).await.unwrap().unwrap();
        assert_eq!(row["name"].as_deref(), Some("Algebra"));
        assert_eq!(row["credits"], None);
    }

    #[tokio::test]
    async fn test_write_through_update_and_delete() {
        let replicator = setup().await;
        let mapping = courses();

        replicator
            .write_through_update(&mapping, "rec1", &data(&[("credits", json!(5))]))
            .await
            .unwrap();
        let row = replicator.store().fetch_row(&mapping, "rec1").await.unwrap().unwrap();
        assert_eq!(row["credits"].as_deref(), Some("5"));

        assert!(replicator.write_through_delete(&mapping, "rec1").await.unwrap());
        assert!(!replicator.write_through_delete(&mapping, "rec1").await.unwrap());
    }

    #[tokio::test]
    async fn test_write_through_unknown_column_never_reaches_origin() {
        let replicator = setup().await;
        let err = replicator
            .write_through_insert(&courses(), &data(&[("nope", json!(1))]))
            .await
            .unwrap_err();
        assert!(matches!(err, MirrorError::Mapping(_)));
    }

    #[tokio::test]
    async fn test_mirror_failure_after_origin_write_raises() {
        let replicator = Replicator::new(Arc::new(NoOpOrigin), MirrorStore::in_memory().await.unwrap());
        // Mirror table never created
        let err = replicator
            .write_through_update(&courses(), "rec1", &data(&[("name", json!("x"))]))
            .await
            .unwrap_err();
        match err {
            MirrorError::MirrorWrite { table, record_id, .. } => {
                assert_eq!(table, "courses");
                assert_eq!(record_id, "rec1");
            }
            other => panic!("expected MirrorWrite, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_apply_uses_attached_record() {
        let replicator = setup().await;
        let mapping = courses();
        let mut fields = Fields::new();
        fields.insert("fldName".into(), json!("Geometry"));
        let action = ChangeAction::upsert("app1", "tbl1", "rec9").with_record(Record::new("rec9", fields));

        let outcome = replicator.apply_action(&mapping, &action).await.unwrap();
        assert_eq!(outcome, ApplyOutcome::Upserted);
        let row = replicator.store().fetch_row(&mapping, "rec9").await.unwrap().unwrap();
        assert_eq!(row["name"].as_deref(), Some("Geometry"));
    }

    #[tokio::test]
    async fn test_apply_deletes_when_origin_has_no_record() {
        let replicator = setup().await;
        let mapping = courses();
        let record = Record::new("rec1", Fields::new());
        replicator.store().upsert_row(&mapping, &record).await.unwrap();

        // NoOpOrigin::get_record returns None
        let outcome = replicator
            .apply_action(&mapping, &ChangeAction::upsert("app1", "tbl1", "rec1"))
            .await
            .unwrap();
        assert_eq!(outcome, ApplyOutcome::Deleted);
        assert!(replicator.store().fetch_row(&mapping, "rec1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_apply_delete_action() {
        let replicator = setup().await;
        let mapping = courses();
        replicator
            .store()
            .upsert_row(&mapping, &Record::new("rec1", Fields::new()))
            .await
            .unwrap();

        let outcome = replicator
            .apply_action(&mapping, &ChangeAction::delete("app1", "tbl1", "rec1"))
            .await
            .unwrap();
        assert_eq!(outcome, ApplyOutcome::Deleted);
        assert_eq!(replicator.store().count_rows(&mapping).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_applier_reports_unmapped() {
        let replicator = setup().await;
        let registry = Arc::new(MappingRegistry::new(vec![courses()]).unwrap());
        let applier = MirrorApplier::new(replicator, registry);

        let outcome = applier
            .apply(&ChangeAction::upsert("app1", "tblOther", "rec1"))
            .await
            .unwrap();
        assert_eq!(outcome, ApplyOutcome::Unmapped);
    }
}
