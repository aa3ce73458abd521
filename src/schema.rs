//! Schema collaborator: make the mirror match the declared mappings.
//!
//! The engine only asks one question, "is the schema current, and did you
//! have to change anything?". A `true` answer means mirror contents may be
//! incomplete (new tables or columns), so the engine follows up with a full
//! sync.

use crate::mapping::MappingRegistry;
use crate::origin::BoxFuture;
use crate::store::MirrorStore;
use std::sync::Arc;
use tracing::{debug, info};

/// Applies the declared schema to the mirror.
pub trait SchemaReconciler: Send + Sync + 'static {
    /// Returns whether any change was applied.
    fn ensure_schema_up_to_date(&self) -> BoxFuture<'_, bool>;
}

impl<T: SchemaReconciler> SchemaReconciler for Arc<T> {
    fn ensure_schema_up_to_date(&self) -> BoxFuture<'_, bool> {
        (**self).ensure_schema_up_to_date()
    }
}

/// Creates missing mirror tables and columns and rebuilds the field-mapping
/// metadata when it differs from the declarations.
///
/// Never drops tables or columns; retired mappings keep their column.
pub struct SqliteSchemaReconciler {
    store: MirrorStore,
    registry: Arc<MappingRegistry>,
}

impl SqliteSchemaReconciler {
    pub fn new(store: MirrorStore, registry: Arc<MappingRegistry>) -> Self {
        Self { store, registry }
    }
}

impl SchemaReconciler for SqliteSchemaReconciler {
    fn ensure_schema_up_to_date(&self) -> BoxFuture<'_, bool> {
        Box::pin(async move {
            let mut changed = false;

            for mapping in self.registry.iter() {
                if !self.store.table_exists(&mapping.mirror_table).await? {
                    self.store.create_table(mapping).await?;
                    changed = true;
                    continue;
                }

                let existing = self.store.table_columns(&mapping.mirror_table).await?;
                for column in &mapping.columns {
                    if !existing.contains(&column.column) {
                        self.store.add_column(&mapping.mirror_table, &column.column).await?;
                        changed = true;
                    }
                }
            }

            let declared = self.registry.to_rows();
            let stored = self.store.field_mappings().await?;
            if declared != stored {
                info!(
                    declared = declared.len(),
                    stored = stored.len(),
                    "Field mappings changed, rebuilding metadata"
                );
                self.store.replace_field_mappings(&declared).await?;
                changed = true;
            }

            debug!(changed, "Schema reconciled");
            Ok(changed)
        })
    }
}
