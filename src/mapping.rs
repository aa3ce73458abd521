//! Table mappings between origin fields and mirror columns.
//!
//! A [`TableMapping`] ties one mirror table to one origin table and maps each
//! mirror column to an origin field id. Mappings are declared once at process
//! start and collected in a [`MappingRegistry`], which validates them and is
//! immutable afterwards.
//!
//! ```rust
//! use mirror_sync::mapping::{MappingRegistry, TableMapping};
//!
//! let courses = TableMapping::new("courses", "appBase1", "tblCourses")
//!     .required_column("name", "fldName")
//!     .column("credits", "fldCredits")
//!     .retired_column("legacy_code", "fldLegacy");
//!
//! let registry = MappingRegistry::new(vec![courses]).unwrap();
//! assert!(registry.get("appBase1", "tblCourses").is_some());
//! ```

use crate::error::{MirrorError, Result};
use crate::origin::{Fields, Record, TableRef};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

/// Mirror column values keyed by column name.
pub type ColumnData = serde_json::Map<String, Value>;

/// Name of the primary key column every mirror table carries.
pub const ID_COLUMN: &str = "id";

/// Whether `name` is a plain SQL identifier (`[A-Za-z_][A-Za-z0-9_]*`).
pub fn is_plain_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Mirror values are text. Strings verbatim, other JSON as its JSON text.
pub fn value_to_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// One mirror column bound to one origin field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnMapping {
    pub column: String,
    pub field_id: String,
    pub nullable: bool,
    /// The origin guarantees a value for every record.
    #[serde(default)]
    pub always_populated: bool,
    /// Deprecated mapping kept for the metadata table; never synced.
    #[serde(default)]
    pub retired: bool,
}

/// Mapping of one mirror table to one origin table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableMapping {
    pub mirror_table: String,
    pub base_id: String,
    pub table_id: String,
    pub columns: Vec<ColumnMapping>,
}

impl TableMapping {
    pub fn new(mirror_table: impl Into<String>, base_id: impl Into<String>, table_id: impl Into<String>) -> Self {
        Self {
            mirror_table: mirror_table.into(),
            base_id: base_id.into(),
            table_id: table_id.into(),
            columns: Vec::new(),
        }
    }

    /// Add a nullable column.
    pub fn column(mut self, column: impl Into<String>, field_id: impl Into<String>) -> Self {
        self.columns.push(ColumnMapping {
            column: column.into(),
            field_id: field_id.into(),
            nullable: true,
            always_populated: false,
            retired: false,
        });
        self
    }

    /// Add a NOT NULL column for a field the origin always populates.
    pub fn required_column(mut self, column: impl Into<String>, field_id: impl Into<String>) -> Self {
        self.columns.push(ColumnMapping {
            column: column.into(),
            field_id: field_id.into(),
            nullable: false,
            always_populated: true,
            retired: false,
        });
        self
    }

    /// Add a retired column. Written to metadata as disabled; never synced.
    pub fn retired_column(mut self, column: impl Into<String>, field_id: impl Into<String>) -> Self {
        self.columns.push(ColumnMapping {
            column: column.into(),
            field_id: field_id.into(),
            nullable: true,
            always_populated: false,
            retired: true,
        });
        self
    }

    pub fn table_ref(&self) -> TableRef {
        TableRef::new(&self.base_id, &self.table_id)
    }

    /// Columns that are synced.
    pub fn active_columns(&self) -> impl Iterator<Item = &ColumnMapping> {
        self.columns.iter().filter(|c| !c.retired)
    }

    /// Field ids of active columns.
    pub fn tracked_field_ids(&self) -> BTreeSet<String> {
        self.active_columns().map(|c| c.field_id.clone()).collect()
    }

    pub fn field_for_column(&self, column: &str) -> Option<&str> {
        self.active_columns()
            .find(|c| c.column == column)
            .map(|c| c.field_id.as_str())
    }

    pub fn column_for_field(&self, field_id: &str) -> Option<&str> {
        self.active_columns()
            .find(|c| c.field_id == field_id)
            .map(|c| c.column.as_str())
    }

    /// Check identifiers and nullability rules.
    pub fn validate(&self) -> Result<()> {
        let name = &self.mirror_table;
        if !is_plain_identifier(name) {
            return Err(MirrorError::Mapping(format!("invalid mirror table name '{}'", name)));
        }
        if self.base_id.is_empty() || self.table_id.is_empty() {
            return Err(MirrorError::Mapping(format!("{}: base and table ids are required", name)));
        }

        let mut columns = BTreeSet::new();
        let mut fields = BTreeSet::new();
        for col in &self.columns {
            if !is_plain_identifier(&col.column) {
                return Err(MirrorError::Mapping(format!("{}: invalid column name '{}'", name, col.column)));
            }
            if col.column == ID_COLUMN {
                return Err(MirrorError::Mapping(format!("{}: column '{}' is reserved", name, ID_COLUMN)));
            }
            if col.field_id.is_empty() {
                return Err(MirrorError::Mapping(format!("{}.{}: missing field id", name, col.column)));
            }
            if !columns.insert(col.column.as_str()) {
                return Err(MirrorError::Mapping(format!("{}: duplicate column '{}'", name, col.column)));
            }
            if !fields.insert(col.field_id.as_str()) {
                return Err(MirrorError::Mapping(format!("{}: field '{}' mapped twice", name, col.field_id)));
            }
            if col.retired && !col.nullable {
                return Err(MirrorError::Mapping(format!(
                    "{}.{}: retired columns must be nullable",
                    name, col.column
                )));
            }
            if !col.nullable && !col.always_populated {
                return Err(MirrorError::Mapping(format!(
                    "{}.{}: NOT NULL requires a field the origin always populates",
                    name, col.column
                )));
            }
        }
        Ok(())
    }

    /// Mirror row for a record: every active column, absent fields as NULL.
    pub fn record_to_row(&self, record: &Record) -> Vec<(String, Option<String>)> {
        self.active_columns()
            .map(|c| {
                let value = record.fields.get(&c.field_id).and_then(value_to_text);
                (c.column.clone(), value)
            })
            .collect()
    }

    /// Origin fields for column-keyed data. Unknown or retired columns are rejected.
    pub fn data_to_fields(&self, data: &ColumnData) -> Result<Fields> {
        let mut fields = Fields::new();
        for (column, value) in data {
            if column == ID_COLUMN {
                continue;
            }
            let field_id = self.field_for_column(column).ok_or_else(|| {
                MirrorError::Mapping(format!("{}: no active mapping for column '{}'", self.mirror_table, column))
            })?;
            fields.insert(field_id.to_string(), value.clone());
        }
        Ok(fields)
    }

    /// Metadata rows for this mapping, retired columns disabled.
    pub fn to_rows(&self) -> Vec<FieldMappingRow> {
        self.columns
            .iter()
            .map(|c| FieldMappingRow {
                base_id: self.base_id.clone(),
                table_id: self.table_id.clone(),
                field_id: c.field_id.clone(),
                mirror_table: self.mirror_table.clone(),
                mirror_column: c.column.clone(),
                enabled: !c.retired,
            })
            .collect()
    }
}

/// One row of the field-mapping metadata table.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FieldMappingRow {
    pub base_id: String,
    pub table_id: String,
    pub field_id: String,
    pub mirror_table: String,
    pub mirror_column: String,
    pub enabled: bool,
}

/// Every declared table mapping, validated.
#[derive(Debug, Clone, Default)]
pub struct MappingRegistry {
    tables: Vec<TableMapping>,
    by_origin: BTreeMap<(String, String), usize>,
    by_mirror: BTreeMap<String, usize>,
}

impl MappingRegistry {
    pub fn new(tables: Vec<TableMapping>) -> Result<Self> {
        let mut by_origin = BTreeMap::new();
        let mut by_mirror = BTreeMap::new();

        for (idx, mapping) in tables.iter().enumerate() {
            mapping.validate()?;
            let origin_key = (mapping.base_id.clone(), mapping.table_id.clone());
            if by_origin.insert(origin_key, idx).is_some() {
                return Err(MirrorError::Mapping(format!(
                    "origin table {} mapped twice",
                    mapping.table_ref()
                )));
            }
            if by_mirror.insert(mapping.mirror_table.clone(), idx).is_some() {
                return Err(MirrorError::Mapping(format!(
                    "mirror table '{}' declared twice",
                    mapping.mirror_table
                )));
            }
        }

        Ok(Self {
            tables,
            by_origin,
            by_mirror,
        })
    }

    pub fn get(&self, base_id: &str, table_id: &str) -> Option<&TableMapping> {
        self.by_origin
            .get(&(base_id.to_string(), table_id.to_string()))
            .map(|idx| &self.tables[*idx])
    }

    pub fn by_mirror_table(&self, mirror_table: &str) -> Option<&TableMapping> {
        self.by_mirror.get(mirror_table).map(|idx| &self.tables[*idx])
    }

    pub fn iter(&self) -> impl Iterator<Item = &TableMapping> {
        self.tables.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// Distinct bases, sorted.
    pub fn base_ids(&self) -> BTreeSet<String> {
        self.tables.iter().map(|t| t.base_id.clone()).collect()
    }

    /// Active field ids across every mapped table of a base.
    pub fn tracked_fields_for_base(&self, base_id: &str) -> BTreeSet<String> {
        self.tables
            .iter()
            .filter(|t| t.base_id == base_id)
            .flat_map(|t| t.tracked_field_ids())
            .collect()
    }

    /// The full metadata row set, sorted.
    pub fn to_rows(&self) -> Vec<FieldMappingRow> {
        let mut rows: Vec<FieldMappingRow> = self.tables.iter().flat_map(|t| t.to_rows()).collect();
        rows.sort();
        rows
    }
}
