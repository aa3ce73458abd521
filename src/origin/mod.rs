// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Origin service integration.
//!
//! Defines the contract this crate needs from the origin service (the
//! rate-limited source of truth) as the [`OriginClient`] trait, plus the
//! domain types that flow through it.
//!
//! - [`http::HttpOrigin`]: reqwest client for the REST API
//! - [`throttle::Throttled`]: decorator acquiring the shared rate limiter
//!   before every call
//! - [`NoOpOrigin`]: empty origin for wiring and tests
//!
//! # Example
//!
//! ```rust,no_run
//! # fn main() -> mirror_sync::Result<()> {
//! use mirror_sync::config::MirrorConfig;
//! use mirror_sync::origin::{HttpOrigin, Throttled};
//! use mirror_sync::resilience::RateLimiter;
//! use std::sync::Arc;
//!
//! let config = MirrorConfig::default();
//! let limiter = Arc::new(RateLimiter::from_config(&config.rate_limit));
//! let origin = Throttled::new(HttpOrigin::new(&config.origin)?, limiter);
//! # let _ = origin;
//! # Ok(())
//! # }
//! ```

pub mod http;
pub mod throttle;

use crate::error::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::pin::Pin;

pub use http::HttpOrigin;
pub use throttle::Throttled;

/// Type alias for boxed async futures (reduces trait signature complexity).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Cell values keyed by origin field id.
pub type Fields = serde_json::Map<String, Value>;

/// Change category covering record create/update/delete.
pub const DATA_TYPE_TABLE_DATA: &str = "tableData";
/// Change category covering field create/update/delete.
pub const DATA_TYPE_TABLE_FIELDS: &str = "tableFields";

/// Payload error codes meaning the subscription must be recreated.
const INVALID_SUBSCRIPTION_CODES: &[&str] = &["INVALID_FILTERS", "INVALID_HOOK"];

/// An origin table, addressed by base and table id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TableRef {
    pub base_id: String,
    pub table_id: String,
}

impl TableRef {
    pub fn new(base_id: impl Into<String>, table_id: impl Into<String>) -> Self {
        Self {
            base_id: base_id.into(),
            table_id: table_id.into(),
        }
    }
}

impl std::fmt::Display for TableRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.base_id, self.table_id)
    }
}

/// A record as returned by the origin, cells keyed by field id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: String,
    #[serde(default)]
    pub created_time: Option<String>,
    #[serde(default)]
    pub fields: Fields,
}

impl Record {
    pub fn new(id: impl Into<String>, fields: Fields) -> Self {
        Self {
            id: id.into(),
            created_time: None,
            fields,
        }
    }
}

/// Result of an origin write.
///
/// `record` is the full record when the origin returned one; otherwise the
/// caller reads it back.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteReceipt {
    pub id: String,
    pub record: Option<Record>,
}

/// A live field on an origin table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldInfo {
    pub id: String,
    pub name: String,
}

/// Live field list of one origin table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub table_id: String,
    pub name: String,
    pub fields: Vec<FieldInfo>,
}

/// What a subscription watches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionFilter {
    pub data_types: BTreeSet<String>,
    /// `None` watches every field.
    pub field_ids: Option<BTreeSet<String>>,
}

impl SubscriptionFilter {
    /// Filter watching record data and field changes for `field_ids`.
    ///
    /// An empty set means "no field filter".
    pub fn for_fields(field_ids: &BTreeSet<String>) -> Self {
        Self {
            data_types: [DATA_TYPE_TABLE_DATA, DATA_TYPE_TABLE_FIELDS]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            field_ids: if field_ids.is_empty() {
                None
            } else {
                Some(field_ids.clone())
            },
        }
    }

    /// Whether an existing subscription's filter can stand in for `self`.
    ///
    /// Every desired data type must be watched and the field allowlists
    /// must be identical.
    pub fn is_satisfied_by(&self, existing: &SubscriptionFilter) -> bool {
        self.data_types.is_subset(&existing.data_types) && self.field_ids == existing.field_ids
    }
}

/// An error the origin reported in place of a change payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadError {
    pub code: String,
    #[serde(default)]
    pub message: Option<String>,
}

impl PayloadError {
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: None,
        }
    }

    /// The subscription must be torn down and recreated.
    pub fn is_invalid_subscription(&self) -> bool {
        INVALID_SUBSCRIPTION_CODES.contains(&self.code.as_str())
    }
}

/// A subscription as listed by the origin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: String,
    /// Cursor of the next unread payload.
    pub cursor: u64,
    /// `None` when the subscription uses options this crate does not model.
    pub filter: Option<SubscriptionFilter>,
    /// Error reported by the most recent payload, if it was one.
    #[serde(default)]
    pub last_error: Option<PayloadError>,
    /// Fields the origin reported deleted in that payload.
    #[serde(default)]
    pub deleted_field_ids: BTreeSet<String>,
}

/// Id and starting cursor of a newly created subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewSubscription {
    pub id: String,
    pub cursor: u64,
}

/// Changes to one table within a payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableChanges {
    pub created: Vec<String>,
    /// Record id to the ids of fields whose values changed.
    pub changed: BTreeMap<String, BTreeSet<String>>,
    pub destroyed: Vec<String>,
    pub destroyed_field_ids: Vec<String>,
}

/// One change notification.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChangePayload {
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub error: Option<PayloadError>,
    /// Table id to changes.
    #[serde(default)]
    pub tables: BTreeMap<String, TableChanges>,
}

/// A page of payloads read from a subscription.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangePage {
    pub payloads: Vec<ChangePayload>,
    /// Cursor to resume from.
    pub cursor: u64,
    pub might_have_more: bool,
}

/// One page of a table scan.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordPage {
    pub records: Vec<Record>,
    /// Token for the next page. `None` on the last page.
    pub offset: Option<String>,
}

/// What this crate needs from the origin service.
///
/// Implementations must be cheap to share (`Arc<impl OriginClient>`).
/// Every required method maps to exactly one API call, so a decorator that
/// rate-limits each method call limits every request. `scan_table` is
/// provided on top of `scan_page` and issues one call per page.
pub trait OriginClient: Send + Sync + 'static {
    /// Read one record. `None` when the record no longer exists.
    fn get_record<'a>(&'a self, table: &'a TableRef, record_id: &'a str) -> BoxFuture<'a, Option<Record>>;

    /// One page of a table's records. `offset` is `None` for the first page.
    fn scan_page<'a>(&'a self, table: &'a TableRef, offset: Option<String>) -> BoxFuture<'a, RecordPage>;

    /// Every current record of a table, following page offsets to the end.
    fn scan_table<'a>(&'a self, table: &'a TableRef) -> BoxFuture<'a, Vec<Record>> {
        Box::pin(async move {
            let mut records = Vec::new();
            let mut offset = None;
            loop {
                let page = self.scan_page(table, offset).await?;
                records.extend(page.records);
                match page.offset {
                    Some(next) => offset = Some(next),
                    None => break,
                }
            }
            tracing::debug!(table = %table, count = records.len(), "Scanned origin table");
            Ok(records)
        })
    }

    /// Live field lists for every table in a base.
    fn list_fields<'a>(&'a self, base_id: &'a str) -> BoxFuture<'a, Vec<TableSchema>>;

    fn list_subscriptions<'a>(&'a self, base_id: &'a str) -> BoxFuture<'a, Vec<Subscription>>;

    /// Fails with [`MirrorError::SubscriptionLimit`](crate::MirrorError::SubscriptionLimit)
    /// when the account may not hold another subscription on this base.
    fn create_subscription<'a>(
        &'a self,
        base_id: &'a str,
        filter: &'a SubscriptionFilter,
    ) -> BoxFuture<'a, NewSubscription>;

    fn delete_subscription<'a>(&'a self, base_id: &'a str, subscription_id: &'a str) -> BoxFuture<'a, ()>;

    fn get_change_page<'a>(
        &'a self,
        base_id: &'a str,
        subscription_id: &'a str,
        cursor: u64,
    ) -> BoxFuture<'a, ChangePage>;

    fn insert_record<'a>(&'a self, table: &'a TableRef, fields: Fields) -> BoxFuture<'a, WriteReceipt>;

    fn update_record<'a>(
        &'a self,
        table: &'a TableRef,
        record_id: &'a str,
        fields: Fields,
    ) -> BoxFuture<'a, WriteReceipt>;

    fn delete_record<'a>(&'a self, table: &'a TableRef, record_id: &'a str) -> BoxFuture<'a, ()>;
}

impl<T: OriginClient> OriginClient for std::sync::Arc<T> {
    fn get_record<'a>(&'a self, table: &'a TableRef, record_id: &'a str) -> BoxFuture<'a, Option<Record>> {
        (**self).get_record(table, record_id)
    }

    fn scan_page<'a>(&'a self, table: &'a TableRef, offset: Option<String>) -> BoxFuture<'a, RecordPage> {
        (**self).scan_page(table, offset)
    }

    fn scan_table<'a>(&'a self, table: &'a TableRef) -> BoxFuture<'a, Vec<Record>> {
        (**self).scan_table(table)
    }

    fn list_fields<'a>(&'a self, base_id: &'a str) -> BoxFuture<'a, Vec<TableSchema>> {
        (**self).list_fields(base_id)
    }

    fn list_subscriptions<'a>(&'a self, base_id: &'a str) -> BoxFuture<'a, Vec<Subscription>> {
        (**self).list_subscriptions(base_id)
    }

    fn create_subscription<'a>(
        &'a self,
        base_id: &'a str,
        filter: &'a SubscriptionFilter,
    ) -> BoxFuture<'a, NewSubscription> {
        (**self).create_subscription(base_id, filter)
    }

    fn delete_subscription<'a>(&'a self, base_id: &'a str, subscription_id: &'a str) -> BoxFuture<'a, ()> {
        (**self).delete_subscription(base_id, subscription_id)
    }

    fn get_change_page<'a>(
        &'a self,
        base_id: &'a str,
        subscription_id: &'a str,
        cursor: u64,
    ) -> BoxFuture<'a, ChangePage> {
        (**self).get_change_page(base_id, subscription_id, cursor)
    }

    fn insert_record<'a>(&'a self, table: &'a TableRef, fields: Fields) -> BoxFuture<'a, WriteReceipt> {
        (**self).insert_record(table, fields)
    }

    fn update_record<'a>(
        &'a self,
        table: &'a TableRef,
        record_id: &'a str,
        fields: Fields,
    ) -> BoxFuture<'a, WriteReceipt> {
        (**self).update_record(table, record_id, fields)
    }

    fn delete_record<'a>(&'a self, table: &'a TableRef, record_id: &'a str) -> BoxFuture<'a, ()> {
        (**self).delete_record(table, record_id)
    }
}

/// A no-op origin for wiring and standalone mode.
///
/// Holds no records and never reports changes. Writes are echoed back.
#[derive(Debug, Clone, Default)]
pub struct NoOpOrigin;

impl OriginClient for NoOpOrigin {
    fn get_record<'a>(&'a self, table: &'a TableRef, record_id: &'a str) -> BoxFuture<'a, Option<Record>> {
        Box::pin(async move {
            tracing::trace!(table = %table, record_id, "NoOp: get_record (returning None)");
            Ok(None)
        })
    }

    fn scan_page<'a>(&'a self, _table: &'a TableRef, _offset: Option<String>) -> BoxFuture<'a, RecordPage> {
        Box::pin(async { Ok(RecordPage::default()) })
    }

    fn list_fields<'a>(&'a self, _base_id: &'a str) -> BoxFuture<'a, Vec<TableSchema>> {
        Box::pin(async { Ok(Vec::new()) })
    }

    fn list_subscriptions<'a>(&'a self, _base_id: &'a str) -> BoxFuture<'a, Vec<Subscription>> {
        Box::pin(async { Ok(Vec::new()) })
    }

    fn create_subscription<'a>(
        &'a self,
        base_id: &'a str,
        _filter: &'a SubscriptionFilter,
    ) -> BoxFuture<'a, NewSubscription> {
        Box::pin(async move {
            Ok(NewSubscription {
                id: format!("noop-{}", base_id),
                cursor: 1,
            })
        })
    }

    fn delete_subscription<'a>(&'a self, _base_id: &'a str, _subscription_id: &'a str) -> BoxFuture<'a, ()> {
        Box::pin(async { Ok(()) })
    }

    fn get_change_page<'a>(
        &'a self,
        _base_id: &'a str,
        _subscription_id: &'a str,
        cursor: u64,
    ) -> BoxFuture<'a, ChangePage> {
        Box::pin(async move {
            Ok(ChangePage {
                payloads: Vec::new(),
                cursor,
                might_have_more: false,
            })
        })
    }

    fn insert_record<'a>(&'a self, table: &'a TableRef, fields: Fields) -> BoxFuture<'a, WriteReceipt> {
        Box::pin(async move {
            tracing::debug!(table = %table, field_count = fields.len(), "NoOp: would insert record");
            let id = format!("recNoOp{}", fields.len());
            Ok(WriteReceipt {
                record: Some(Record::new(id.clone(), fields)),
                id,
            })
        })
    }

    fn update_record<'a>(
        &'a self,
        table: &'a TableRef,
        record_id: &'a str,
        fields: Fields,
    ) -> BoxFuture<'a, WriteReceipt> {
        Box::pin(async move {
            tracing::debug!(table = %table, record_id, "NoOp: would update record");
            Ok(WriteReceipt {
                id: record_id.to_string(),
                record: Some(Record::new(record_id, fields)),
            })
        })
    }

    fn delete_record<'a>(&'a self, table: &'a TableRef, record_id: &'a str) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            tracing::debug!(table = %table, record_id, "NoOp: would delete record");
            Ok(())
        })
    }
}
