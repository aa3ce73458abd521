//! In-memory origin for integration and chaos tests.
//!
//! Holds tables of records, a change log per base that subscriptions read
//! from, and a failure injector keyed by operation name.

use mirror_sync::origin::{
    BoxFuture, ChangePage, ChangePayload, FieldInfo, Fields, NewSubscription, OriginClient, Record,
    RecordPage, Subscription, SubscriptionFilter, TableChanges, TableRef, TableSchema, WriteReceipt,
};
use mirror_sync::{MirrorError, Result};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug)]
struct MockSubscription {
    id: String,
    filter: SubscriptionFilter,
    /// 1-based position of the next unread payload in the base's log.
    cursor: u64,
}

#[derive(Debug, Default)]
struct BaseState {
    /// Table id to field ids.
    schema: BTreeMap<String, Vec<String>>,
    tables: BTreeMap<String, BTreeMap<String, Record>>,
    log: Vec<ChangePayload>,
    subscriptions: Vec<MockSubscription>,
}

#[derive(Debug, Default)]
struct State {
    bases: BTreeMap<String, BaseState>,
    /// Operation (or `scan_page:<table_id>`) to remaining failures.
    failures: HashMap<String, (usize, Option<u16>)>,
    /// Operation to the end of its outage window.
    outages: HashMap<String, (Instant, Option<u16>)>,
    calls: Vec<String>,
    next_id: u64,
    subscription_limit: Option<usize>,
}

/// Scriptable origin. Share it as `Arc<InMemoryOrigin>`.
#[derive(Debug)]
pub struct InMemoryOrigin {
    state: Mutex<State>,
    page_size: usize,
    echo_records: bool,
}

impl Default for InMemoryOrigin {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryOrigin {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            page_size: 2,
            echo_records: true,
        }
    }

    /// Writes return only the id, forcing a read-back.
    pub fn without_echo(mut self) -> Self {
        self.echo_records = false;
        self
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    // -------------------------------------------------------------------------
    // Scripting
    // -------------------------------------------------------------------------

    pub fn define_table(&self, base_id: &str, table_id: &str, field_ids: &[&str]) {
        let mut state = self.state();
        let base = state.bases.entry(base_id.to_string()).or_default();
        base.schema
            .insert(table_id.to_string(), field_ids.iter().map(|f| f.to_string()).collect());
        base.tables.entry(table_id.to_string()).or_default();
    }

    /// Put a record without emitting a change.
    pub fn seed(&self, base_id: &str, table_id: &str, record_id: &str, fields: Fields) {
        let mut state = self.state();
        let base = state.bases.entry(base_id.to_string()).or_default();
        base.tables
            .entry(table_id.to_string())
            .or_default()
            .insert(record_id.to_string(), Record::new(record_id, fields));
    }

    /// Create a record and emit a `created` change.
    pub fn create(&self, base_id: &str, table_id: &str, record_id: &str, fields: Fields) {
        self.seed(base_id, table_id, record_id, fields);
        self.emit(base_id, table_id, |c| c.created.push(record_id.to_string()));
    }

    /// Overwrite some fields and emit a `changed` change naming them.
    pub fn change(&self, base_id: &str, table_id: &str, record_id: &str, fields: Fields) {
        let changed: BTreeSet<String> = fields.keys().cloned().collect();
        {
            let mut state = self.state();
            let base = state.bases.entry(base_id.to_string()).or_default();
            let record = base
                .tables
                .entry(table_id.to_string())
                .or_default()
                .entry(record_id.to_string())
                .or_insert_with(|| Record::new(record_id, Fields::new()));
            record.fields.extend(fields);
        }
        self.emit(base_id, table_id, |c| {
            c.changed.insert(record_id.to_string(), changed);
        });
    }

    /// Remove a record and emit a `destroyed` change.
    pub fn destroy(&self, base_id: &str, table_id: &str, record_id: &str) {
        {
            let mut state = self.state();
            if let Some(table) = state
                .bases
                .get_mut(base_id)
                .and_then(|b| b.tables.get_mut(table_id))
            {
                table.remove(record_id);
            }
        }
        self.emit(base_id, table_id, |c| c.destroyed.push(record_id.to_string()));
    }

    /// Remove a field from the schema and emit a field deletion.
    pub fn delete_field(&self, base_id: &str, table_id: &str, field_id: &str) {
        {
            let mut state = self.state();
            if let Some(fields) = state
                .bases
                .get_mut(base_id)
                .and_then(|b| b.schema.get_mut(table_id))
            {
                fields.retain(|f| f != field_id);
            }
        }
        self.emit(base_id, table_id, |c| c.destroyed_field_ids.push(field_id.to_string()));
    }

    /// Append a raw payload to the base's change log.
    pub fn push_payload(&self, base_id: &str, payload: ChangePayload) {
        let mut state = self.state();
        state.bases.entry(base_id.to_string()).or_default().log.push(payload);
    }

    fn emit(&self, base_id: &str, table_id: &str, f: impl FnOnce(&mut TableChanges)) {
        let mut changes = TableChanges::default();
        f(&mut changes);
        let mut payload = ChangePayload::default();
        payload.tables.insert(table_id.to_string(), changes);
        self.push_payload(base_id, payload);
    }

    /// Make the next `times` calls of `operation` fail with `status`.
    ///
    /// `operation` is a trait method name, or `scan_page:<table_id>` to fail
    /// scans of one table only.
    pub fn fail_next(&self, operation: &str, times: usize, status: Option<u16>) {
        self.state().failures.insert(operation.to_string(), (times, status));
    }

    /// Fail every call of `operation` for the next `window`.
    pub fn fail_for(&self, operation: &str, window: Duration, status: Option<u16>) {
        self.state()
            .outages
            .insert(operation.to_string(), (Instant::now() + window, status));
    }

    /// End injected failures of `operation` now.
    pub fn recover(&self, operation: &str) {
        let mut state = self.state();
        state.outages.remove(operation);
        state.failures.remove(operation);
    }

    pub fn set_subscription_limit(&self, limit: usize) {
        self.state().subscription_limit = Some(limit);
    }

    // -------------------------------------------------------------------------
    // Inspection
    // -------------------------------------------------------------------------

    pub fn calls(&self, operation: &str) -> usize {
        self.state().calls.iter().filter(|c| c.as_str() == operation).count()
    }

    pub fn total_calls(&self) -> usize {
        self.state().calls.len()
    }

    pub fn subscription_count(&self, base_id: &str) -> usize {
        self.state()
            .bases
            .get(base_id)
            .map(|b| b.subscriptions.len())
            .unwrap_or(0)
    }

    pub fn subscription_filter(&self, base_id: &str) -> Option<SubscriptionFilter> {
        self.state()
            .bases
            .get(base_id)
            .and_then(|b| b.subscriptions.last())
            .map(|s| s.filter.clone())
    }

    pub fn record(&self, base_id: &str, table_id: &str, record_id: &str) -> Option<Record> {
        self.state()
            .bases
            .get(base_id)
            .and_then(|b| b.tables.get(table_id))
            .and_then(|t| t.get(record_id))
            .cloned()
    }

    // -------------------------------------------------------------------------
    // Plumbing
    // -------------------------------------------------------------------------

    fn enter(&self, operation: &str, scoped: Option<&str>) -> Result<()> {
        let mut state = self.state();
        state.calls.push(operation.to_string());

        for key in scoped.into_iter().chain(std::iter::once(operation)) {
            if let Some((until, status)) = state.outages.get(key) {
                if Instant::now() < *until {
                    return Err(MirrorError::origin(operation, *status, "injected outage"));
                }
            }
            if let Some((remaining, status)) = state.failures.get_mut(key) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(MirrorError::origin(operation, *status, "injected failure"));
                }
            }
        }
        Ok(())
    }

    fn receipt(&self, record: Record) -> WriteReceipt {
        WriteReceipt {
            id: record.id.clone(),
            record: self.echo_records.then_some(record),
        }
    }
}

impl OriginClient for InMemoryOrigin {
    fn get_record<'a>(&'a self, table: &'a TableRef, record_id: &'a str) -> BoxFuture<'a, Option<Record>> {
        Box::pin(async move {
            self.enter("get_record", None)?;
            Ok(self.record(&table.base_id, &table.table_id, record_id))
        })
    }

    /// Whole table in one page.
    fn scan_page<'a>(&'a self, table: &'a TableRef, _offset: Option<String>) -> BoxFuture<'a, RecordPage> {
        Box::pin(async move {
            let scoped = format!("scan_page:{}", table.table_id);
            self.enter("scan_page", Some(&scoped))?;
            let state = self.state();
            let records = state
                .bases
                .get(&table.base_id)
                .and_then(|b| b.tables.get(&table.table_id))
                .ok_or_else(|| MirrorError::origin("scan_page", Some(404), format!("no table {}", table)))?;
            Ok(RecordPage {
                records: records.values().cloned().collect(),
                offset: None,
            })
        })
    }

    fn list_fields<'a>(&'a self, base_id: &'a str) -> BoxFuture<'a, Vec<TableSchema>> {
        Box::pin(async move {
            self.enter("list_fields", None)?;
            let state = self.state();
            let schemas = state
                .bases
                .get(base_id)
                .map(|b| {
                    b.schema
                        .iter()
                        .map(|(table_id, fields)| TableSchema {
                            table_id: table_id.clone(),
                            name: table_id.clone(),
                            fields: fields
                                .iter()
                                .map(|f| FieldInfo {
                                    id: f.clone(),
                                    name: f.clone(),
                                })
                                .collect(),
                        })
                        .collect()
                })
                .unwrap_or_default();
            Ok(schemas)
        })
    }

    fn list_subscriptions<'a>(&'a self, base_id: &'a str) -> BoxFuture<'a, Vec<Subscription>> {
        Box::pin(async move {
            self.enter("list_subscriptions", None)?;
            let state = self.state();
            let subs = state
                .bases
                .get(base_id)
                .map(|b| {
                    b.subscriptions
                        .iter()
                        .map(|s| Subscription {
                            id: s.id.clone(),
                            cursor: s.cursor,
                            filter: Some(s.filter.clone()),
                            last_error: None,
                            deleted_field_ids: BTreeSet::new(),
                        })
                        .collect()
                })
                .unwrap_or_default();
            Ok(subs)
        })
    }

    fn create_subscription<'a>(
        &'a self,
        base_id: &'a str,
        filter: &'a SubscriptionFilter,
    ) -> BoxFuture<'a, NewSubscription> {
        Box::pin(async move {
            self.enter("create_subscription", None)?;
            let mut state = self.state();
            let limit = state.subscription_limit;
            state.next_id += 1;
            let id = format!("ach{}", state.next_id);
            let base = state.bases.entry(base_id.to_string()).or_default();
            if limit.is_some_and(|max| base.subscriptions.len() >= max) {
                return Err(MirrorError::SubscriptionLimit {
                    base_id: base_id.to_string(),
                    message: "too many webhooks".to_string(),
                });
            }
            let cursor = base.log.len() as u64 + 1;
            base.subscriptions.push(MockSubscription {
                id: id.clone(),
                filter: filter.clone(),
                cursor,
            });
            Ok(NewSubscription { id, cursor })
        })
    }

    fn delete_subscription<'a>(&'a self, base_id: &'a str, subscription_id: &'a str) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            self.enter("delete_subscription", None)?;
            if let Some(base) = self.state().bases.get_mut(base_id) {
                base.subscriptions.retain(|s| s.id != subscription_id);
            }
            Ok(())
        })
    }

    fn get_change_page<'a>(
        &'a self,
        base_id: &'a str,
        subscription_id: &'a str,
        cursor: u64,
    ) -> BoxFuture<'a, ChangePage> {
        Box::pin(async move {
            self.enter("get_change_page", None)?;
            let mut state = self.state();
            let page_size = self.page_size;
            let base = state
                .bases
                .get_mut(base_id)
                .ok_or_else(|| MirrorError::origin("get_change_page", Some(404), "no base"))?;

            let start = (cursor.max(1) - 1) as usize;
            let end = (start + page_size).min(base.log.len());
            let payloads = base.log.get(start..end).map(<[_]>::to_vec).unwrap_or_default();
            let next = end as u64 + 1;
            if let Some(sub) = base.subscriptions.iter_mut().find(|s| s.id == subscription_id) {
                sub.cursor = next.max(sub.cursor);
            }
            Ok(ChangePage {
                payloads,
                cursor: next.max(cursor),
                might_have_more: end < base.log.len(),
            })
        })
    }

    fn insert_record<'a>(&'a self, table: &'a TableRef, fields: Fields) -> BoxFuture<'a, WriteReceipt> {
        Box::pin(async move {
            self.enter("insert_record", None)?;
            let id = {
                let mut state = self.state();
                state.next_id += 1;
                format!("rec{}", state.next_id)
            };
            self.create(&table.base_id, &table.table_id, &id, fields);
            let record = self
                .record(&table.base_id, &table.table_id, &id)
                .ok_or_else(|| MirrorError::Internal("record vanished".into()))?;
            Ok(self.receipt(record))
        })
    }

    fn update_record<'a>(
        &'a self,
        table: &'a TableRef,
        record_id: &'a str,
        fields: Fields,
    ) -> BoxFuture<'a, WriteReceipt> {
        Box::pin(async move {
            self.enter("update_record", None)?;
            if self.record(&table.base_id, &table.table_id, record_id).is_none() {
                return Err(MirrorError::origin("update_record", Some(404), "record not found"));
            }
            self.change(&table.base_id, &table.table_id, record_id, fields);
            let record = self
                .record(&table.base_id, &table.table_id, record_id)
                .ok_or_else(|| MirrorError::Internal("record vanished".into()))?;
            Ok(self.receipt(record))
        })
    }

    fn delete_record<'a>(&'a self, table: &'a TableRef, record_id: &'a str) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            self.enter("delete_record", None)?;
            self.destroy(&table.base_id, &table.table_id, record_id);
            Ok(())
        })
    }
}

/// Build a field map from `(field_id, value)` pairs.
pub fn fields<const N: usize>(pairs: [(&str, Value); N]) -> Fields {
    pairs.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
}
