//! REST client for the origin service.
//!
//! Speaks the Airtable-style v0 API: record CRUD under `{base}/{table}`,
//! table metadata under `meta/bases/{base}/tables` and webhook management
//! under `bases/{base}/webhooks`. Cell values are always requested keyed by
//! field id so mappings survive field renames.
//!
//! Wire structs are private; the `*_from_wire` functions convert them to the
//! domain types in [`crate::origin`] and are unit tested without a server.

use super::{
    BoxFuture, ChangePage, ChangePayload, FieldInfo, Fields, NewSubscription, OriginClient,
    PayloadError, Record, RecordPage, Subscription, SubscriptionFilter, TableChanges, TableRef,
    TableSchema, WriteReceipt,
};
use crate::config::OriginConfig;
use crate::error::{MirrorError, Result};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::{RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, warn};

const MAX_LOG_BODY_CHARS: usize = 512;
/// Webhook error types starting with this mean the per-base limit is reached.
const SUBSCRIPTION_LIMIT_ERROR_PREFIX: &str = "TOO_MANY_WEBHOOKS";
/// First payload cursor of a freshly created webhook.
const INITIAL_CURSOR: u64 = 1;
/// Largest page the list records endpoint serves.
const SCAN_PAGE_SIZE: &str = "100";

/// HTTP origin client.
#[derive(Debug, Clone)]
pub struct HttpOrigin {
    client: reqwest::Client,
    base_url: String,
}

impl HttpOrigin {
    /// Build a client from config. Fails if the token is not a valid header value.
    pub fn new(config: &OriginConfig) -> Result<Self> {
        let mut headers = HeaderMap::new();
        let bearer = HeaderValue::from_str(&format!("Bearer {}", config.access_token))
            .map_err(|_| MirrorError::Config("access_token is not a valid header value".into()))?;
        headers.insert(AUTHORIZATION, bearer);

        let client = reqwest::Client::builder()
            .timeout(config.request_timeout_duration())
            .default_headers(headers)
            .build()
            .map_err(|e| MirrorError::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.api_base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    fn log_response(operation: &str, status: StatusCode, body: &str) {
        let preview: String = body.chars().take(MAX_LOG_BODY_CHARS).collect();
        debug!(operation, status = status.as_u16(), body = %preview, "Origin response");
    }

    /// Send and return status plus body. Transport failures carry no status.
    async fn send(&self, operation: &'static str, request: RequestBuilder) -> Result<(StatusCode, String)> {
        let response = request
            .send()
            .await
            .map_err(|e| MirrorError::origin(operation, e.status().map(|s| s.as_u16()), e.to_string()))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| MirrorError::origin(operation, Some(status.as_u16()), e.to_string()))?;
        Self::log_response(operation, status, &body);
        Ok((status, body))
    }

    async fn request<T: serde::de::DeserializeOwned>(
        &self,
        operation: &'static str,
        request: RequestBuilder,
    ) -> Result<T> {
        let (status, body) = self.send(operation, request).await?;
        parse_body(operation, status, &body)
    }

    async fn fetch_record(&self, table: &TableRef, record_id: &str) -> Result<Option<Record>> {
        let url = self.url(&format!("{}/{}/{}", table.base_id, table.table_id, record_id));
        let request = self
            .client
            .get(&url)
            .query(&[("returnFieldsByFieldId", "true")]);
        let (status, body) = self.send("get_record", request).await?;
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let wire: WireRecord = parse_body("get_record", status, &body)?;
        Ok(Some(wire.into()))
    }

    async fn fetch_record_page(&self, table: &TableRef, offset: Option<String>) -> Result<RecordPage> {
        let url = self.url(&format!("{}/{}", table.base_id, table.table_id));
        let mut request = self
            .client
            .get(&url)
            .query(&[("returnFieldsByFieldId", "true"), ("pageSize", SCAN_PAGE_SIZE)]);
        if let Some(ref offset) = offset {
            request = request.query(&[("offset", offset.as_str())]);
        }
        let page: WireRecordPage = self.request("scan_page", request).await?;
        Ok(RecordPage {
            records: page.records.into_iter().map(Record::from).collect(),
            offset: page.offset,
        })
    }

    async fn fetch_fields(&self, base_id: &str) -> Result<Vec<TableSchema>> {
        let url = self.url(&format!("meta/bases/{}/tables", base_id));
        let wire: WireTables = self.request("list_fields", self.client.get(&url)).await?;
        Ok(wire.tables.into_iter().map(TableSchema::from).collect())
    }

    async fn fetch_subscriptions(&self, base_id: &str) -> Result<Vec<Subscription>> {
        let url = self.url(&format!("bases/{}/webhooks", base_id));
        let wire: WireWebhookList = self.request("list_subscriptions", self.client.get(&url)).await?;
        Ok(wire.webhooks.into_iter().map(subscription_from_wire).collect())
    }

    async fn post_subscription(&self, base_id: &str, filter: &SubscriptionFilter) -> Result<NewSubscription> {
        let url = self.url(&format!("bases/{}/webhooks", base_id));
        let request = self.client.post(&url).json(&create_webhook_body(filter));
        let (status, body) = self.send("create_subscription", request).await?;

        if !status.is_success() {
            let err = parse_error_body(&body);
            if err.kind.starts_with(SUBSCRIPTION_LIMIT_ERROR_PREFIX) {
                return Err(MirrorError::SubscriptionLimit {
                    base_id: base_id.to_string(),
                    message: err.to_string(),
                });
            }
        }

        let created: WireCreatedWebhook = parse_body("create_subscription", status, &body)?;
        Ok(NewSubscription {
            id: created.id,
            cursor: INITIAL_CURSOR,
        })
    }

    async fn remove_subscription(&self, base_id: &str, subscription_id: &str) -> Result<()> {
        let url = self.url(&format!("bases/{}/webhooks/{}", base_id, subscription_id));
        let (status, body) = self.send("delete_subscription", self.client.delete(&url)).await?;
        if status == StatusCode::NOT_FOUND {
            warn!(base_id, subscription_id, "Subscription already gone");
            return Ok(());
        }
        check_status("delete_subscription", status, &body)
    }

    async fn fetch_change_page(&self, base_id: &str, subscription_id: &str, cursor: u64) -> Result<ChangePage> {
        let url = self.url(&format!("bases/{}/webhooks/{}/payloads", base_id, subscription_id));
        let request = self.client.get(&url).query(&[("cursor", cursor)]);
        let wire: WirePayloadPage = self.request("get_change_page", request).await?;
        Ok(change_page_from_wire(wire))
    }

    async fn write_record(
        &self,
        operation: &'static str,
        table: &TableRef,
        record_id: Option<&str>,
        fields: Fields,
    ) -> Result<WriteReceipt> {
        let body = WireWriteBody {
            fields,
            return_fields_by_field_id: true,
        };
        let request = match record_id {
            Some(id) => {
                let url = self.url(&format!("{}/{}/{}", table.base_id, table.table_id, id));
                self.client.patch(&url).json(&body)
            }
            None => {
                let url = self.url(&format!("{}/{}", table.base_id, table.table_id));
                self.client.post(&url).json(&body)
            }
        };
        let wire: WireRecord = self.request(operation, request).await?;
        let record = Record::from(wire);
        Ok(WriteReceipt {
            id: record.id.clone(),
            record: Some(record),
        })
    }

    async fn remove_record(&self, table: &TableRef, record_id: &str) -> Result<()> {
        let url = self.url(&format!("{}/{}/{}", table.base_id, table.table_id, record_id));
        let (status, body) = self.send("delete_record", self.client.delete(&url)).await?;
        check_status("delete_record", status, &body)
    }
}

impl OriginClient for HttpOrigin {
    fn get_record<'a>(&'a self, table: &'a TableRef, record_id: &'a str) -> BoxFuture<'a, Option<Record>> {
        Box::pin(self.fetch_record(table, record_id))
    }

    fn scan_page<'a>(&'a self, table: &'a TableRef, offset: Option<String>) -> BoxFuture<'a, RecordPage> {
        Box::pin(self.fetch_record_page(table, offset))
    }

    fn list_fields<'a>(&'a self, base_id: &'a str) -> BoxFuture<'a, Vec<TableSchema>> {
        Box::pin(self.fetch_fields(base_id))
    }

    fn list_subscriptions<'a>(&'a self, base_id: &'a str) -> BoxFuture<'a, Vec<Subscription>> {
        Box::pin(self.fetch_subscriptions(base_id))
    }

    fn create_subscription<'a>(
        &'a self,
        base_id: &'a str,
        filter: &'a SubscriptionFilter,
    ) -> BoxFuture<'a, NewSubscription> {
        Box::pin(self.post_subscription(base_id, filter))
    }

    fn delete_subscription<'a>(&'a self, base_id: &'a str, subscription_id: &'a str) -> BoxFuture<'a, ()> {
        Box::pin(self.remove_subscription(base_id, subscription_id))
    }

    fn get_change_page<'a>(
        &'a self,
        base_id: &'a str,
        subscription_id: &'a str,
        cursor: u64,
    ) -> BoxFuture<'a, ChangePage> {
        Box::pin(self.fetch_change_page(base_id, subscription_id, cursor))
    }

    fn insert_record<'a>(&'a self, table: &'a TableRef, fields: Fields) -> BoxFuture<'a, WriteReceipt> {
        Box::pin(self.write_record("insert_record", table, None, fields))
    }

    fn update_record<'a>(
        &'a self,
        table: &'a TableRef,
        record_id: &'a str,
        fields: Fields,
    ) -> BoxFuture<'a, WriteReceipt> {
        Box::pin(self.write_record("update_record", table, Some(record_id), fields))
    }

    fn delete_record<'a>(&'a self, table: &'a TableRef, record_id: &'a str) -> BoxFuture<'a, ()> {
        Box::pin(self.remove_record(table, record_id))
    }
}

// =============================================================================
// Response handling
// =============================================================================

/// Error body, either `{"error": {"type", "message"}}` or `{"error": "TYPE"}`.
#[derive(Debug, Deserialize)]
struct WireErrorEnvelope {
    error: WireError,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WireError {
    Detailed {
        #[serde(rename = "type")]
        kind: String,
        #[serde(default)]
        message: Option<String>,
    },
    Bare(String),
}

#[derive(Debug, Clone, PartialEq)]
struct OriginApiError {
    kind: String,
    message: Option<String>,
}

impl std::fmt::Display for OriginApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.message {
            Some(message) => write!(f, "{}: {}", self.kind, message),
            None => write!(f, "{}", self.kind),
        }
    }
}

fn parse_error_body(body: &str) -> OriginApiError {
    match serde_json::from_str::<WireErrorEnvelope>(body) {
        Ok(WireErrorEnvelope {
            error: WireError::Detailed { kind, message },
        }) => OriginApiError { kind, message },
        Ok(WireErrorEnvelope {
            error: WireError::Bare(kind),
        }) => OriginApiError { kind, message: None },
        Err(_) => OriginApiError {
            kind: "UNKNOWN".to_string(),
            message: Some(format!("Request failed: {}", body)),
        },
    }
}

fn check_status(operation: &'static str, status: StatusCode, body: &str) -> Result<()> {
    if status.is_success() {
        return Ok(());
    }
    Err(MirrorError::origin(
        operation,
        Some(status.as_u16()),
        parse_error_body(body).to_string(),
    ))
}

fn parse_body<T: serde::de::DeserializeOwned>(operation: &'static str, status: StatusCode, body: &str) -> Result<T> {
    check_status(operation, status, body)?;
    serde_json::from_str(body).map_err(|e| {
        warn!(operation, error = %e, "Failed to deserialize origin response");
        MirrorError::Decode(e)
    })
}

// =============================================================================
// Wire types
// =============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireRecord {
    id: String,
    #[serde(default)]
    created_time: Option<String>,
    #[serde(default)]
    fields: Fields,
}

impl From<WireRecord> for Record {
    fn from(wire: WireRecord) -> Self {
        Self {
            id: wire.id,
            created_time: wire.created_time,
            fields: wire.fields,
        }
    }
}

#[derive(Debug, Deserialize)]
struct WireRecordPage {
    records: Vec<WireRecord>,
    #[serde(default)]
    offset: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WireWriteBody {
    fields: Fields,
    return_fields_by_field_id: bool,
}

#[derive(Debug, Deserialize)]
struct WireTables {
    tables: Vec<WireTable>,
}

#[derive(Debug, Deserialize)]
struct WireTable {
    id: String,
    name: String,
    #[serde(default)]
    fields: Vec<WireField>,
}

#[derive(Debug, Deserialize)]
struct WireField {
    id: String,
    name: String,
}

impl From<WireTable> for TableSchema {
    fn from(wire: WireTable) -> Self {
        Self {
            table_id: wire.id,
            name: wire.name,
            fields: wire
                .fields
                .into_iter()
                .map(|f| FieldInfo { id: f.id, name: f.name })
                .collect(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct WireFilters {
    #[serde(default)]
    data_types: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    watch_data_in_field_ids: Option<Vec<String>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireOptions {
    filters: WireFilters,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireHookSettings {
    options: WireOptions,
}

#[derive(Debug, Serialize)]
struct WireCreateWebhook {
    #[serde(rename = "specification")]
    settings: WireHookSettings,
}

#[derive(Debug, Deserialize)]
struct WireCreatedWebhook {
    id: String,
}

#[derive(Debug, Deserialize)]
struct WireWebhookList {
    #[serde(default)]
    webhooks: Vec<WireWebhook>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireWebhook {
    id: String,
    #[serde(default, rename = "specification")]
    settings: Option<Value>,
    #[serde(default = "default_cursor")]
    cursor_for_next_payload: u64,
    #[serde(default = "default_enabled")]
    is_hook_enabled: bool,
}

fn default_cursor() -> u64 {
    INITIAL_CURSOR
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WirePayloadPage {
    #[serde(default)]
    payloads: Vec<WirePayload>,
    cursor: u64,
    #[serde(default)]
    might_have_more: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WirePayload {
    #[serde(default)]
    timestamp: Option<String>,
    #[serde(default)]
    error: bool,
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    changed_tables_by_id: BTreeMap<String, WireTableChanges>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct WireTableChanges {
    #[serde(default)]
    created_records_by_id: BTreeMap<String, Value>,
    #[serde(default)]
    changed_records_by_id: BTreeMap<String, WireChangedRecord>,
    #[serde(default)]
    destroyed_record_ids: Vec<String>,
    #[serde(default)]
    destroyed_field_ids: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct WireChangedRecord {
    #[serde(default)]
    current: Option<WireCellValues>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireCellValues {
    #[serde(default)]
    cell_values_by_field_id: Fields,
}

// =============================================================================
// Wire -> domain
// =============================================================================

fn create_webhook_body(filter: &SubscriptionFilter) -> WireCreateWebhook {
    WireCreateWebhook {
        settings: WireHookSettings {
            options: WireOptions {
                filters: WireFilters {
                    data_types: filter.data_types.iter().cloned().collect(),
                    watch_data_in_field_ids: filter
                        .field_ids
                        .as_ref()
                        .map(|ids| ids.iter().cloned().collect()),
                },
            },
        },
    }
}

/// Filter of a listed webhook. `None` when its settings carry no filters we can read.
fn filter_from_settings(settings: Option<Value>) -> Option<SubscriptionFilter> {
    let settings: WireHookSettings = serde_json::from_value(settings?).ok()?;
    let filters = settings.options.filters;
    Some(SubscriptionFilter {
        data_types: filters.data_types.into_iter().collect(),
        field_ids: filters
            .watch_data_in_field_ids
            .filter(|ids| !ids.is_empty())
            .map(|ids| ids.into_iter().collect()),
    })
}

fn subscription_from_wire(wire: WireWebhook) -> Subscription {
    let last_error = if wire.is_hook_enabled {
        None
    } else {
        Some(PayloadError {
            code: "INVALID_HOOK".to_string(),
            message: Some("webhook is disabled".to_string()),
        })
    };
    Subscription {
        id: wire.id,
        cursor: wire.cursor_for_next_payload,
        filter: filter_from_settings(wire.settings),
        last_error,
        deleted_field_ids: BTreeSet::new(),
    }
}

fn payload_from_wire(wire: WirePayload) -> ChangePayload {
    let error = if wire.error {
        Some(PayloadError {
            code: wire.code.unwrap_or_else(|| "UNKNOWN".to_string()),
            message: None,
        })
    } else {
        None
    };

    let tables = wire
        .changed_tables_by_id
        .into_iter()
        .map(|(table_id, changes)| {
            let changed = changes
                .changed_records_by_id
                .into_iter()
                .map(|(record_id, record)| {
                    let fields = record
                        .current
                        .map(|c| c.cell_values_by_field_id.keys().cloned().collect())
                        .unwrap_or_default();
                    (record_id, fields)
                })
                .collect();
            let table_changes = TableChanges {
                created: changes.created_records_by_id.into_keys().collect(),
                changed,
                destroyed: changes.destroyed_record_ids,
                destroyed_field_ids: changes.destroyed_field_ids,
            };
            (table_id, table_changes)
        })
        .collect();

    ChangePayload {
        timestamp: wire.timestamp,
        error,
        tables,
    }
}

fn change_page_from_wire(wire: WirePayloadPage) -> ChangePage {
    ChangePage {
        payloads: wire.payloads.into_iter().map(payload_from_wire).collect(),
        cursor: wire.cursor,
        might_have_more: wire.might_have_more,
    }
}
