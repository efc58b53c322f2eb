//! API contracts for Source, Target and Notifier, with HTTP and fixture-backed implementations.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map as JsonMap, Value as JsonValue};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};
use vsync_core::{RecordPredicate, SourceRecord, TargetItem, UpdateInstruction, WrittenItem};
use vsync_storage::{FetchError, JsonClient, Method};

pub const CRATE_NAME: &str = "vsync-adapters";

/// Largest page the Source list endpoint serves.
pub const MAX_PAGE_SIZE: usize = 100;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("{0}")]
    Protocol(String),
}

/// Row as returned by Source: id plus an open column map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    pub id: String,
    #[serde(default)]
    pub fields: JsonMap<String, JsonValue>,
}

impl RawRecord {
    /// Keep only the whitelisted columns and flatten into a typed row.
    pub fn project(&self, whitelist: &[&str]) -> Result<SourceRecord, serde_json::Error> {
        let mut row = JsonMap::new();
        row.insert("id".to_string(), JsonValue::String(self.id.clone()));
        for (name, value) in &self.fields {
            if whitelist.contains(&name.as_str()) {
                row.insert(name.clone(), value.clone());
            }
        }
        serde_json::from_value(JsonValue::Object(row))
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct PageRequest {
    pub page_size: usize,
    pub max_records: Option<usize>,
    pub offset: Option<String>,
    pub predicate: Option<RecordPredicate>,
    pub fields: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct SourcePage {
    pub records: Vec<RawRecord>,
    /// Continuation token; `None` once the listing is exhausted.
    pub offset: Option<String>,
}

#[async_trait]
pub trait SourceApi: Send + Sync {
    async fn list_page(&self, table: &str, request: &PageRequest) -> Result<SourcePage, ApiError>;

    /// Patch at most one batch of rows; returns the rows as stored afterwards.
    async fn update_records(
        &self,
        table: &str,
        updates: &[UpdateInstruction],
    ) -> Result<Vec<RawRecord>, ApiError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewCollection {
    pub name: String,
    pub parent_collection: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuccessEntry {
    pub key: String,
    pub version: u64,
    #[serde(default)]
    pub data: JsonValue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureEntry {
    #[serde(default)]
    pub key: Option<String>,
    pub code: u16,
    pub message: String,
}

/// Bulk write response; every map is keyed by the submitted array index.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct WriteResponse {
    #[serde(default)]
    pub successful: BTreeMap<String, SuccessEntry>,
    #[serde(default)]
    pub unchanged: BTreeMap<String, String>,
    #[serde(default)]
    pub failed: BTreeMap<String, FailureEntry>,
}

pub fn parse_index(raw: &str) -> Option<usize> {
    raw.trim().parse().ok()
}

#[async_trait]
pub trait TargetApi: Send + Sync {
    async fn item_template(&self, item_type: &str) -> Result<JsonMap<String, JsonValue>, ApiError>;

    async fn write_items(&self, items: &[TargetItem]) -> Result<WriteResponse, ApiError>;

    async fn create_collections(&self, collections: &[NewCollection]) -> Result<WriteResponse, ApiError>;
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn announce(&self, item: &WrittenItem) -> Result<(), ApiError>;
}

pub fn announcement_text(item: &WrittenItem) -> String {
    match &item.url {
        Some(url) if !url.is_empty() => format!("New video in the library: *{}* <{}>", item.title, url),
        _ => format!("New video in the library: *{}*", item.title),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireRecord {
    id: String,
    #[serde(default)]
    fields: JsonMap<String, JsonValue>,
    #[serde(default)]
    created_time: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireList {
    #[serde(default)]
    records: Vec<WireRecord>,
    #[serde(default)]
    offset: Option<String>,
}

impl From<WireRecord> for RawRecord {
    fn from(wire: WireRecord) -> Self {
        let mut fields = wire.fields;
        if let Some(created) = wire.created_time {
            fields
                .entry("created".to_string())
                .or_insert(JsonValue::String(created));
        }
        RawRecord { id: wire.id, fields }
    }
}

pub fn predicate_formula(predicate: &RecordPredicate) -> String {
    match predicate {
        RecordPredicate::CreatedAfter(ts) => {
            format!("IS_AFTER(CREATED_TIME(), '{}')", ts.to_rfc3339())
        }
        RecordPredicate::ModifiedAfter(ts) => {
            format!("IS_AFTER(LAST_MODIFIED_TIME(), '{}')", ts.to_rfc3339())
        }
    }
}

pub fn page_query(request: &PageRequest) -> Vec<(String, String)> {
    let mut query = vec![(
        "pageSize".to_string(),
        request.page_size.clamp(1, MAX_PAGE_SIZE).to_string(),
    )];
    if let Some(max) = request.max_records {
        query.push(("maxRecords".to_string(), max.to_string()));
    }
    if let Some(offset) = &request.offset {
        query.push(("offset".to_string(), offset.clone()));
    }
    if let Some(predicate) = &request.predicate {
        query.push(("filterByFormula".to_string(), predicate_formula(predicate)));
    }
    for field in &request.fields {
        query.push(("fields[]".to_string(), field.clone()));
    }
    query
}

/// Tabular Source over its REST API (`{base}/{base_id}/{table}`).
#[derive(Debug, Clone)]
pub struct HttpSourceApi {
    http: JsonClient,
    base_url: String,
    base_id: String,
}

impl HttpSourceApi {
    pub fn new(http: JsonClient, base_url: impl Into<String>, base_id: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            base_id: base_id.into(),
        }
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/{}/{}", self.base_url, self.base_id, table)
    }
}

#[async_trait]
impl SourceApi for HttpSourceApi {
    async fn list_page(&self, table: &str, request: &PageRequest) -> Result<SourcePage, ApiError> {
        let list: WireList = self
            .http
            .get_json(&self.table_url(table), &page_query(request))
            .await?;
        Ok(SourcePage {
            records: list.records.into_iter().map(RawRecord::from).collect(),
            offset: list.offset,
        })
    }

    async fn update_records(
        &self,
        table: &str,
        updates: &[UpdateInstruction],
    ) -> Result<Vec<RawRecord>, ApiError> {
        let body = json!({ "records": updates, "typecast": true });
        let list: WireList = self
            .http
            .send_json(Method::PATCH, &self.table_url(table), &[], Some(&body))
            .await?;
        Ok(list.records.into_iter().map(RawRecord::from).collect())
    }
}

/// Reference library Target over its REST API (`{base}/{library}/items`).
#[derive(Debug, Clone)]
pub struct HttpTargetApi {
    http: JsonClient,
    base_url: String,
    library: String,
}

impl HttpTargetApi {
    /// `library` is the path prefix of the owning library, e.g. `users/475425`.
    pub fn new(http: JsonClient, base_url: impl Into<String>, library: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            library: library.into().trim_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl TargetApi for HttpTargetApi {
    async fn item_template(&self, item_type: &str) -> Result<JsonMap<String, JsonValue>, ApiError> {
        let url = format!("{}/items/new", self.base_url);
        let query = vec![("itemType".to_string(), item_type.to_string())];
        Ok(self.http.get_json(&url, &query).await?)
    }

    async fn write_items(&self, items: &[TargetItem]) -> Result<WriteResponse, ApiError> {
        let url = format!("{}/{}/items", self.base_url, self.library);
        Ok(self.http.send_json(Method::POST, &url, &[], Some(items)).await?)
    }

    async fn create_collections(&self, collections: &[NewCollection]) -> Result<WriteResponse, ApiError> {
        let url = format!("{}/{}/collections", self.base_url, self.library);
        Ok(self
            .http
            .send_json(Method::POST, &url, &[], Some(collections))
            .await?)
    }
}

/// Posts announcements to an incoming chat webhook.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    http: JsonClient,
    url: String,
}

impl WebhookNotifier {
    pub fn new(http: JsonClient, url: impl Into<String>) -> Self {
        Self { http, url: url.into() }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn announce(&self, item: &WrittenItem) -> Result<(), ApiError> {
        let body = json!({ "text": announcement_text(item) });
        // Webhooks answer with plain text, so the body is not decoded.
        self.http
            .send(Method::POST, &self.url, &[], Some(&body))
            .await?;
        Ok(())
    }
}

/// Used when no webhook is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn announce(&self, item: &WrittenItem) -> Result<(), ApiError> {
        info!(source_id = %item.source_id, key = %item.key, "{}", announcement_text(item));
        Ok(())
    }
}

/// In-memory Source tables, loaded from fixture JSON or built in code.
#[derive(Debug, Default)]
pub struct FixtureSource {
    tables: Mutex<BTreeMap<String, Vec<RawRecord>>>,
    list_calls: AtomicUsize,
    update_batches: Mutex<Vec<usize>>,
    fail_list_call: Mutex<Option<usize>>,
    fail_updates: Mutex<bool>,
}

impl FixtureSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_table(mut self, table: &str, rows: Vec<RawRecord>) -> Self {
        self.tables.get_mut().insert(table.to_string(), rows);
        self
    }

    /// Load `{ "<table>": [ {"id": ..., "fields": {...}} ] }`.
    pub fn from_json_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let tables: BTreeMap<String, Vec<RawRecord>> =
            serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        Ok(Self {
            tables: Mutex::new(tables),
            ..Self::default()
        })
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub async fn update_batches(&self) -> Vec<usize> {
        self.update_batches.lock().await.clone()
    }

    /// Make the n-th (0-based, counted from now on) list call fail.
    pub async fn fail_list_call(&self, call_index: usize) {
        *self.fail_list_call.lock().await = Some(self.list_calls() + call_index);
    }

    pub async fn fail_updates(&self, fail: bool) {
        *self.fail_updates.lock().await = fail;
    }

    pub async fn row(&self, table: &str, id: &str) -> Option<RawRecord> {
        self.tables
            .lock()
            .await
            .get(table)
            .and_then(|rows| rows.iter().find(|r| r.id == id).cloned())
    }
}

#[async_trait]
impl SourceApi for FixtureSource {
    async fn list_page(&self, table: &str, request: &PageRequest) -> Result<SourcePage, ApiError> {
        let call = self.list_calls.fetch_add(1, Ordering::SeqCst);
        if *self.fail_list_call.lock().await == Some(call) {
            return Err(ApiError::Protocol(format!("injected failure on list call {call}")));
        }

        let tables = self.tables.lock().await;
        let rows = tables
            .get(table)
            .ok_or_else(|| ApiError::Protocol(format!("unknown table {table}")))?;

        let mut matching = Vec::new();
        for row in rows {
            let keep = match &request.predicate {
                Some(predicate) => {
                    let typed = row
                        .project(vsync_core::PROJECTED_FIELDS)
                        .map_err(|e| ApiError::Protocol(e.to_string()))?;
                    predicate.matches(&typed)
                }
                None => true,
            };
            if keep {
                matching.push(row);
            }
        }

        let limit = request
            .max_records
            .map_or(matching.len(), |max| max.min(matching.len()));
        let start = request
            .offset
            .as_deref()
            .and_then(parse_index)
            .unwrap_or(0)
            .min(limit);
        let end = (start + request.page_size.clamp(1, MAX_PAGE_SIZE)).min(limit);

        let records = matching[start..end]
            .iter()
            .map(|row| {
                if request.fields.is_empty() {
                    (*row).clone()
                } else {
                    RawRecord {
                        id: row.id.clone(),
                        fields: row
                            .fields
                            .iter()
                            .filter(|(name, _)| request.fields.contains(name))
                            .map(|(k, v)| (k.clone(), v.clone()))
                            .collect(),
                    }
                }
            })
            .collect();
        debug!(table, start, end, limit, "fixture page served");

        Ok(SourcePage {
            records,
            offset: (end < limit).then(|| end.to_string()),
        })
    }

    async fn update_records(
        &self,
        table: &str,
        updates: &[UpdateInstruction],
    ) -> Result<Vec<RawRecord>, ApiError> {
        self.update_batches.lock().await.push(updates.len());
        if *self.fail_updates.lock().await {
            return Err(ApiError::Protocol("injected update failure".to_string()));
        }

        let mut tables = self.tables.lock().await;
        let rows = tables
            .get_mut(table)
            .ok_or_else(|| ApiError::Protocol(format!("unknown table {table}")))?;

        // Validate first so a bad id rejects the whole batch, as the real API does.
        if let Some(missing) = updates.iter().find(|u| !rows.iter().any(|r| r.id == u.id)) {
            return Err(ApiError::Protocol(format!("record {} not found in {table}", missing.id)));
        }

        let mut updated = Vec::with_capacity(updates.len());
        for update in updates {
            if let Some(row) = rows.iter_mut().find(|r| r.id == update.id) {
                for (name, value) in &update.fields {
                    row.fields.insert(name.clone(), value.clone());
                }
                updated.push(row.clone());
            }
        }
        Ok(updated)
    }
}

#[derive(Debug, Clone)]
struct StoredItem {
    version: u64,
    data: JsonValue,
}

#[derive(Debug, Default)]
struct FixtureTargetState {
    items: BTreeMap<String, StoredItem>,
    collections: Vec<(String, NewCollection)>,
    write_batches: Vec<usize>,
    next_id: usize,
}

/// In-memory Target library that enforces the optimistic-concurrency token.
#[derive(Debug, Default)]
pub struct FixtureTarget {
    state: Mutex<FixtureTargetState>,
    rejected_titles: BTreeSet<String>,
    template_calls: AtomicUsize,
    collection_calls: AtomicUsize,
    write_calls: AtomicUsize,
    fail_write_call: Mutex<Option<usize>>,
}

pub fn video_recording_template() -> JsonMap<String, JsonValue> {
    let template = json!({
        "itemType": "videoRecording",
        "title": "",
        "creators": [{"creatorType": "director", "firstName": "", "lastName": ""}],
        "abstractNote": "",
        "videoRecordingFormat": "",
        "seriesTitle": "",
        "volume": "",
        "numberOfVolumes": "",
        "place": "",
        "studio": "",
        "date": "",
        "runningTime": "",
        "language": "",
        "ISBN": "",
        "shortTitle": "",
        "url": "",
        "accessDate": "",
        "archive": "",
        "archiveLocation": "",
        "libraryCatalog": "",
        "callNumber": "",
        "rights": "",
        "extra": "",
        "tags": [],
        "collections": [],
        "relations": {}
    });
    match template {
        JsonValue::Object(map) => map,
        _ => JsonMap::new(),
    }
}

/// Item data with the concurrency token stripped, for change detection.
fn without_token(value: &JsonValue) -> JsonValue {
    let mut value = value.clone();
    if let JsonValue::Object(map) = &mut value {
        map.remove("key");
        map.remove("version");
    }
    value
}

impl FixtureTarget {
    pub fn new() -> Self {
        Self::default()
    }

    /// Items with one of these titles are rejected with a 400 entry.
    pub fn rejecting_titles<I, S>(mut self, titles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.rejected_titles = titles.into_iter().map(Into::into).collect();
        self
    }

    /// Make the `call_index`-th write from now fail as a whole request.
    pub async fn fail_write_call(&self, call_index: usize) {
        *self.fail_write_call.lock().await = Some(self.write_calls.load(Ordering::SeqCst) + call_index);
    }

    pub async fn seed_item(&self, key: &str, version: u64, data: JsonValue) {
        self.state.lock().await.items.insert(
            key.to_string(),
            StoredItem { version, data },
        );
    }

    pub async fn write_batches(&self) -> Vec<usize> {
        self.state.lock().await.write_batches.clone()
    }

    pub async fn item_count(&self) -> usize {
        self.state.lock().await.items.len()
    }

    pub async fn item(&self, key: &str) -> Option<(u64, JsonValue)> {
        self.state
            .lock()
            .await
            .items
            .get(key)
            .map(|stored| (stored.version, stored.data.clone()))
    }

    pub async fn collections(&self) -> Vec<(String, NewCollection)> {
        self.state.lock().await.collections.clone()
    }

    pub fn template_calls(&self) -> usize {
        self.template_calls.load(Ordering::SeqCst)
    }

    pub fn collection_calls(&self) -> usize {
        self.collection_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TargetApi for FixtureTarget {
    async fn item_template(&self, item_type: &str) -> Result<JsonMap<String, JsonValue>, ApiError> {
        self.template_calls.fetch_add(1, Ordering::SeqCst);
        let mut template = video_recording_template();
        template.insert("itemType".to_string(), JsonValue::String(item_type.to_string()));
        Ok(template)
    }

    async fn write_items(&self, items: &[TargetItem]) -> Result<WriteResponse, ApiError> {
        let call = self.write_calls.fetch_add(1, Ordering::SeqCst);
        if *self.fail_write_call.lock().await == Some(call) {
            return Err(ApiError::Protocol(format!("injected failure on write call {call}")));
        }
        let mut state = self.state.lock().await;
        state.write_batches.push(items.len());
        let mut response = WriteResponse::default();

        for (index, item) in items.iter().enumerate() {
            let index = index.to_string();
            let data = serde_json::to_value(item).map_err(|e| ApiError::Protocol(e.to_string()))?;

            if self.rejected_titles.contains(&item.title) {
                response.failed.insert(
                    index,
                    FailureEntry {
                        key: item.key.clone(),
                        code: 400,
                        message: format!("item '{}' rejected", item.title),
                    },
                );
                continue;
            }

            match (&item.key, item.version) {
                (Some(key), Some(version)) => {
                    let Some(stored) = state.items.get_mut(key) else {
                        response.failed.insert(
                            index,
                            FailureEntry {
                                key: Some(key.clone()),
                                code: 404,
                                message: format!("item {key} not found"),
                            },
                        );
                        continue;
                    };
                    if stored.version != version {
                        response.failed.insert(
                            index,
                            FailureEntry {
                                key: Some(key.clone()),
                                code: 412,
                                message: format!(
                                    "item has been modified since version {version} (now {})",
                                    stored.version
                                ),
                            },
                        );
                    } else if without_token(&stored.data) == without_token(&data) {
                        response.unchanged.insert(index, key.clone());
                    } else {
                        stored.version += 1;
                        stored.data = data.clone();
                        response.successful.insert(
                            index,
                            SuccessEntry {
                                key: key.clone(),
                                version: stored.version,
                                data,
                            },
                        );
                    }
                }
                _ => {
                    state.next_id += 1;
                    let key = format!("ITEM{:04}", state.next_id);
                    state.items.insert(
                        key.clone(),
                        StoredItem {
                            version: 1,
                            data: data.clone(),
                        },
                    );
                    response.successful.insert(
                        index,
                        SuccessEntry {
                            key,
                            version: 1,
                            data,
                        },
                    );
                }
            }
        }
        Ok(response)
    }

    async fn create_collections(&self, collections: &[NewCollection]) -> Result<WriteResponse, ApiError> {
        self.collection_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().await;
        let mut response = WriteResponse::default();
        for (index, collection) in collections.iter().enumerate() {
            state.next_id += 1;
            let key = format!("COLL{:04}", state.next_id);
            state.collections.push((key.clone(), collection.clone()));
            response.successful.insert(
                index.to_string(),
                SuccessEntry {
                    key,
                    version: 1,
                    data: serde_json::to_value(collection).unwrap_or(JsonValue::Null),
                },
            );
        }
        Ok(response)
    }
}

/// Keeps every announcement in memory.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    announced: Mutex<Vec<WrittenItem>>,
    failures_remaining: AtomicUsize,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `count` announcements fail.
    pub fn failing_first(self, count: usize) -> Self {
        self.failures_remaining.store(count, Ordering::SeqCst);
        self
    }

    pub async fn announced(&self) -> Vec<WrittenItem> {
        self.announced.lock().await.clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn announce(&self, item: &WrittenItem) -> Result<(), ApiError> {
        let remaining = self.failures_remaining.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures_remaining.store(remaining - 1, Ordering::SeqCst);
            return Err(ApiError::Protocol("webhook unavailable".to_string()));
        }
        self.announced.lock().await.push(item.clone());
        Ok(())
    }
}
