//! JSON HTTP surface over the sync engine.

use std::sync::Arc;

use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Path, Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use vsync_adapters::RawRecord;
use vsync_core::{ListFilter, SourceRecord, UpdateInstruction, PROJECTED_FIELDS};
use vsync_sync::{ListQuery, SyncConfig, SyncKind, SyncPipeline, SyncReport};

pub const CRATE_NAME: &str = "vsync-web";

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<SyncPipeline>,
}

impl AppState {
    pub fn new(pipeline: SyncPipeline) -> Self {
        Self {
            pipeline: Arc::new(pipeline),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListParams {
    page_size: Option<usize>,
    max_records: Option<usize>,
    created_after: Option<DateTime<Utc>>,
    modified_after: Option<DateTime<Utc>>,
    #[serde(default)]
    refresh: bool,
}

impl ListParams {
    fn into_query(self, default_page_size: usize, page: Option<usize>) -> ListQuery {
        ListQuery {
            filter: ListFilter {
                created_after: self.created_after,
                modified_after: self.modified_after,
            },
            page_size: self.page_size.unwrap_or(default_page_size),
            max_records: self.max_records,
            page,
            refresh: self.refresh,
        }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/videos/list", get(list_handler))
        .route("/videos/list/{page}", get(list_page_handler))
        .route("/videos/update", post(update_handler).put(update_handler))
        .route("/sync", post(sync_create_handler).put(sync_update_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let config = SyncConfig::from_env();
    let port = config.web_port;
    let pipeline = SyncPipeline::new(config)?;
    serve(AppState::new(pipeline), port).await
}

async fn list_handler(
    State(state): State<Arc<AppState>>,
    params: Result<Query<ListParams>, QueryRejection>,
) -> Response {
    list_videos(&state, params, None).await
}

async fn list_page_handler(
    State(state): State<Arc<AppState>>,
    Path(page): Path<usize>,
    params: Result<Query<ListParams>, QueryRejection>,
) -> Response {
    list_videos(&state, params, Some(page)).await
}

async fn list_videos(
    state: &AppState,
    params: Result<Query<ListParams>, QueryRejection>,
    page: Option<usize>,
) -> Response {
    let Query(params) = match params {
        Ok(params) => params,
        Err(rejection) => return bad_request(json!({ "error": rejection.body_text() })),
    };
    let query = params.into_query(state.pipeline.config().default_page_size, page);
    match state.pipeline.reader().list_records(&query).await {
        Ok(rows) => Json(rows).into_response(),
        Err(err) => {
            warn!(error = %err, "video listing failed");
            bad_request(json!({ "error": err.to_string() }))
        }
    }
}

async fn update_handler(
    State(state): State<Arc<AppState>>,
    body: Result<Json<Vec<UpdateInstruction>>, JsonRejection>,
) -> Response {
    let Json(instructions) = match body {
        Ok(body) => body,
        Err(rejection) => return bad_request(json!({ "error": rejection.body_text() })),
    };
    let table = &state.pipeline.config().videos_table;
    let report = state.pipeline.updater().apply(table, &instructions).await;
    if report.is_complete() {
        Json(report.applied).into_response()
    } else {
        bad_request(json!({
            "error": format!("{} of {} updates failed", report.failed.len(), instructions.len()),
            "failed": report.failed,
            "errors": report.errors,
        }))
    }
}

async fn sync_create_handler(
    State(state): State<Arc<AppState>>,
    body: Result<Json<JsonValue>, JsonRejection>,
) -> Response {
    run_sync(&state, body, SyncKind::Create).await
}

async fn sync_update_handler(
    State(state): State<Arc<AppState>>,
    body: Result<Json<JsonValue>, JsonRejection>,
) -> Response {
    run_sync(&state, body, SyncKind::Update).await
}

async fn run_sync(state: &AppState, body: Result<Json<JsonValue>, JsonRejection>, kind: SyncKind) -> Response {
    let records = match body
        .map_err(|rejection| rejection.body_text())
        .and_then(|Json(value)| parse_records(value))
    {
        Ok(records) => records,
        Err(message) => return bad_request(json!({ "error": message })),
    };

    match state.pipeline.reconciler().sync_all(&records, kind).await {
        Ok(SyncReport::Processed(summary)) => Json(summary.back_synced).into_response(),
        Ok(SyncReport::NothingWritten(_)) => (StatusCode::NOT_FOUND, "no items were written").into_response(),
        Err(err) => server_error(err.into()),
    }
}

/// Accepts one record or an array, each either flat (`{id, title, ...}`) or
/// in Source shape (`{id, fields: {...}}`).
fn parse_records(body: JsonValue) -> Result<Vec<SourceRecord>, String> {
    let values = match body {
        JsonValue::Array(values) => values,
        other => vec![other],
    };
    values
        .into_iter()
        .map(|value| {
            let nested = value.get("fields").is_some_and(JsonValue::is_object);
            if nested {
                let raw: RawRecord = serde_json::from_value(value).map_err(|e| e.to_string())?;
                raw.project(PROJECTED_FIELDS).map_err(|e| format!("record {}: {e}", raw.id))
            } else {
                serde_json::from_value(value).map_err(|e| e.to_string())
            }
        })
        .collect()
}

fn bad_request(body: JsonValue) -> Response {
    (StatusCode::BAD_REQUEST, Json(body)).into_response()
}

fn server_error(err: anyhow::Error) -> Response {
    error!(error = %err, "request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": format!("{err:#}") })),
    )
        .into_response()
}
