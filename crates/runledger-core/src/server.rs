//! HTTP surface: ingest, query, patch, health, metrics.
//!
//! A thin axum layer over the write facade and a read store. All filtering
//! happens server-side in SQL; repeated `status` query parameters are
//! OR-combined while the other dimensions AND together.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::Router;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::info;

use crate::error::{Result, StoreError};
use crate::facade::{Receipt, RunRecorder, StartRun};
use crate::model::{Run, RunPatch};
use crate::recovery;
use crate::status::RunStatus;
use crate::store::{RunFilter, RunStore};
use crate::telemetry::Counters;

/// `PRAGMA integrity_check` is a full-database scan; cache its verdict so
/// health polling stays cheap.
const HEALTH_CACHE_TTL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy)]
struct HealthSnapshot {
    checked_at: Instant,
    integrity_ok: bool,
    run_count: i64,
}

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    recorder: Arc<RunRecorder>,
    /// Read-side connection, separate from the recorder's.
    store: Arc<Mutex<RunStore>>,
    counters: Arc<Counters>,
    health_cache: Arc<Mutex<Option<HealthSnapshot>>>,
}

impl AppState {
    #[must_use]
    pub fn new(recorder: Arc<RunRecorder>, store: RunStore) -> Self {
        let counters = recorder.counters();
        Self {
            recorder,
            store: Arc::new(Mutex::new(store)),
            counters,
            health_cache: Arc::new(Mutex::new(None)),
        }
    }

    fn with_store<T>(&self, f: impl FnOnce(&mut RunStore) -> Result<T>) -> Result<T> {
        let mut store = self
            .store
            .lock()
            .map_err(|_| StoreError::Database("server store mutex poisoned".into()))?;
        f(&mut store)
    }

    /// Cached integrity verdict, recomputed once the TTL lapses.
    fn health_snapshot(&self) -> Result<HealthSnapshot> {
        {
            let cache = self
                .health_cache
                .lock()
                .map_err(|_| StoreError::Database("health cache mutex poisoned".into()))?;
            if let Some(snapshot) = *cache {
                if snapshot.checked_at.elapsed() < HEALTH_CACHE_TTL {
                    return Ok(snapshot);
                }
            }
        }
        let report = self.with_store(|store| recovery::check_integrity(store))?;
        let snapshot = HealthSnapshot {
            checked_at: Instant::now(),
            integrity_ok: report.is_healthy(),
            run_count: report.run_count,
        };
        let mut cache = self
            .health_cache
            .lock()
            .map_err(|_| StoreError::Database("health cache mutex poisoned".into()))?;
        *cache = Some(snapshot);
        Ok(snapshot)
    }
}

/// Build the service router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/runs", post(create_run).get(list_runs))
        .route("/runs/batch", post(create_runs_batch))
        .route("/runs/:event_id", get(get_run).patch(patch_run))
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .with_state(state)
}

/// Bind and serve until the shutdown signal flips.
pub async fn serve(
    state: AppState,
    addr: &str,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "query service listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            while !*shutdown.borrow() {
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
        })
        .await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// Body of `POST /runs` (and each batch item).
#[derive(Debug, Clone, Deserialize)]
pub struct CreateRunBody {
    /// Client-supplied identity; generated when absent. Re-posting a known
    /// `event_id` is a no-op success.
    pub event_id: Option<String>,
    pub run_id: String,
    pub parent_run_id: Option<String>,
    pub agent_name: String,
    pub job_type: String,
    /// Raw status spelling, normalized server-side.
    pub status: Option<String>,
    pub items_discovered: Option<i64>,
    pub items_succeeded: Option<i64>,
    pub items_failed: Option<i64>,
    pub items_skipped: Option<i64>,
    pub duration_secs: Option<f64>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub metrics: Option<serde_json::Value>,
    pub context: Option<serde_json::Value>,
}

/// Body of `PATCH /runs/{event_id}`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PatchRunBody {
    pub status: Option<String>,
    pub items_discovered: Option<i64>,
    pub items_succeeded: Option<i64>,
    pub items_failed: Option<i64>,
    pub items_skipped: Option<i64>,
    pub duration_secs: Option<f64>,
    pub end_time: Option<DateTime<Utc>>,
    pub metrics: Option<serde_json::Value>,
    pub context: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
pub struct WriteResponse {
    pub event_id: String,
    pub accepted: bool,
    pub indexed: bool,
}

#[derive(Debug, Serialize)]
pub struct BatchItemResponse {
    pub event_id: String,
    pub accepted: bool,
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ListResponse {
    pub runs: Vec<Run>,
    pub count: usize,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub integrity_ok: bool,
    pub run_count: i64,
}

/// Handler error mapped onto status codes with a JSON body.
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::BadRequest(m) => (StatusCode::BAD_REQUEST, m),
            Self::NotFound(m) => (StatusCode::NOT_FOUND, m),
            Self::Internal(m) => (StatusCode::INTERNAL_SERVER_ERROR, m),
        };
        (status, axum::Json(serde_json::json!({ "error": message }))).into_response()
    }
}

impl From<crate::error::Error> for ApiError {
    fn from(e: crate::error::Error) -> Self {
        Self::Internal(e.to_string())
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

fn patch_from_body(body: &PatchRunBody) -> std::result::Result<RunPatch, ApiError> {
    let status = body
        .status
        .as_deref()
        .map(|raw| {
            RunStatus::normalize(raw)
                .ok_or_else(|| ApiError::BadRequest(format!("unrecognized status: {raw}")))
        })
        .transpose()?;
    Ok(RunPatch {
        status,
        items_discovered: body.items_discovered,
        items_succeeded: body.items_succeeded,
        items_failed: body.items_failed,
        items_skipped: body.items_skipped,
        duration_secs: body.duration_secs,
        end_time: body.end_time,
        metrics: body.metrics.clone(),
        context: body.context.clone(),
    })
}

fn ingest(state: &AppState, body: CreateRunBody) -> std::result::Result<Receipt, ApiError> {
    if body.run_id.trim().is_empty() {
        return Err(ApiError::BadRequest("run_id must not be empty".into()));
    }
    let patch = patch_from_body(&PatchRunBody {
        status: body.status.clone(),
        items_discovered: body.items_discovered,
        items_succeeded: body.items_succeeded,
        items_failed: body.items_failed,
        items_skipped: body.items_skipped,
        duration_secs: body.duration_secs,
        end_time: body.end_time,
        metrics: body.metrics.clone(),
        context: body.context.clone(),
    })?;
    let event_id = body
        .event_id
        .clone()
        .filter(|id| !id.trim().is_empty())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let receipt = state.recorder.ingest_run(
        &body.run_id,
        &event_id,
        StartRun {
            event_id: Some(event_id.clone()),
            parent_run_id: body.parent_run_id,
            agent_name: body.agent_name,
            job_type: body.job_type,
            start_time: body.start_time,
            context: body.context,
        },
        patch,
    );
    Ok(receipt)
}

async fn create_run(
    State(state): State<AppState>,
    axum::Json(body): axum::Json<CreateRunBody>,
) -> std::result::Result<axum::Json<WriteResponse>, ApiError> {
    let receipt = ingest(&state, body)?;
    if let Some(reason) = receipt.rejection {
        return Err(ApiError::BadRequest(reason));
    }
    Ok(axum::Json(WriteResponse {
        accepted: receipt.log_appended || receipt.indexed,
        event_id: receipt.event_id,
        indexed: receipt.indexed,
    }))
}

async fn create_runs_batch(
    State(state): State<AppState>,
    axum::Json(bodies): axum::Json<Vec<CreateRunBody>>,
) -> axum::Json<Vec<BatchItemResponse>> {
    let mut results = Vec::with_capacity(bodies.len());
    for body in bodies {
        let requested = body.event_id.clone().unwrap_or_default();
        match ingest(&state, body) {
            Ok(receipt) => results.push(BatchItemResponse {
                accepted: receipt.rejection.is_none()
                    && (receipt.log_appended || receipt.indexed),
                error: receipt.rejection,
                event_id: receipt.event_id,
            }),
            Err(ApiError::BadRequest(m) | ApiError::NotFound(m) | ApiError::Internal(m)) => {
                results.push(BatchItemResponse {
                    event_id: requested,
                    accepted: false,
                    error: Some(m),
                });
            }
        }
    }
    axum::Json(results)
}

async fn list_runs(
    State(state): State<AppState>,
    Query(params): Query<Vec<(String, String)>>,
) -> std::result::Result<axum::Json<ListResponse>, ApiError> {
    let mut filter = RunFilter::default();
    for (key, value) in params {
        match key.as_str() {
            "status" => {
                let status = RunStatus::normalize(&value).ok_or_else(|| {
                    ApiError::BadRequest(format!("unrecognized status: {value}"))
                })?;
                filter.statuses.push(status);
            }
            "agent_name" => filter.agent_name = Some(value),
            "job_type" => filter.job_type = Some(value),
            "run_id" => filter.run_id = Some(value),
            "parent_run_id" => filter.parent_run_id = Some(value),
            "limit" => {
                filter.limit = Some(value.parse().map_err(|_| {
                    ApiError::BadRequest(format!("invalid limit: {value}"))
                })?);
            }
            "offset" => {
                filter.offset = Some(value.parse().map_err(|_| {
                    ApiError::BadRequest(format!("invalid offset: {value}"))
                })?);
            }
            other => {
                return Err(ApiError::BadRequest(format!(
                    "unknown query parameter: {other}"
                )));
            }
        }
    }
    let runs = state.with_store(|store| store.query(&filter))?;
    Ok(axum::Json(ListResponse {
        count: runs.len(),
        runs,
    }))
}

async fn get_run(
    State(state): State<AppState>,
    Path(event_id): Path<String>,
) -> std::result::Result<axum::Json<Run>, ApiError> {
    let run = state
        .with_store(|store| store.get_run(&event_id))?
        .ok_or_else(|| ApiError::NotFound(format!("no run with event_id {event_id}")))?;
    Ok(axum::Json(run))
}

async fn patch_run(
    State(state): State<AppState>,
    Path(event_id): Path<String>,
    axum::Json(body): axum::Json<PatchRunBody>,
) -> std::result::Result<axum::Json<WriteResponse>, ApiError> {
    let patch = patch_from_body(&body)?;
    if patch.is_empty() {
        return Err(ApiError::BadRequest("empty patch".into()));
    }
    if state.with_store(|store| store.get_run(&event_id))?.is_none() {
        return Err(ApiError::NotFound(format!("no run with event_id {event_id}")));
    }
    let receipt = state.recorder.patch_run(&event_id, patch);
    if let Some(reason) = receipt.rejection {
        return Err(ApiError::BadRequest(reason));
    }
    Ok(axum::Json(WriteResponse {
        accepted: receipt.log_appended || receipt.indexed,
        event_id: receipt.event_id,
        indexed: receipt.indexed,
    }))
}

async fn health(
    State(state): State<AppState>,
) -> std::result::Result<axum::Json<HealthResponse>, ApiError> {
    let snapshot = state.health_snapshot()?;
    Ok(axum::Json(HealthResponse {
        status: "ok",
        integrity_ok: snapshot.integrity_ok,
        run_count: snapshot.run_count,
    }))
}

async fn metrics(State(state): State<AppState>) -> String {
    state.counters.render()
}
