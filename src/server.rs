//! Localhost HTTP API.
//!
//! JSON over HTTP on the loopback interface. Errors use a structured
//! body:
//!
//! ```json
//! { "error": { "kind": "ModelUnavailable", "message": "...", "retryable": true } }
//! ```
//!
//! When the degraded flag is set (after a fatal store or model-shape
//! error), mutating endpoints return 503 while reads keep serving.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::extract::{Path as AxumPath, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use uuid::Uuid;

use crate::error::Error;
use crate::models::{Document, MediaType, Transcript};
use crate::scheduler::{self, IndexReport};
use crate::search::{self, SearchRequest, SearchResult};
use crate::store::{SearchFilters, StoreStats};
use crate::{opener, CoreContext};

#[derive(Clone)]
struct AppState {
    ctx: Arc<CoreContext>,
    degraded: Arc<AtomicBool>,
}

/// Start the HTTP server. Runs until the process is terminated.
pub async fn run_server(
    ctx: Arc<CoreContext>,
    degraded: Arc<AtomicBool>,
    host: &str,
    port: u16,
) -> crate::error::Result<()> {
    let state = AppState { ctx, degraded };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/api/search", get(handle_search))
        .route("/api/documents", get(handle_list_documents))
        .route("/api/documents/index", post(handle_index))
        .route("/api/documents/stats", get(handle_stats))
        .route("/api/documents/directories", get(handle_directories))
        .route("/api/documents/:id", get(handle_get_document))
        .route("/api/documents/:id/transcript", get(handle_get_transcript))
        .route("/api/actions/open", post(handle_open))
        .route("/api/actions/reveal", post(handle_reveal))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(state);

    let bind_addr = format!("{host}:{port}");
    tracing::info!(addr = %bind_addr, "API server listening");

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

// ───────────────────────── error plumbing ─────────────────────────

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    kind: String,
    message: String,
    retryable: bool,
}

struct AppError {
    status: StatusCode,
    kind: String,
    message: String,
    retryable: bool,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                kind: self.kind,
                message: self.message,
                retryable: self.retryable,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<Error> for AppError {
    fn from(err: Error) -> Self {
        let status = match &err {
            Error::ConfigInvalid(_) => StatusCode::BAD_REQUEST,
            Error::ModelUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Error::QueueFull => StatusCode::TOO_MANY_REQUESTS,
            Error::StoreCorruption(_) | Error::Database(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::Io(io) if io.kind() == std::io::ErrorKind::NotFound => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            kind: err.kind().to_string(),
            message: err.to_string(),
            retryable: err.is_retryable(),
        }
    }
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        kind: "NotFound".to_string(),
        message: message.into(),
        retryable: false,
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        kind: "ConfigInvalid".to_string(),
        message: message.into(),
        retryable: false,
    }
}

fn degraded_error() -> AppError {
    AppError {
        status: StatusCode::SERVICE_UNAVAILABLE,
        kind: "StoreCorruption".to_string(),
        message: "index is in degraded read-only mode; restart to recover".to_string(),
        retryable: false,
    }
}

// ───────────────────────── GET /api/search ─────────────────────────

#[derive(Deserialize)]
struct SearchParams {
    q: String,
    limit: Option<usize>,
    media_type: Option<String>,
    path_prefix: Option<String>,
    #[serde(default)]
    rerank: bool,
}

#[derive(Serialize)]
struct SearchResponse {
    results: Vec<SearchResult>,
    total: usize,
    took_ms: u64,
}

async fn handle_search(
    State(state): State<AppState>,
    Query(params): Query<SearchParams>,
) -> Result<Json<SearchResponse>, AppError> {
    if params.q.trim().is_empty() {
        return Err(bad_request("q must not be empty"));
    }
    let limit = search::clamp_limit(params.limit)?;

    let mut filters = SearchFilters::default();
    if let Some(raw) = &params.media_type {
        let media = MediaType::parse(raw)
            .ok_or_else(|| bad_request(format!("unknown media_type: {raw}")))?;
        filters.media_types.push(media);
    }
    filters.path_prefix = params.path_prefix.clone();

    let request = SearchRequest {
        query: params.q.clone(),
        limit,
        filters,
        rerank: params.rerank,
    };

    let started = std::time::Instant::now();
    let results = search::search(&state.ctx, &request).await?;
    let took_ms = started.elapsed().as_millis() as u64;

    Ok(Json(SearchResponse {
        total: results.len(),
        results,
        took_ms,
    }))
}

// ───────────────────── POST /api/documents/index ─────────────────────

#[derive(Deserialize)]
struct IndexRequest {
    path: String,
    #[serde(default = "default_recursive")]
    recursive: bool,
}

fn default_recursive() -> bool {
    true
}

async fn handle_index(
    State(state): State<AppState>,
    Json(req): Json<IndexRequest>,
) -> Result<Json<IndexReport>, AppError> {
    if state.degraded.load(Ordering::Relaxed) {
        return Err(degraded_error());
    }

    let path = PathBuf::from(&req.path);
    if !path.exists() {
        return Err(not_found(format!("path not found: {}", req.path)));
    }

    let cancel = CancellationToken::new();
    let report = scheduler::index_path(&state.ctx, &path, req.recursive, &cancel)
        .await
        .map_err(|err| {
            if err.is_fatal() {
                state.degraded.store(true, Ordering::Relaxed);
            }
            AppError::from(err)
        })?;

    Ok(Json(report))
}

// ───────────────────────── document reads ─────────────────────────

#[derive(Serialize)]
struct StatsResponse {
    #[serde(flatten)]
    stats: StoreStats,
}

async fn handle_stats(State(state): State<AppState>) -> Result<Json<StatsResponse>, AppError> {
    let stats = state.ctx.store.stats().await?;
    Ok(Json(StatsResponse { stats }))
}

#[derive(Serialize)]
struct DirectoryEntry {
    path: String,
    file_count: i64,
}

async fn handle_directories(
    State(state): State<AppState>,
) -> Result<Json<Vec<DirectoryEntry>>, AppError> {
    let dirs = state.ctx.store.directories().await?;
    Ok(Json(
        dirs.into_iter()
            .map(|(path, file_count)| DirectoryEntry { path, file_count })
            .collect(),
    ))
}

#[derive(Deserialize)]
struct ListParams {
    limit: Option<i64>,
}

#[derive(Serialize)]
struct DocumentListResponse {
    total: usize,
    documents: Vec<Document>,
}

async fn handle_list_documents(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Result<Json<DocumentListResponse>, AppError> {
    let limit = params.limit.unwrap_or(50).clamp(1, 500);
    let documents = state.ctx.store.recent_documents(limit).await?;
    Ok(Json(DocumentListResponse {
        total: documents.len(),
        documents,
    }))
}

fn parse_doc_id(raw: &str) -> Result<Uuid, AppError> {
    Uuid::parse_str(raw).map_err(|_| bad_request(format!("invalid document id: {raw}")))
}

async fn handle_get_document(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
) -> Result<Json<Document>, AppError> {
    let id = parse_doc_id(&id)?;
    let doc = state
        .ctx
        .store
        .get_document(id)
        .await?
        .ok_or_else(|| not_found("document not found"))?;
    Ok(Json(doc))
}

async fn handle_get_transcript(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
) -> Result<Json<Transcript>, AppError> {
    let id = parse_doc_id(&id)?;
    if state.ctx.store.get_document(id).await?.is_none() {
        return Err(not_found("document not found"));
    }
    let transcript = state
        .ctx
        .store
        .get_transcript(id)
        .await?
        .ok_or_else(|| not_found("document has no transcript"))?;
    Ok(Json(transcript))
}

// ───────────────────────── actions ─────────────────────────

#[derive(Deserialize)]
struct OpenRequest {
    path: String,
    start_time: Option<f64>,
}

#[derive(Serialize)]
struct ActionResponse {
    success: bool,
    path: String,
}

async fn handle_open(
    State(_state): State<AppState>,
    Json(req): Json<OpenRequest>,
) -> Result<Json<ActionResponse>, AppError> {
    opener::open_file(std::path::Path::new(&req.path), req.start_time).await?;
    Ok(Json(ActionResponse {
        success: true,
        path: req.path,
    }))
}

#[derive(Deserialize)]
struct RevealRequest {
    path: String,
}

async fn handle_reveal(
    State(_state): State<AppState>,
    Json(req): Json<RevealRequest>,
) -> Result<Json<ActionResponse>, AppError> {
    opener::reveal_file(std::path::Path::new(&req.path)).await?;
    Ok(Json(ActionResponse {
        success: true,
        path: req.path,
    }))
}

// ───────────────────────── GET /health ─────────────────────────

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    degraded: bool,
}

async fn handle_health(State(state): State<AppState>) -> Json<HealthResponse> {
    let degraded = state.degraded.load(Ordering::Relaxed);
    Json(HealthResponse {
        status: if degraded { "degraded" } else { "ok" }.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        degraded,
    })
}
