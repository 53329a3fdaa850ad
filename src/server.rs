//! HTTP transport.
//!
//! A thin axum layer over [`IngestionCoordinator`]. Handlers validate the
//! request, call one coordinator operation, and map [`Error`] onto a status
//! code. Answer streams are sent as `text/event-stream`, one
//! [`encode_frame`] per event.
//!
//! # Endpoints
//!
//! | Method   | Path               | Description |
//! |----------|--------------------|-------------|
//! | `POST`   | `/api/upload`      | Multipart upload (`file` field); replaces the document set |
//! | `GET`    | `/api/files`       | Tracked documents |
//! | `GET`    | `/api/status`      | Status snapshot |
//! | `DELETE` | `/api/files/{id}`  | Remove one document (record id or stored name) |
//! | `POST`   | `/api/clear`       | Remove everything; `status: "warning"` if stored files were left |
//! | `POST`   | `/api/initialize`  | Rebuild from tracked documents |
//! | `GET`    | `/api/health`      | Liveness |
//! | `POST`   | `/api/chat/stream` | Retrieval-augmented answer (`model` picks the backend), event stream |
//! | `POST`   | `/api/chat/direct` | Direct chat, event stream |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "not_initialized", "message": "no index is initialized; upload a document first" } }
//! ```
//!
//! Codes: `bad_request` (400), `not_found` (404), `not_initialized` (409),
//! `internal` (500). Failures after an event stream has started are
//! reported in-band as an `error` event instead.

use std::convert::Infallible;
use std::sync::Arc;

use anyhow::Context;
use axum::{
    body::Body,
    extract::{DefaultBodyLimit, Multipart, Path, State},
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use futures::stream::{BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::config::{Config, StorageConfig};
use crate::coordinator::{FileEntry, IngestionCoordinator, StatusSnapshot};
use crate::encoder::encode_frame;
use crate::error::Error;
use crate::models::AnswerChunk;

#[derive(Clone)]
struct AppState {
    coordinator: IngestionCoordinator,
    storage: Arc<StorageConfig>,
}

/// Build the coordinator from `config`, bind `[server].bind`, and serve
/// until Ctrl-C.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let coordinator = IngestionCoordinator::from_config(config)
        .context("failed to initialize the ingestion pipeline")?;
    let listener = tokio::net::TcpListener::bind(&config.server.bind)
        .await
        .with_context(|| format!("failed to bind {}", config.server.bind))?;
    info!(
        bind = %config.server.bind,
        backends = ?coordinator.router().backend_names(),
        "docchat server listening"
    );

    axum::serve(listener, app(coordinator, config))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutting down");
        })
        .await?;
    Ok(())
}

/// The full router, for embedding or tests.
pub fn app(coordinator: IngestionCoordinator, config: &Config) -> Router {
    let state = AppState {
        coordinator,
        storage: Arc::new(config.storage.clone()),
    };

    // Multipart framing on top of the file itself.
    let body_limit = config.storage.max_file_size.saturating_add(64 * 1024);

    Router::new()
        .route("/api/upload", post(handle_upload))
        .route("/api/files", get(handle_files))
        .route("/api/files/{id}", delete(handle_delete))
        .route("/api/status", get(handle_status))
        .route("/api/clear", post(handle_clear))
        .route("/api/initialize", post(handle_initialize))
        .route("/api/health", get(handle_health))
        .route("/api/chat/stream", post(handle_chat_stream))
        .route("/api/chat/direct", post(handle_chat_direct))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(cors_layer(&config.server.cors_origins))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let cors = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if origins.is_empty() {
        return cors.allow_origin(Any);
    }
    let parsed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| match HeaderValue::from_str(o) {
            Ok(v) => Some(v),
            Err(_) => {
                warn!(origin = %o, "ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    cors.allow_origin(AllowOrigin::list(parsed))
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request",
        message: message.into(),
    }
}

impl From<Error> for AppError {
    fn from(err: Error) -> Self {
        let (status, code) = match &err {
            Error::Validation(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            Error::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            Error::NotInitialized => (StatusCode::CONFLICT, "not_initialized"),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        };
        if status.is_server_error() {
            tracing::error!(error = %err, "request failed");
        }
        AppError {
            status,
            code,
            message: err.to_string(),
        }
    }
}

/// Success body for ingestion endpoints.
#[derive(Serialize)]
struct Ack {
    status: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    filename: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    timestamp: DateTime<Utc>,
}

impl Ack {
    fn success(message: impl Into<String>) -> Self {
        Self {
            status: "success",
            message: message.into(),
            filename: None,
            id: None,
            timestamp: Utc::now(),
        }
    }

    fn warning(message: impl Into<String>) -> Self {
        Self {
            status: "warning",
            ..Self::success(message)
        }
    }
}

// ============ POST /api/upload ============

async fn handle_upload(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<Ack>, AppError> {
    let mut upload: Option<(String, Vec<u8>)> = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| bad_request(format!("malformed multipart body: {e}")))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let name = field.file_name().unwrap_or_default().to_string();
        let bytes = field
            .bytes()
            .await
            .map_err(|e| bad_request(format!("failed to read upload: {e}")))?;
        upload = Some((name, bytes.to_vec()));
        break;
    }

    let (name, bytes) = upload.ok_or_else(|| bad_request("no file part in the request"))?;
    if name.trim().is_empty() {
        return Err(bad_request("no file selected"));
    }
    if !state.storage.is_allowed(&name) {
        return Err(bad_request(format!(
            "file type not allowed; accepted: {}",
            state.storage.allowed_extensions.join(", ")
        )));
    }
    if bytes.len() > state.storage.max_file_size {
        return Err(bad_request(format!(
            "file is {} bytes; the limit is {}",
            bytes.len(),
            state.storage.max_file_size
        )));
    }

    let record = state.coordinator.submit(&name, &bytes).await?;
    Ok(Json(Ack {
        status: "processing",
        message: "file uploaded; indexing in the background".into(),
        filename: Some(record.original_name),
        id: Some(record.id),
        timestamp: Utc::now(),
    }))
}

// ============ GET /api/files ============

#[derive(Serialize)]
struct FilesResponse {
    files: Vec<FileEntry>,
    total: usize,
    status: &'static str,
}

async fn handle_files(State(state): State<AppState>) -> Json<FilesResponse> {
    let files = state.coordinator.files().await;
    Json(FilesResponse {
        total: files.len(),
        files,
        status: "success",
    })
}

// ============ DELETE /api/files/{id} ============

async fn handle_delete(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Ack>, AppError> {
    state.coordinator.remove(&id).await?;
    let mut ack = Ack::success("document removed");
    ack.id = Some(id);
    Ok(Json(ack))
}

// ============ GET /api/status ============

async fn handle_status(State(state): State<AppState>) -> Json<StatusSnapshot> {
    Json(state.coordinator.status().await)
}

// ============ POST /api/clear ============

async fn handle_clear(State(state): State<AppState>) -> Json<Ack> {
    let report = state.coordinator.clear_all().await;
    if report.is_clean() {
        Json(Ack::success("all documents cleared"))
    } else {
        Json(Ack::warning(format!(
            "documents cleared, but {} stored file(s) could not be removed",
            report.leftover_files
        )))
    }
}

// ============ POST /api/initialize ============

async fn handle_initialize(State(state): State<AppState>) -> Result<Json<Ack>, AppError> {
    let n = state.coordinator.reinitialize().await?;
    Ok(Json(Ack::success(format!("re-indexing {n} document(s)"))))
}

// ============ GET /api/health ============

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    message: String,
    version: &'static str,
    timestamp: DateTime<Utc>,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        message: "docchat is running".into(),
        version: env!("CARGO_PKG_VERSION"),
        timestamp: Utc::now(),
    })
}

// ============ POST /api/chat/* ============

#[derive(Deserialize)]
struct ChatRequest {
    #[serde(default)]
    message: String,
    /// Backend name; unknown names use the default backend.
    #[serde(default)]
    model: Option<String>,
}

impl ChatRequest {
    fn message(&self) -> Result<&str, AppError> {
        let message = self.message.trim();
        if message.is_empty() {
            return Err(bad_request("message must not be empty"));
        }
        Ok(message)
    }
}

async fn handle_chat_stream(
    State(state): State<AppState>,
    Json(req): Json<ChatRequest>,
) -> Result<Response, AppError> {
    let message = req.message()?;
    let events = state.coordinator.ask_events(message, req.model.as_deref()).await;
    Ok(event_stream(events))
}

async fn handle_chat_direct(
    State(state): State<AppState>,
    Json(req): Json<ChatRequest>,
) -> Result<Response, AppError> {
    let message = req.message()?;
    let events = state.coordinator.chat(message, req.model.as_deref());
    Ok(event_stream(events))
}

fn event_stream(events: BoxStream<'static, AnswerChunk>) -> Response {
    let frames = events.map(|chunk| Ok::<_, Infallible>(encode_frame(&chunk)));
    (
        [
            (header::CONTENT_TYPE, "text/event-stream"),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        Body::from_stream(frames),
    )
        .into_response()
}
