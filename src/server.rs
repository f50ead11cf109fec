//! JSON HTTP API for the batch pipeline.
//!
//! Exposes the external protocol surface — submit a batch, poll its status,
//! fetch its report — plus a health check for load balancers.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/batches` | Submit a batch of documents, returns the batch id |
//! | `GET`  | `/batches/{id}` | Batch status with counts and summary |
//! | `GET`  | `/batches/{id}/report` | Durable report, or `not_ready` |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! # Error Contract
//!
//! All error responses follow the same schema:
//!
//! ```json
//! { "error": { "code": "not_ready", "message": "batch is still processing" } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404), `not_ready` (409),
//! `internal` (500).
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted to support browser-based
//! dashboards polling batch status.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::batches::{self, DocumentSubmission, ReportFetch};
use crate::config::Config;
use crate::models::BatchSummary;
use crate::store::ContentStore;

/// Shared application state passed to all route handlers via Axum's `State` extractor.
#[derive(Clone)]
struct AppState {
    config: Arc<Config>,
    pool: sqlx::SqlitePool,
    store: Arc<dyn ContentStore>,
}

/// Starts the batch API server.
///
/// Binds to the address configured in `[server].bind` and registers all
/// route handlers. The server runs indefinitely until the process is
/// terminated.
pub async fn run_server(
    config: &Config,
    pool: sqlx::SqlitePool,
    store: Arc<dyn ContentStore>,
) -> anyhow::Result<()> {
    let bind_addr = config.server.bind.clone();

    let state = AppState {
        config: Arc::new(config.clone()),
        pool,
        store,
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/batches", post(handle_submit_batch))
        .route("/batches/{id}", get(handle_batch_status))
        .route("/batches/{id}/report", get(handle_batch_report))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(state);

    println!("Batch API listening on http://{}", bind_addr);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

// ============ Error response ============

/// JSON error response body.
#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

/// Inner error detail with a machine-readable code and human-readable message.
#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

/// Internal error type that converts into an Axum HTTP response.
struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

/// Constructs a 400 Bad Request error.
fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

/// Constructs a 404 Not Found error.
fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found".to_string(),
        message: message.into(),
    }
}

/// Constructs a 409 Conflict error for reports that are not ready yet.
fn not_ready(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::CONFLICT,
        code: "not_ready".to_string(),
        message: message.into(),
    }
}

/// Constructs a 500 Internal error.
fn internal(err: anyhow::Error) -> AppError {
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal".to_string(),
        message: err.to_string(),
    }
}

// ============ GET /health ============

/// JSON response body for `GET /health`.
#[derive(Serialize)]
struct HealthResponse {
    /// Always `"ok"` when the server is running.
    status: String,
    /// The crate version from `Cargo.toml`.
    version: String,
}

/// Handler for `GET /health`.
async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ POST /batches ============

/// One document in a submission request.
#[derive(Deserialize)]
struct SubmitDocument {
    #[serde(default)]
    filename: Option<String>,
    content: String,
}

/// JSON request body for `POST /batches`.
#[derive(Deserialize)]
struct SubmitBatchRequest {
    #[serde(default = "default_owner")]
    owner_id: String,
    documents: Vec<SubmitDocument>,
}

fn default_owner() -> String {
    "anonymous".to_string()
}

/// JSON response body for `POST /batches`.
#[derive(Serialize)]
struct SubmitBatchResponse {
    batch_id: String,
    total_documents: usize,
}

/// Handler for `POST /batches`. Returns as soon as the batch and its
/// dispatches are durable; analysis is asynchronous.
async fn handle_submit_batch(
    State(state): State<AppState>,
    Json(request): Json<SubmitBatchRequest>,
) -> Result<Json<SubmitBatchResponse>, AppError> {
    if request.documents.is_empty() {
        return Err(bad_request("documents must not be empty"));
    }

    let total = request.documents.len();
    let documents: Vec<DocumentSubmission> = request
        .documents
        .into_iter()
        .map(|d| DocumentSubmission {
            filename: d.filename,
            content: d.content.into_bytes(),
        })
        .collect();

    let batch_id = batches::submit_batch(
        &state.pool,
        state.store.as_ref(),
        &state.config.storage,
        &request.owner_id,
        documents,
    )
    .await
    .map_err(internal)?;

    Ok(Json(SubmitBatchResponse {
        batch_id,
        total_documents: total,
    }))
}

// ============ GET /batches/{id} ============

/// JSON response body for `GET /batches/{id}`.
#[derive(Serialize)]
struct BatchStatusResponse {
    batch_id: String,
    status: String,
    total_documents: i64,
    processed_count: i64,
    failed_count: i64,
    intervene_count: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    summary: Option<BatchSummary>,
}

/// Handler for `GET /batches/{id}`.
async fn handle_batch_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<BatchStatusResponse>, AppError> {
    let view = batches::get_batch_status(&state.pool, &id)
        .await
        .map_err(internal)?
        .ok_or_else(|| not_found(format!("no batch with id: {}", id)))?;

    Ok(Json(BatchStatusResponse {
        batch_id: view.batch_id,
        status: view.status.as_str().to_string(),
        total_documents: view.total_documents,
        processed_count: view.processed_count,
        failed_count: view.failed_count,
        intervene_count: view.intervene_count,
        summary: view.summary,
    }))
}

// ============ GET /batches/{id}/report ============

/// Handler for `GET /batches/{id}/report`.
///
/// Returns the durable report once the batch is terminal; `409 not_ready`
/// while analysis is still in flight.
async fn handle_batch_report(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let fetch = batches::get_batch_report(&state.pool, state.store.as_ref(), &id)
        .await
        .map_err(internal)?;

    match fetch {
        ReportFetch::Ready(report) => Ok(Json(report)),
        ReportFetch::NotReady { status } => Err(not_ready(format!(
            "batch is {}; report is not available yet",
            status.as_str()
        ))),
        ReportFetch::NotFound => Err(not_found(format!("no batch with id: {}", id))),
    }
}
