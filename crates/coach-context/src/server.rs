//! JSON HTTP API for the prompt layer and admin tooling.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Health check (returns version) |
//! | `POST` | `/search` | Knowledge query → `RagResponse` |
//! | `POST` | `/context` | Retrieval + windowing → `FormattedContext` |
//! | `POST` | `/reembed` | Backfill `{ "target": "<id>" \| "all" \| "missing" }` → `ReembedReport` |
//! | `GET`  | `/documents/missing` | Documents needing (re-)embedding |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "query must not be empty" } }
//! ```
//!
//! Error codes: `bad_request` (400), `embeddings_disabled` (400),
//! `embedding_failed` (502), `store_write_failed` (500), `internal` (500).
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted.

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use coach_context_core::error::ContextError;
use coach_context_core::format::FormattedContext;
use coach_context_core::models::RagResponse;
use coach_context_core::store::KnowledgeStore;

use crate::engine::{ContextRequest, Engine, SearchOptions};
use crate::reembed::{ReembedReport, ReembedTarget};

/// Starts the HTTP server on `[server].bind` and runs until terminated.
pub async fn run_server(engine: Engine) -> anyhow::Result<()> {
    let bind_addr = engine.config().server.bind.clone();
    let app = router(Arc::new(engine));

    info!(bind = %bind_addr, "server listening");
    println!("coachctx server listening on http://{}", bind_addr);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// Build the router; exposed so tests can serve it on an ephemeral port.
pub fn router(engine: Arc<Engine>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/search", post(handle_search))
        .route("/context", post(handle_context))
        .route("/reembed", post(handle_reembed))
        .route("/documents/missing", get(handle_missing))
        .layer(cors)
        .with_state(engine)
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

fn app_error(status: StatusCode, code: &str, message: impl Into<String>) -> AppError {
    AppError {
        status,
        code: code.to_string(),
        message: message.into(),
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    app_error(StatusCode::BAD_REQUEST, "bad_request", message)
}

/// Map engine errors to status codes by their typed kind.
fn classify_error(err: anyhow::Error) -> AppError {
    match err.downcast_ref::<ContextError>() {
        Some(ContextError::EmbeddingCallFailed { .. }) => {
            app_error(StatusCode::BAD_GATEWAY, "embedding_failed", err.to_string())
        }
        Some(ContextError::StoreWriteFailed { .. }) => app_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "store_write_failed",
            err.to_string(),
        ),
        _ => app_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal",
            format!("{:#}", err),
        ),
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ POST /search ============

#[derive(Deserialize)]
struct SearchBody {
    query: String,
    #[serde(default, flatten)]
    options: SearchOptions,
}

async fn handle_search(
    State(engine): State<Arc<Engine>>,
    Json(body): Json<SearchBody>,
) -> Result<Json<RagResponse>, AppError> {
    if body.query.trim().is_empty() {
        return Err(bad_request("query must not be empty"));
    }
    let resp = engine
        .search(&body.query, &body.options)
        .await
        .map_err(classify_error)?;
    Ok(Json(resp))
}

// ============ POST /context ============

async fn handle_context(
    State(engine): State<Arc<Engine>>,
    Json(req): Json<ContextRequest>,
) -> Result<Json<FormattedContext>, AppError> {
    let ctx = engine.context(&req).await.map_err(classify_error)?;
    Ok(Json(ctx))
}

// ============ POST /reembed ============

#[derive(Deserialize)]
struct ReembedBody {
    target: String,
}

async fn handle_reembed(
    State(engine): State<Arc<Engine>>,
    Json(body): Json<ReembedBody>,
) -> Result<Json<ReembedReport>, AppError> {
    if !engine.config().embedding.is_enabled() {
        return Err(app_error(
            StatusCode::BAD_REQUEST,
            "embeddings_disabled",
            "embedding provider is disabled",
        ));
    }
    let target: ReembedTarget = body
        .target
        .parse()
        .map_err(|e: anyhow::Error| bad_request(e.to_string()))?;
    let report = engine.reembed(&target).await.map_err(classify_error)?;
    Ok(Json(report))
}

// ============ GET /documents/missing ============

#[derive(Serialize)]
struct MissingResponse {
    /// Documents with no chunks at all.
    missing: Vec<String>,
    /// Documents with chunks that lack vectors.
    incomplete: Vec<String>,
}

async fn handle_missing(
    State(engine): State<Arc<Engine>>,
) -> Result<Json<MissingResponse>, AppError> {
    let store = engine.store();
    let missing = store.all_missing_embeddings().await.map_err(classify_error)?;
    let incomplete = store.incomplete_embeddings().await.map_err(classify_error)?;
    Ok(Json(MissingResponse {
        missing,
        incomplete,
    }))
}
