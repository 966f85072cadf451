//! Operational HTTP server.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Liveness check (returns version) |
//! | `GET`  | `/status` | Per-source health, watermark age, cache counts |
//! | `POST` | `/sources/{source}/trigger` | Enqueue an out-of-schedule cycle |
//! | `POST` | `/search` | Hybrid search as a caller identity |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "query must not be empty" } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404),
//! `search_unavailable` (503), `internal` (500).

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

use sync_harness_core::models::SourceType;
use sync_harness_core::search::{ScoredResult, SearchUnavailable};

use crate::config::Config;
use crate::search::caller_filter;
use crate::services::Services;
use crate::status::{source_health, trigger, SourceHealth};

#[derive(Clone)]
struct AppState {
    services: Arc<Services>,
}

/// Build the router over shared services. Exposed for in-process tests.
pub fn router(services: Arc<Services>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/status", get(handle_status))
        .route("/sources/{source}/trigger", post(handle_trigger))
        .route("/search", post(handle_search))
        .layer(cors)
        .with_state(AppState { services })
}

/// `shx serve`: bind to `[server].bind` and serve until Ctrl-C.
pub async fn run_server(config: Config) -> anyhow::Result<()> {
    let bind_addr = config.server.bind.clone();
    let services = Arc::new(Services::open(config).await?);
    let app = router(Arc::clone(&services));

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!(bind = %bind_addr, "HTTP server listening");
    println!("Listening on http://{}", bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    services.close().await;
    Ok(())
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

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found",
        message: message.into(),
    }
}

fn internal(err: anyhow::Error) -> AppError {
    error!(error = %format!("{err:#}"), "Request failed");
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal",
        message: format!("{err:#}"),
    }
}

impl From<SearchUnavailable> for AppError {
    fn from(err: SearchUnavailable) -> Self {
        error!(error = %err, "Search unavailable");
        AppError {
            status: StatusCode::SERVICE_UNAVAILABLE,
            code: "search_unavailable",
            message: err.to_string(),
        }
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

// ============ GET /status ============

#[derive(Serialize)]
struct StatusResponse {
    sources: Vec<SourceHealth>,
}

async fn handle_status(State(state): State<AppState>) -> Result<Json<StatusResponse>, AppError> {
    let sources = source_health(&state.services, Utc::now())
        .await
        .map_err(internal)?;
    Ok(Json(StatusResponse { sources }))
}

// ============ POST /sources/{source}/trigger ============

#[derive(Serialize)]
struct TriggerResponse {
    task_id: String,
    source_type: SourceType,
}

async fn handle_trigger(
    State(state): State<AppState>,
    Path(source): Path<String>,
) -> Result<(StatusCode, Json<TriggerResponse>), AppError> {
    let source_type: SourceType = source
        .parse()
        .map_err(|_| not_found(format!("unknown source: {}", source)))?;
    if state.services.config.source(source_type).is_err() {
        return Err(not_found(format!("source not configured: {}", source)));
    }
    let task_id = trigger(&state.services, source_type)
        .await
        .map_err(internal)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(TriggerResponse {
            task_id,
            source_type,
        }),
    ))
}

// ============ POST /search ============

#[derive(Deserialize)]
struct SearchRequest {
    query: String,
    /// Caller identity; omitted means public entries only.
    #[serde(default)]
    identity: Option<String>,
    #[serde(default)]
    limit: Option<usize>,
}

#[derive(Serialize)]
struct SearchResponse {
    results: Vec<ScoredResult>,
}

async fn handle_search(
    State(state): State<AppState>,
    Json(req): Json<SearchRequest>,
) -> Result<Json<SearchResponse>, AppError> {
    if req.query.trim().is_empty() {
        return Err(bad_request("query must not be empty"));
    }
    if req.limit == Some(0) {
        return Err(bad_request("limit must be >= 1"));
    }
    let services = &state.services;
    let filter = caller_filter(services, req.identity.as_deref())
        .await
        .map_err(internal)?;
    let top_k = req.limit.unwrap_or(services.config.retrieval.final_limit);
    let results = services.query_engine().search(&req.query, &filter, top_k).await?;
    Ok(Json(SearchResponse { results }))
}
