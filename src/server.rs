//! JSON HTTP API.
//!
//! Exposes the quote library, similarity queries, the graph export and the
//! recompute trigger over HTTP for the web frontend.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`    | `/health` | Health check (returns version) |
//! | `POST`   | `/quotes` | Create a quote (201), or merge into one with the same text (200) |
//! | `GET`    | `/quotes?person=&cluster_id=&limit=` | List quotes, newest first |
//! | `GET`    | `/quotes/{id}` | A quote and its most similar quotes |
//! | `PUT`    | `/quotes/{id}` | Edit a quote |
//! | `DELETE` | `/quotes/{id}` | Delete a quote (204) |
//! | `GET`    | `/search?q=&limit=` | Substring search over text, context and author |
//! | `GET`    | `/similar/{id}?top_k=` | Nearest neighbors |
//! | `GET`    | `/similarity/{a}/{b}` | Cosine similarity of two quotes |
//! | `GET`    | `/people` | All people |
//! | `POST`   | `/people` | Create a person (409 if the name exists) |
//! | `GET`    | `/graph` | Graph export |
//! | `GET`    | `/analytics/stats` | Library statistics |
//! | `POST`   | `/analytics/recompute` | Rebuild edges, clusters and layout |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "not_found", "message": "quote not found: 42" } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404), `busy` (409),
//! `conflict` (409), `embedding_unavailable` (503), `internal` (500).

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::{error, info, warn};

use quotemap_core::models::{Neighbor, NewQuote, Person, Quote, QuoteFilter, QuoteUpdate};
use quotemap_core::quotes::CreateOutcome;
use quotemap_core::EngineError;

use crate::config::{Config, ServerConfig};
use crate::export::{build_graph, GraphExport};
use crate::services::{self, Services};
use crate::stats::TOP_PEOPLE;

const DEFAULT_LIST_LIMIT: usize = 100;
const DEFAULT_SEARCH_LIMIT: usize = 20;

/// Shared application state passed to all route handlers via Axum's `State` extractor.
#[derive(Clone)]
struct AppState {
    services: Arc<Services>,
}

/// Starts the HTTP server on `[server].bind` and serves until the process
/// is terminated.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let bind_addr = config.server.bind.clone();
    let services = Arc::new(Services::open(config).await?);
    let app = router(services);

    info!(bind = %bind_addr, "HTTP server starting");
    println!("Quotemap API listening on http://{}", bind_addr);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// Build the router over already-opened services.
pub fn router(services: Arc<Services>) -> Router {
    let cors = cors_layer(&services.config.server);
    let state = AppState { services };

    Router::new()
        .route("/health", get(handle_health))
        .route("/quotes", get(handle_list_quotes).post(handle_create_quote))
        .route(
            "/quotes/{id}",
            get(handle_get_quote)
                .put(handle_update_quote)
                .delete(handle_delete_quote),
        )
        .route("/search", get(handle_search))
        .route("/similar/{id}", get(handle_similar))
        .route("/similarity/{a}/{b}", get(handle_similarity))
        .route("/people", get(handle_list_people).post(handle_create_person))
        .route("/graph", get(handle_graph))
        .route("/analytics/stats", get(handle_stats))
        .route("/analytics/recompute", post(handle_recompute))
        .layer(cors)
        .with_state(state)
}

fn cors_layer(server: &ServerConfig) -> CorsLayer {
    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if server.cors_origins.iter().any(|o| o == "*") {
        return layer.allow_origin(Any);
    }
    let origins: Vec<HeaderValue> = server
        .cors_origins
        .iter()
        .filter_map(|o| match HeaderValue::from_str(o) {
            Ok(v) => Some(v),
            Err(_) => {
                warn!(origin = %o, "ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    layer.allow_origin(AllowOrigin::list(origins))
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    /// Machine-readable error code (e.g., `"bad_request"`, `"busy"`).
    code: &'static str,
    message: String,
}

/// Internal error type that converts into an Axum HTTP response.
#[derive(Debug)]
struct AppError {
    status: StatusCode,
    code: &'static str,
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

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request",
        message: message.into(),
    }
}

fn conflict(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::CONFLICT,
        code: "conflict",
        message: message.into(),
    }
}

fn internal(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal",
        message: message.into(),
    }
}

impl From<EngineError> for AppError {
    fn from(err: EngineError) -> Self {
        let message = err.to_string();
        match err {
            EngineError::Busy => AppError {
                status: StatusCode::CONFLICT,
                code: "busy",
                message,
            },
            EngineError::NotFound { .. } => AppError {
                status: StatusCode::NOT_FOUND,
                code: "not_found",
                message,
            },
            EngineError::InvalidParameter(_) => bad_request(message),
            EngineError::DimensionMismatch { .. } => conflict(message),
            EngineError::Embedding(_) => AppError {
                status: StatusCode::SERVICE_UNAVAILABLE,
                code: "embedding_unavailable",
                message,
            },
            EngineError::Store(e) => {
                error!(error = %e, "store failure");
                internal(format!("store error: {}", e))
            }
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        error!(error = %err, "request failed");
        internal(err.to_string())
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

// ============ /quotes ============

async fn handle_create_quote(
    State(state): State<AppState>,
    Json(input): Json<NewQuote>,
) -> Result<(StatusCode, Json<Quote>), AppError> {
    let (quote, outcome) = state.services.quotes.create_with_outcome(input).await?;
    let status = match outcome {
        CreateOutcome::Created => StatusCode::CREATED,
        CreateOutcome::Merged => StatusCode::OK,
    };
    Ok((status, Json(quote)))
}

#[derive(Debug, Deserialize)]
struct ListParams {
    person: Option<String>,
    cluster_id: Option<u32>,
    limit: Option<usize>,
}

async fn handle_list_quotes(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Result<Json<Vec<Quote>>, AppError> {
    let filter = QuoteFilter {
        person: params.person,
        cluster_id: params.cluster_id,
        limit: Some(params.limit.unwrap_or(DEFAULT_LIST_LIMIT)),
    };
    Ok(Json(state.services.store.list_quotes(&filter).await?))
}

/// A neighbor joined with its quote for display.
#[derive(Serialize)]
struct SimilarQuote {
    similarity: f64,
    quote: Quote,
}

#[derive(Serialize)]
struct QuoteDetail {
    quote: Quote,
    similar: Vec<SimilarQuote>,
}

async fn hydrate(state: &AppState, neighbors: Vec<Neighbor>) -> Result<Vec<SimilarQuote>, AppError> {
    let mut out = Vec::with_capacity(neighbors.len());
    for n in neighbors {
        // A quote deleted since the neighbor scan is simply dropped
        if let Some(quote) = state.services.store.get_quote(&n.quote_id).await? {
            out.push(SimilarQuote {
                similarity: n.similarity,
                quote,
            });
        }
    }
    Ok(out)
}

async fn handle_get_quote(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<QuoteDetail>, AppError> {
    let quote = state.services.quotes.get(&id).await?;
    let top_k = state.services.config.similarity.default_top_k;
    let neighbors = state.services.engine.neighbors(&id, top_k).await?;
    let similar = hydrate(&state, neighbors).await?;
    Ok(Json(QuoteDetail { quote, similar }))
}

async fn handle_update_quote(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(update): Json<QuoteUpdate>,
) -> Result<Json<Quote>, AppError> {
    Ok(Json(state.services.quotes.update(&id, update).await?))
}

async fn handle_delete_quote(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    state.services.quotes.delete(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ============ GET /search ============

#[derive(Debug, Deserialize)]
struct SearchParams {
    #[serde(default)]
    q: String,
    limit: Option<usize>,
}

async fn handle_search(
    State(state): State<AppState>,
    Query(params): Query<SearchParams>,
) -> Result<Json<Vec<Quote>>, AppError> {
    if params.q.trim().is_empty() {
        return Err(bad_request("q must not be empty"));
    }
    let limit = params.limit.unwrap_or(DEFAULT_SEARCH_LIMIT);
    Ok(Json(state.services.store.search_quotes(params.q.trim(), limit).await?))
}

// ============ Similarity ============

#[derive(Debug, Deserialize)]
struct SimilarParams {
    top_k: Option<usize>,
}

async fn handle_similar(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<SimilarParams>,
) -> Result<Json<Vec<SimilarQuote>>, AppError> {
    let top_k = params
        .top_k
        .unwrap_or(state.services.config.similarity.default_top_k);
    let neighbors = state.services.engine.neighbors(&id, top_k).await?;
    Ok(Json(hydrate(&state, neighbors).await?))
}

#[derive(Serialize)]
struct SimilarityResponse {
    source_id: String,
    target_id: String,
    similarity: f64,
}

async fn handle_similarity(
    State(state): State<AppState>,
    Path((a, b)): Path<(String, String)>,
) -> Result<Json<SimilarityResponse>, AppError> {
    let similarity = state.services.engine.similarity_between(&a, &b).await?;
    Ok(Json(SimilarityResponse {
        source_id: a,
        target_id: b,
        similarity,
    }))
}

// ============ /people ============

#[derive(Debug, Deserialize)]
struct CreatePersonRequest {
    name: String,
    bio: Option<String>,
    image_url: Option<String>,
}

async fn handle_list_people(State(state): State<AppState>) -> Result<Json<Vec<Person>>, AppError> {
    Ok(Json(state.services.store.list_people().await?))
}

async fn handle_create_person(
    State(state): State<AppState>,
    Json(req): Json<CreatePersonRequest>,
) -> Result<(StatusCode, Json<Person>), AppError> {
    let name = req.name.trim();
    if name.is_empty() {
        return Err(bad_request("name must not be empty"));
    }
    let created = state
        .services
        .store
        .create_person(name, req.bio.as_deref(), req.image_url.as_deref())
        .await?;
    match created {
        Some(person) => Ok((StatusCode::CREATED, Json(person))),
        None => Err(conflict(format!("person already exists: {}", name))),
    }
}

// ============ Read models ============

async fn handle_graph(State(state): State<AppState>) -> Result<Json<GraphExport>, AppError> {
    Ok(Json(build_graph(state.services.store.as_ref()).await?))
}

async fn handle_stats(
    State(state): State<AppState>,
) -> Result<Json<quotemap_core::store::StoreStats>, AppError> {
    Ok(Json(state.services.store.stats(TOP_PEOPLE).await?))
}

// ============ POST /analytics/recompute ============

#[derive(Debug, Default, Deserialize)]
struct RecomputeRequest {
    threshold: Option<f64>,
}

/// The body is optional; an empty body uses the configured threshold.
async fn handle_recompute(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<quotemap_core::models::RecomputeSummary>, AppError> {
    let req: RecomputeRequest = if body.iter().all(u8::is_ascii_whitespace) {
        RecomputeRequest::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| bad_request(format!("invalid body: {}", e)))?
    };

    // Runs as its own task so a disconnecting client does not abort the
    // recompute halfway.
    let engine = state.services.engine.clone();
    let summary = tokio::spawn(async move { services::recompute(&engine, req.threshold).await })
        .await
        .map_err(|e| internal(format!("recompute task failed: {}", e)))??;
    Ok(Json(summary))
}
