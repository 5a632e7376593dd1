//! Authenticated JSON job API over the ingestion pipeline.
//!
//! An external scheduler drives sweeps and maintenance through `/jobs/*`;
//! reviewers work candidate facts, URL candidates and series links through
//! the remaining routes. Everything except `/health` needs the job token.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, Request, State},
    http::{header, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tourney_core::{CandidateFact, FactKind, ReviewKind, Tournament, UrlCandidate};
use tourney_storage::StoreError;
use tourney_sync::{
    CandidateError, DiscoverySummary, FactActionSummary, FactError, Pipeline, PipelineConfig,
    RecomputeSummary, RegistryError, ResolveError, RevisitSummary, SweepRunSummary,
};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "tourney-web";

const DEFAULT_DISCOVERY_LIMIT: usize = 25;
const MAX_DISCOVERY_LIMIT: usize = 500;

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Pipeline,
    pub job_token: Option<String>,
}

impl AppState {
    pub fn new(pipeline: Pipeline) -> Self {
        let job_token = pipeline.config.job_token.clone();
        Self {
            pipeline,
            job_token,
        }
    }
}

/// JSON `{"error": ...}` with the status the failure maps to.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    fn from_store(err: &StoreError) -> Self {
        let status = match err {
            StoreError::NotFound { .. } => StatusCode::NOT_FOUND,
            StoreError::Conflict(_) => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            error!(status = self.status.as_u16(), error = %self.message, "job request failed");
        }
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        Self::from_store(&err)
    }
}

impl From<RegistryError> for ApiError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::InvalidUrl(e) => Self::bad_request(e.to_string()),
            RegistryError::Store(e) => e.into(),
        }
    }
}

impl From<ResolveError> for ApiError {
    fn from(err: ResolveError) -> Self {
        let status = match &err {
            ResolveError::InvalidRecord(_) => StatusCode::BAD_REQUEST,
            ResolveError::NotFound(_) => StatusCode::NOT_FOUND,
            ResolveError::InvalidTransition { .. } | ResolveError::Conflict(_) => StatusCode::CONFLICT,
            ResolveError::Store(e) => return Self::from_store(e),
        };
        Self::new(status, err.to_string())
    }
}

impl From<FactError> for ApiError {
    fn from(err: FactError) -> Self {
        match err {
            FactError::EntityNotFound(_) | FactError::NotFound(_) => Self::not_found(err.to_string()),
            FactError::Store(e) => e.into(),
        }
    }
}

impl From<CandidateError> for ApiError {
    fn from(err: CandidateError) -> Self {
        match err {
            CandidateError::ExternalProviderUnavailable(_) => {
                Self::new(StatusCode::SERVICE_UNAVAILABLE, err.to_string())
            }
            CandidateError::Store(e) => e.into(),
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, format!("{err:#}"))
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

pub fn app(state: AppState) -> Router {
    let state = Arc::new(state);
    let protected = Router::new()
        .route("/jobs/sweep", post(sweep_handler))
        .route("/jobs/discover-urls", post(discover_urls_handler))
        .route("/jobs/scores/{kind}", post(recompute_scores_handler))
        .route("/jobs/dead-domains/revisit", post(revisit_domains_handler))
        .route("/tournaments/{id}/facts", get(list_facts_handler))
        .route("/tournaments/{id}/url-candidates", get(url_candidates_handler))
        .route("/tournaments/{id}/series", post(link_series_handler))
        .route("/facts/{id}/accept", post(accept_fact_handler))
        .route("/facts/{id}/reject", post(reject_fact_handler))
        .route("/facts/{id}", delete(delete_fact_handler))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_job_token));

    Router::new()
        .route("/health", get(health_handler))
        .merge(protected)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn serve(pipeline: Pipeline, port: u16) -> anyhow::Result<()> {
    let state = AppState::new(pipeline);
    if state.job_token.is_none() {
        warn!("TOURNEY_JOB_TOKEN is not set; every job route will answer 401");
    }
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "job api listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let config = PipelineConfig::load();
    let port = config.web_port;
    let store = tourney_sync::connect_store(&config).await?;
    let pipeline = Pipeline::from_config(config, store)?;
    serve(pipeline, port).await
}

/// Bearer check against the configured token. With no token configured the
/// protected routes are closed.
async fn require_job_token(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    let presented = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim);

    match (state.job_token.as_deref(), presented) {
        (Some(expected), Some(token)) if token == expected => next.run(request).await,
        _ => ApiError::new(StatusCode::UNAUTHORIZED, "missing or invalid bearer token").into_response(),
    }
}

fn parse_id(raw: &str) -> Result<Uuid, ApiError> {
    raw.parse()
        .map_err(|_| ApiError::bad_request(format!("invalid id: {raw}")))
}

async fn require_tournament(state: &AppState, id: Uuid) -> Result<Tournament, ApiError> {
    state
        .pipeline
        .store
        .tournament(id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("tournament not found: {id}")))
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok", "service": CRATE_NAME }))
}

#[derive(Debug, Deserialize)]
struct SweepQuery {
    source: Option<String>,
}

async fn sweep_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SweepQuery>,
) -> ApiResult<SweepRunSummary> {
    let pipeline = &state.pipeline;
    let summary = match query.source.as_deref().filter(|s| !s.trim().is_empty()) {
        Some(url) => {
            let source = pipeline
                .registry
                .get_by_url(url)
                .await?
                .ok_or_else(|| ApiError::not_found(format!("source not registered: {url}")))?;
            pipeline.sweep.run_sources(vec![source]).await?
        }
        None => pipeline.sweep.run_once().await?,
    };
    Ok(Json(summary))
}

#[derive(Debug, Deserialize)]
struct DiscoverQuery {
    limit: Option<usize>,
}

async fn discover_urls_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<DiscoverQuery>,
) -> ApiResult<DiscoverySummary> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_DISCOVERY_LIMIT)
        .clamp(1, MAX_DISCOVERY_LIMIT);
    let summary = state.pipeline.candidates.discover_urls_batch(limit).await?;
    Ok(Json(summary))
}

async fn recompute_scores_handler(
    State(state): State<Arc<AppState>>,
    Path(kind): Path<String>,
) -> ApiResult<RecomputeSummary> {
    let kind: ReviewKind = kind.parse().map_err(|e: tourney_core::ParseEnumError| {
        ApiError::bad_request(e.to_string())
    })?;
    let summary = state.pipeline.scores.recompute(kind).await?;
    Ok(Json(summary))
}

async fn revisit_domains_handler(State(state): State<Arc<AppState>>) -> ApiResult<RevisitSummary> {
    Ok(Json(state.pipeline.domains.revisit().await?))
}

#[derive(Debug, Deserialize)]
struct FactsQuery {
    kind: Option<String>,
}

async fn list_facts_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<FactsQuery>,
) -> ApiResult<Vec<CandidateFact>> {
    let id = parse_id(&id)?;
    let kind = query
        .kind
        .as_deref()
        .map(str::parse::<FactKind>)
        .transpose()
        .map_err(|e| ApiError::bad_request(e.to_string()))?;
    require_tournament(&state, id).await?;
    Ok(Json(state.pipeline.facts.list(id, kind).await?))
}

async fn accept_fact_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<FactActionSummary> {
    let id = parse_id(&id)?;
    Ok(Json(state.pipeline.facts.accept(id).await?))
}

async fn reject_fact_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<FactActionSummary> {
    let id = parse_id(&id)?;
    Ok(Json(state.pipeline.facts.reject(id).await?))
}

async fn delete_fact_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<FactActionSummary> {
    let id = parse_id(&id)?;
    Ok(Json(state.pipeline.facts.delete(id).await?))
}

async fn url_candidates_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Vec<UrlCandidate>> {
    let id = parse_id(&id)?;
    require_tournament(&state, id).await?;
    Ok(Json(state.pipeline.store.url_candidates(id).await?))
}

#[derive(Debug, Deserialize)]
struct LinkSeriesBody {
    parent_id: Uuid,
}

async fn link_series_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<LinkSeriesBody>,
) -> ApiResult<Tournament> {
    let child = parse_id(&id)?;
    let linked = state.pipeline.resolver.link_series(child, body.parent_id).await?;
    info!(child = %child, parent = %body.parent_id, "series linked");
    Ok(Json(linked))
}
