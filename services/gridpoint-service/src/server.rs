//! HTTP API for lookups and refresh status.
//!
//! Endpoints:
//! - `GET /gridpoint?lat=&lon=[&fallback=true]`
//! - `GET /cells/:cell_id/history`
//! - `GET /runs?limit=`, `GET /runs/:run_id`
//! - `GET /status`, `GET /health`, `GET /metrics`

use std::future::Future;
use std::sync::Arc;

use axum::{
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use chrono::{DateTime, Utc};
use gridpoint_common::{CellId, GridpointError, GridpointId, PointMetadata};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use storage::{
    CatalogCell, CellCounts, GridpointStore, GridpointVersion, PartitionRecord, RefreshRun,
    RunFailure, StorageError, VersionStats,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::lookup::{LookupError, LookupOutcome, LookupService};

const DEFAULT_RUNS_LIMIT: usize = 20;
const MAX_RUNS_LIMIT: usize = 200;

// ============================================================================
// Response Types
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct GridpointResponse {
    pub status: &'static str,
    /// `table` for stored mappings, `live` for on-demand resolution.
    pub source: &'static str,
    pub cell_id: Option<CellId>,
    pub office: String,
    pub grid_x: u32,
    pub grid_y: u32,
    pub gridpoint: String,
    pub forecast_path: String,
    pub forecast_hourly_path: String,
    pub effective_from: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<PointMetadata>,
}

impl GridpointResponse {
    fn new(gridpoint: &GridpointId, source: &'static str, cell_id: Option<CellId>) -> Self {
        Self {
            status: "resolved",
            source,
            cell_id,
            office: gridpoint.office_code().to_string(),
            grid_x: gridpoint.grid_x(),
            grid_y: gridpoint.grid_y(),
            gridpoint: gridpoint.to_string(),
            forecast_path: gridpoint.forecast_path(),
            forecast_hourly_path: gridpoint.forecast_hourly_path(),
            effective_from: None,
            metadata: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MissResponse {
    pub status: &'static str,
    pub cell_id: Option<CellId>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HistoryResponse {
    pub cell: CatalogCell,
    pub versions: Vec<GridpointVersion>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunsResponse {
    pub runs: Vec<RefreshRun>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunDetailResponse {
    pub run: RefreshRun,
    pub failures: Vec<RunFailure>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusResponse {
    pub service: &'static str,
    pub cells: CellCounts,
    pub index_cells: usize,
    pub versions: VersionStats,
    pub latest_partition: Option<PartitionRecord>,
    pub latest_run: Option<RefreshRun>,
    pub fallback_enabled: bool,
}

// ============================================================================
// Query Parameters
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct GridpointQuery {
    pub lat: f64,
    pub lon: f64,
    #[serde(default)]
    pub fallback: bool,
}

#[derive(Debug, Deserialize)]
pub struct RunsQuery {
    pub limit: Option<usize>,
}

// ============================================================================
// Shared State
// ============================================================================

pub struct ServerState {
    pub lookup: Arc<LookupService>,
    pub store: GridpointStore,
    pub prometheus: Option<PrometheusHandle>,
}

// ============================================================================
// Errors
// ============================================================================

/// JSON error body built from the shared error taxonomy.
pub struct ApiError(GridpointError);

impl From<GridpointError> for ApiError {
    fn from(err: GridpointError) -> Self {
        ApiError(err)
    }
}

impl From<StorageError> for ApiError {
    fn from(err: StorageError) -> Self {
        ApiError(err.into())
    }
}

impl From<LookupError> for ApiError {
    fn from(err: LookupError) -> Self {
        ApiError(err.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.http_status_code())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (
            status,
            Json(serde_json::json!({
                "error": self.0.error_code(),
                "message": self.0.to_string(),
            })),
        )
            .into_response()
    }
}

// ============================================================================
// Router
// ============================================================================

pub fn create_router(state: Arc<ServerState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/gridpoint", get(gridpoint_handler))
        .route("/cells/:cell_id/history", get(history_handler))
        .route("/runs", get(runs_handler))
        .route("/runs/:run_id", get(run_detail_handler))
        .route("/status", get(status_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(Extension(state))
}

// ============================================================================
// Handlers
// ============================================================================

/// GET /gridpoint - Coordinate to gridpoint
async fn gridpoint_handler(
    Extension(state): Extension<Arc<ServerState>>,
    Query(query): Query<GridpointQuery>,
) -> Result<Response, ApiError> {
    let outcome = state
        .lookup
        .forecast_gridpoint_for(query.lat, query.lon)
        .await?;

    let miss = match outcome {
        LookupOutcome::Resolved {
            cell_id,
            version,
            metadata,
        } => {
            let mut body = GridpointResponse::new(&version.gridpoint, "table", Some(cell_id));
            body.effective_from = Some(version.effective_from);
            body.metadata = metadata;
            return Ok(Json(body).into_response());
        }
        LookupOutcome::NotCovered => MissResponse {
            status: "not_covered",
            cell_id: None,
        },
        LookupOutcome::NotYetResolved { cell_id } => MissResponse {
            status: "not_yet_resolved",
            cell_id: Some(cell_id),
        },
    };

    if query.fallback && state.lookup.fallback_enabled() {
        let resolution = state
            .lookup
            .resolve_on_demand(query.lat, query.lon)
            .await?;
        let mut body = GridpointResponse::new(&resolution.gridpoint, "live", miss.cell_id);
        body.metadata = Some(resolution.metadata);
        return Ok(Json(body).into_response());
    }

    Ok((StatusCode::NOT_FOUND, Json(miss)).into_response())
}

/// GET /cells/:cell_id/history - Full SCD2 history of a cell
async fn history_handler(
    Extension(state): Extension<Arc<ServerState>>,
    Path(cell_id): Path<i64>,
) -> Result<Json<HistoryResponse>, ApiError> {
    let cell_id = CellId(cell_id);
    let cell = state
        .store
        .catalog()
        .cell(cell_id)
        .await?
        .ok_or(GridpointError::CellNotFound(cell_id.0))?;
    let versions = state.store.versions().history(cell_id).await?;
    Ok(Json(HistoryResponse { cell, versions }))
}

/// GET /runs - Recent refresh runs
async fn runs_handler(
    Extension(state): Extension<Arc<ServerState>>,
    Query(query): Query<RunsQuery>,
) -> Result<Json<RunsResponse>, ApiError> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_RUNS_LIMIT)
        .clamp(1, MAX_RUNS_LIMIT);
    let runs = state.store.runs().list(limit).await?;
    Ok(Json(RunsResponse { runs }))
}

/// GET /runs/:run_id - One run and its failed cells
async fn run_detail_handler(
    Extension(state): Extension<Arc<ServerState>>,
    Path(run_id): Path<i64>,
) -> Result<Json<RunDetailResponse>, ApiError> {
    let runs = state.store.runs();
    let run = runs
        .get(run_id)
        .await?
        .ok_or(GridpointError::RunNotFound(run_id))?;
    let failures = runs.failures(run_id).await?;
    Ok(Json(RunDetailResponse { run, failures }))
}

/// GET /status - Table coverage and latest run
async fn status_handler(
    Extension(state): Extension<Arc<ServerState>>,
) -> Result<Json<StatusResponse>, ApiError> {
    let store = &state.store;
    Ok(Json(StatusResponse {
        service: "gridpoint-service",
        cells: store.catalog().counts().await?,
        index_cells: state.lookup.index().load().len(),
        versions: store.versions().stats().await?,
        latest_partition: store.catalog().latest_partition().await?,
        latest_run: store.runs().latest().await?,
        fallback_enabled: state.lookup.fallback_enabled(),
    }))
}

/// GET /health - Liveness plus a database round trip
async fn health_handler(Extension(state): Extension<Arc<ServerState>>) -> impl IntoResponse {
    match state.store.ping().await {
        Ok(()) => (StatusCode::OK, Json(serde_json::json!({ "status": "ok" }))),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "status": "unavailable", "error": e.to_string() })),
        ),
    }
}

/// GET /metrics - Prometheus exposition
async fn metrics_handler(Extension(state): Extension<Arc<ServerState>>) -> Response {
    match &state.prometheus {
        Some(handle) => (
            [(
                axum::http::header::CONTENT_TYPE,
                "text/plain; version=0.0.4",
            )],
            handle.render(),
        )
            .into_response(),
        None => (StatusCode::NOT_FOUND, "metrics recorder not installed").into_response(),
    }
}

/// Serve until `shutdown` resolves.
pub async fn run_server<F>(state: Arc<ServerState>, listen: &str, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = create_router(state);
    let listener = tokio::net::TcpListener::bind(listen).await?;

    info!(listen = %listener.local_addr()?, "Starting gridpoint API server");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}
