use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::Result;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use serde::{Deserialize, Serialize};
use tracing::info;

use risk_explorer_core::{
    ContextData, ExplanationChain, FilterState, Ident, RiskLevel, Sample, ViewMode,
};
use risk_explorer_store::{Dataset, DatasetCounts, ExplorerStore, STORE_CONTRACT_VERSION};

const SERVICE_CONTRACT_VERSION: &str = "service.v1";

#[derive(Debug, Clone)]
struct ServiceState {
    store: Arc<RwLock<ExplorerStore>>,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceEnvelope<T>
where
    T: Serialize,
{
    service_contract_version: &'static str,
    store_contract_version: &'static str,
    data: T,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceError {
    service_contract_version: &'static str,
    error: String,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
    loaded: bool,
    counts: DatasetCounts,
    fingerprint: Option<String>,
    loaded_at: Option<String>,
}

/// The state summary returned by every mutator endpoint.
#[derive(Debug, Clone, Serialize)]
struct FilterSummary {
    filter: FilterState,
    analysis_mode: ViewMode,
    filtered_count: usize,
    anomaly_count: usize,
    safe_count: usize,
}

#[derive(Debug, Clone, Serialize)]
struct SelectionView {
    sample: Option<Sample>,
    context: Option<ContextData>,
    explanation: Option<Vec<ExplanationChain>>,
    analysis_mode: ViewMode,
}

#[derive(Debug, Clone, Deserialize)]
struct ToggleSelectRequest {
    id: Ident,
}

#[derive(Debug, Clone, Deserialize)]
struct ViewModeRequest {
    mode: String,
}

#[derive(Debug, Clone, Deserialize)]
struct RiskLevelsRequest {
    levels: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct ScoreRangeRequest {
    min: f64,
    max: f64,
}

#[derive(Debug, Clone, Deserialize)]
struct SearchRequest {
    query: String,
}

#[derive(Debug, Clone, Deserialize)]
struct ProvinceRequest {
    province: String,
}

#[derive(Debug, Clone, Deserialize)]
struct PivotRequest {
    token: String,
}

#[derive(Debug, Parser)]
#[command(name = "risk-explorer-service")]
#[command(about = "Local HTTP service for the risk explorer state layer")]
struct Args {
    /// Directory holding the three dataset JSON files.
    #[arg(long, conflicts_with = "base_url")]
    data_dir: Option<PathBuf>,
    /// HTTP base URL serving the three dataset JSON files.
    #[arg(long)]
    base_url: Option<String>,
    #[arg(long, default_value = "127.0.0.1:4015")]
    bind: SocketAddr,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = StatusCode::BAD_REQUEST;
        (status, Json(self)).into_response()
    }
}

fn service_error(message: impl Into<String>) -> ServiceError {
    ServiceError { service_contract_version: SERVICE_CONTRACT_VERSION, error: message.into() }
}

fn envelope<T>(data: T) -> ServiceEnvelope<T>
where
    T: Serialize,
{
    ServiceEnvelope {
        service_contract_version: SERVICE_CONTRACT_VERSION,
        store_contract_version: STORE_CONTRACT_VERSION,
        data,
    }
}

fn read_store(state: &ServiceState) -> Result<RwLockReadGuard<'_, ExplorerStore>, ServiceError> {
    state.store.read().map_err(|_| service_error("store lock poisoned"))
}

fn write_store(state: &ServiceState) -> Result<RwLockWriteGuard<'_, ExplorerStore>, ServiceError> {
    state.store.write().map_err(|_| service_error("store lock poisoned"))
}

fn filter_summary(store: &ExplorerStore) -> FilterSummary {
    let views = store.views();
    FilterSummary {
        filter: store.filter().clone(),
        analysis_mode: views.analysis_mode,
        filtered_count: views.filtered.len(),
        anomaly_count: views.anomalies.len(),
        safe_count: views.safe.len(),
    }
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/views/filtered", get(views_filtered))
        .route("/v1/views/display", get(views_display))
        .route("/v1/views/rankings/anomalies", get(views_anomalies))
        .route("/v1/views/rankings/safe", get(views_safe))
        .route("/v1/views/selection", get(views_selection))
        .route("/v1/views/entities/risk", get(views_entity_risk))
        .route("/v1/views/entities/safety", get(views_entity_safety))
        .route("/v1/views/best-cases", get(views_best_cases))
        .route("/v1/filters", get(filters_show))
        .route("/v1/selection/toggle", post(selection_toggle))
        .route("/v1/filters/view-mode", post(filters_view_mode))
        .route("/v1/filters/risk-levels", post(filters_risk_levels))
        .route("/v1/filters/score-range", post(filters_score_range))
        .route("/v1/filters/search", post(filters_search))
        .route("/v1/filters/province", post(filters_province))
        .route("/v1/filters/pivot", post(filters_pivot))
        .route("/v1/filters/reset", post(filters_reset))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let dataset = match (&args.data_dir, &args.base_url) {
        (Some(dir), _) => Dataset::load_from_dir(dir)?,
        (None, Some(url)) => Dataset::load_from_base_url(url),
        (None, None) => anyhow::bail!("either --data-dir or --base-url is required"),
    };

    let mut store = ExplorerStore::new();
    store.initialize(dataset);
    info!(
        fingerprint = store.fingerprint().unwrap_or("-"),
        samples = store.dataset().counts().samples,
        "dataset loaded"
    );

    let state = ServiceState { store: Arc::new(RwLock::new(store)) };
    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    info!(bind = %args.bind, "listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<HealthResponse>>, ServiceError> {
    let store = read_store(&state)?;
    Ok(Json(envelope(HealthResponse {
        status: "ok",
        loaded: store.is_loaded(),
        counts: store.dataset().counts(),
        fingerprint: store.fingerprint().map(ToString::to_string),
        loaded_at: store.loaded_at_rfc3339(),
    })))
}

async fn views_filtered(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<Vec<Sample>>>, ServiceError> {
    let store = read_store(&state)?;
    Ok(Json(envelope(store.views().filtered.clone())))
}

async fn views_display(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<Vec<Sample>>>, ServiceError> {
    let store = read_store(&state)?;
    Ok(Json(envelope(store.views().display.clone())))
}

async fn views_anomalies(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<Vec<Sample>>>, ServiceError> {
    let store = read_store(&state)?;
    Ok(Json(envelope(store.views().anomalies.clone())))
}

async fn views_safe(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<Vec<Sample>>>, ServiceError> {
    let store = read_store(&state)?;
    Ok(Json(envelope(store.views().safe.clone())))
}

async fn views_selection(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<SelectionView>>, ServiceError> {
    let store = read_store(&state)?;
    Ok(Json(envelope(SelectionView {
        sample: store.selected_sample().cloned(),
        context: store.selected_context().cloned(),
        explanation: store.selected_explanation().map(<[ExplanationChain]>::to_vec),
        analysis_mode: store.views().analysis_mode,
    })))
}

async fn views_entity_risk(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<std::collections::BTreeMap<String, u64>>>, ServiceError> {
    let store = read_store(&state)?;
    Ok(Json(envelope(store.views().entity_risk.clone())))
}

async fn views_entity_safety(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<std::collections::BTreeMap<String, u64>>>, ServiceError> {
    let store = read_store(&state)?;
    Ok(Json(envelope(store.views().entity_safety.clone())))
}

async fn views_best_cases(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<Vec<Sample>>>, ServiceError> {
    let store = read_store(&state)?;
    Ok(Json(envelope(store.best_cases().to_vec())))
}

async fn filters_show(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<FilterSummary>>, ServiceError> {
    let store = read_store(&state)?;
    Ok(Json(envelope(filter_summary(&store))))
}

async fn selection_toggle(
    State(state): State<ServiceState>,
    Json(request): Json<ToggleSelectRequest>,
) -> Result<Json<ServiceEnvelope<FilterSummary>>, ServiceError> {
    let mut store = write_store(&state)?;
    store.toggle_select(request.id);
    Ok(Json(envelope(filter_summary(&store))))
}

async fn filters_view_mode(
    State(state): State<ServiceState>,
    Json(request): Json<ViewModeRequest>,
) -> Result<Json<ServiceEnvelope<FilterSummary>>, ServiceError> {
    let mode = ViewMode::parse(&request.mode)
        .ok_or_else(|| service_error(format!("unknown view mode: {}", request.mode)))?;
    let mut store = write_store(&state)?;
    store.set_view_mode(mode);
    Ok(Json(envelope(filter_summary(&store))))
}

async fn filters_risk_levels(
    State(state): State<ServiceState>,
    Json(request): Json<RiskLevelsRequest>,
) -> Result<Json<ServiceEnvelope<FilterSummary>>, ServiceError> {
    let levels = request
        .levels
        .iter()
        .map(|raw| {
            RiskLevel::parse(raw)
                .ok_or_else(|| service_error(format!("unknown risk level: {raw}")))
        })
        .collect::<Result<BTreeSet<_>, _>>()?;
    let mut store = write_store(&state)?;
    store.set_risk_levels(levels);
    Ok(Json(envelope(filter_summary(&store))))
}

async fn filters_score_range(
    State(state): State<ServiceState>,
    Json(request): Json<ScoreRangeRequest>,
) -> Result<Json<ServiceEnvelope<FilterSummary>>, ServiceError> {
    if !request.min.is_finite() || !request.max.is_finite() {
        return Err(service_error("score range bounds must be finite"));
    }
    let mut store = write_store(&state)?;
    store.set_score_range(request.min, request.max);
    Ok(Json(envelope(filter_summary(&store))))
}

async fn filters_search(
    State(state): State<ServiceState>,
    Json(request): Json<SearchRequest>,
) -> Result<Json<ServiceEnvelope<FilterSummary>>, ServiceError> {
    let mut store = write_store(&state)?;
    store.set_search(request.query);
    Ok(Json(envelope(filter_summary(&store))))
}

async fn filters_province(
    State(state): State<ServiceState>,
    Json(request): Json<ProvinceRequest>,
) -> Result<Json<ServiceEnvelope<FilterSummary>>, ServiceError> {
    let mut store = write_store(&state)?;
    store.toggle_province(request.province);
    Ok(Json(envelope(filter_summary(&store))))
}

async fn filters_pivot(
    State(state): State<ServiceState>,
    Json(request): Json<PivotRequest>,
) -> Result<Json<ServiceEnvelope<FilterSummary>>, ServiceError> {
    let mut store = write_store(&state)?;
    store.toggle_pivot(&request.token);
    Ok(Json(envelope(filter_summary(&store))))
}

async fn filters_reset(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<FilterSummary>>, ServiceError> {
    let mut store = write_store(&state)?;
    store.reset_filters();
    Ok(Json(envelope(filter_summary(&store))))
}
