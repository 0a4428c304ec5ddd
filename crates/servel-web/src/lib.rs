//! Axum control and read API for the SERVEL results sync.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::{
    extract::{Path as AxumPath, State},
    http::{header::CONTENT_TYPE, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use servel_core::{
    seats::{self, Directory, ElectedSummary, SeatSummary},
    AggregateResult, Candidate, Election, GeoUnit, ResourceKey,
};
use servel_sync::{
    PhaseReport, ResourceStatus, ResourceSyncResult, Scheduler, SyncConfig, SyncCycleSummary,
    SyncService, SyncStats,
};
use tokio::net::TcpListener;
use tokio::signal;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

pub mod error;

pub use error::ApiError;

pub const CRATE_NAME: &str = "servel-web";

#[derive(Debug, Clone)]
pub struct WebConfig {
    pub port: u16,
}

impl WebConfig {
    pub fn from_env() -> Self {
        Self {
            port: servel_sync::env_value("SERVEL_WEB_PORT", 3000_u16),
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<SyncService>,
    pub scheduler: Arc<Scheduler>,
}

impl AppState {
    pub fn new(service: Arc<SyncService>) -> Self {
        let scheduler = Arc::new(Scheduler::new(service.clone()));
        Self { service, scheduler }
    }
}

pub fn app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([CONTENT_TYPE])
        .max_age(Duration::from_secs(60 * 60));

    Router::new()
        .route("/health", get(health_handler))
        .route("/api/sync", post(sync_all_handler))
        .route("/api/sync/start", post(start_handler))
        .route("/api/sync/stop", post(stop_handler))
        .route("/api/sync/stats", get(stats_handler))
        .route("/api/sync/phase", get(phase_handler))
        .route("/api/sync/{resource}", post(sync_resource_handler))
        .route("/api/results/{race}/aggregates", get(aggregates_handler))
        .route("/api/results/{race}/aggregates/{name}", get(aggregate_handler))
        .route("/api/results/{race}/districts/{id}", get(district_handler))
        .route("/api/results/{race}/districts/{id}/elected", get(district_elected_handler))
        .route("/api/results/{race}/circumscriptions/{id}", get(circumscription_handler))
        .route(
            "/api/results/{race}/circumscriptions/{id}/elected",
            get(circumscription_elected_handler),
        )
        .route("/api/candidates", get(candidates_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Opens the store, optionally starts the scheduler and serves until a shutdown signal.
pub async fn serve_from_env() -> anyhow::Result<()> {
    let config = SyncConfig::from_env();
    let autostart = config.autostart;
    let service = SyncService::from_config(config).await?;
    let state = AppState::new(service);
    if autostart {
        state.scheduler.start().await.context("starting scheduler")?;
    }
    serve(state, WebConfig::from_env()).await
}

pub async fn serve(state: AppState, config: WebConfig) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", config.port))
        .await
        .with_context(|| format!("binding port {}", config.port))?;
    info!(port = config.port, "http api listening");

    let scheduler = state.scheduler.clone();
    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving http api")?;

    scheduler.stop().await.context("stopping scheduler")?;
    info!("http api stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        match signal::ctrl_c().await {
            Ok(()) => info!("received Ctrl+C, shutting down"),
            Err(err) => {
                warn!(error = %err, "cannot listen for Ctrl+C");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
                info!("received terminate signal, shutting down");
            }
            Err(err) => {
                warn!(error = %err, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

async fn health_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({ "status": "ok", "store": state.service.store().backend() }))
}

#[derive(Debug, Serialize)]
struct SyncResponse {
    processed_chunks: u64,
    failed_chunks: u64,
    failed_resources: usize,
    #[serde(flatten)]
    summary: SyncCycleSummary,
}

async fn sync_all_handler(State(state): State<AppState>) -> Response {
    let summary = state.service.sync_all().await;
    let failed = summary.failed();
    let status = if !summary.results.is_empty() && failed == summary.results.len() {
        StatusCode::BAD_GATEWAY
    } else if failed > 0 || summary.partial() > 0 {
        StatusCode::MULTI_STATUS
    } else {
        StatusCode::OK
    };
    let body = SyncResponse {
        processed_chunks: summary.processed_chunks(),
        failed_chunks: summary.failed_chunks(),
        failed_resources: failed,
        summary,
    };
    (status, Json(body)).into_response()
}

async fn sync_resource_handler(
    State(state): State<AppState>,
    AxumPath(resource): AxumPath<String>,
) -> Result<Response, ApiError> {
    let key: ResourceKey = resource.parse()?;
    if !state.service.catalog().contains(&key) {
        return Err(ApiError::BadRequest(format!("resource `{key}` is not enabled")));
    }

    let result: ResourceSyncResult = state.service.sync_resource(key).await;
    if let ResourceStatus::Failed { error, .. } = result.status {
        return Err(ApiError::Upstream {
            resource: key.to_string(),
            detail: error,
        });
    }
    let status = if result.is_partial() {
        StatusCode::MULTI_STATUS
    } else {
        StatusCode::OK
    };
    Ok((status, Json(result)).into_response())
}

async fn start_handler(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    let started = state.scheduler.start().await?;
    Ok(Json(json!({
        "started": started,
        "running": true,
        "interval_secs": state.scheduler.interval().as_secs(),
    })))
}

async fn stop_handler(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    let stopped = state.scheduler.stop().await?;
    Ok(Json(json!({ "stopped": stopped, "running": false })))
}

#[derive(Debug, Serialize)]
struct StatsResponse {
    scheduler_running: bool,
    interval_secs: u64,
    #[serde(flatten)]
    stats: SyncStats,
}

async fn stats_handler(State(state): State<AppState>) -> Result<Json<StatsResponse>, ApiError> {
    Ok(Json(StatsResponse {
        scheduler_running: state.scheduler.is_running().await,
        interval_secs: state.scheduler.interval().as_secs(),
        stats: state.service.stats().await?,
    }))
}

async fn phase_handler(State(state): State<AppState>) -> Json<PhaseReport> {
    Json(state.service.phase_report(Utc::now()))
}

async fn aggregates_handler(
    State(state): State<AppState>,
    AxumPath(race): AxumPath<String>,
) -> Result<Json<Vec<AggregateResult>>, ApiError> {
    let election: Election = race.parse()?;
    let results = state.service.store().aggregates(election).await?;
    if results.is_empty() {
        return Err(no_totals(election, format!("{election} aggregates")));
    }
    Ok(Json(results))
}

async fn aggregate_handler(
    State(state): State<AppState>,
    AxumPath((race, name)): AxumPath<(String, String)>,
) -> Result<Json<AggregateResult>, ApiError> {
    let election: Election = race.parse()?;
    state
        .service
        .store()
        .aggregates(election)
        .await?
        .into_iter()
        .find(|a| a.name.eq_ignore_ascii_case(&name))
        .map(Json)
        .ok_or_else(|| no_totals(election, format!("{election} aggregate `{name}`")))
}

async fn district_handler(
    State(state): State<AppState>,
    AxumPath((race, id)): AxumPath<(String, i64)>,
) -> Result<Json<SeatSummary>, ApiError> {
    seat_summary(&state, &race, GeoUnit::District(id)).await
}

async fn district_elected_handler(
    State(state): State<AppState>,
    AxumPath((race, id)): AxumPath<(String, i64)>,
) -> Result<Json<ElectedSummary>, ApiError> {
    elected_summary(&state, &race, GeoUnit::District(id)).await
}

async fn circumscription_handler(
    State(state): State<AppState>,
    AxumPath((race, id)): AxumPath<(String, i64)>,
) -> Result<Json<SeatSummary>, ApiError> {
    seat_summary(&state, &race, GeoUnit::Circumscription(id)).await
}

async fn circumscription_elected_handler(
    State(state): State<AppState>,
    AxumPath((race, id)): AxumPath<(String, i64)>,
) -> Result<Json<ElectedSummary>, ApiError> {
    elected_summary(&state, &race, GeoUnit::Circumscription(id)).await
}

async fn candidates_handler(State(state): State<AppState>) -> Result<Json<Vec<Candidate>>, ApiError> {
    let candidates = state.service.store().candidates().await?;
    if candidates.is_empty() {
        return Err(ApiError::NoData {
            what: "candidates".to_string(),
            load: None,
        });
    }
    Ok(Json(candidates))
}

fn no_totals(election: Election, what: String) -> ApiError {
    ApiError::NoData {
        what,
        load: Some(ResourceKey::Totals(election).to_string()),
    }
}

fn no_tables(election: Election, unit: GeoUnit) -> ApiError {
    let what = match unit {
        GeoUnit::District(id) => format!("{election} district {id}"),
        GeoUnit::Circumscription(id) => format!("{election} circumscription {id}"),
    };
    ApiError::NoData {
        what,
        load: Some(ResourceKey::Tables(election).to_string()),
    }
}

async fn unit_inputs(
    state: &AppState,
    race: &str,
    unit: GeoUnit,
) -> Result<(Election, Vec<servel_core::TableResult>, Directory), ApiError> {
    let election: Election = race.parse()?;
    let store = state.service.store();
    let tables = store.table_results(election, unit).await?;
    if tables.is_empty() {
        return Err(no_tables(election, unit));
    }
    let candidates = store.candidates().await?;
    let aggregates = store.aggregates(election).await?;
    Ok((election, tables, Directory::new(&candidates, &aggregates)))
}

async fn seat_summary(state: &AppState, race: &str, unit: GeoUnit) -> Result<Json<SeatSummary>, ApiError> {
    let (election, tables, directory) = unit_inputs(state, race, unit).await?;
    seats::summarize(election, unit, &tables, &directory)
        .map(Json)
        .ok_or_else(|| no_tables(election, unit))
}

async fn elected_summary(
    state: &AppState,
    race: &str,
    unit: GeoUnit,
) -> Result<Json<ElectedSummary>, ApiError> {
    let (election, tables, directory) = unit_inputs(state, race, unit).await?;
    seats::elected(election, unit, &tables, &directory)
        .map(Json)
        .ok_or_else(|| no_tables(election, unit))
}
