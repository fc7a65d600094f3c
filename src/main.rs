// Main entry point for the asset rehabilitation service

use asset_rehab::{
    core::{types::*, Config},
    orchestration::OptimizationSession,
    services::{HttpSizeProbe, JsonRecordStore, LocalAssetStore},
    utils::Metrics,
    SessionError,
};

use anyhow::Result;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::{get, post, put},
    Router,
};
use serde::Deserialize;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;
use tracing::{error, info};

/// Application state shared across handlers
#[derive(Clone)]
struct AppState {
    session: Arc<OptimizationSession>,
    metrics: Metrics,
}

type ApiError = (StatusCode, String);

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Arc::new(Config::new()?);

    // Initialize logging
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::new(format!(
        "asset_rehab={},tower_http=warn",
        match config.log_level() {
            tracing::Level::TRACE => "trace",
            tracing::Level::DEBUG => "debug",
            tracing::Level::INFO => "info",
            tracing::Level::WARN => "warn",
            tracing::Level::ERROR => "error",
        }
    ));

    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("=== ASSET REHAB ===");
    info!(
        "Config: window={} threshold={}B format={} fallback={}",
        config.scan.window_size,
        config.scan.heavy_threshold_bytes,
        config.conversion.target_format.extension(),
        if config.conversion.local_fallback { "ON" } else { "OFF" }
    );

    // Initialize metrics
    let metrics = Metrics::new();

    // Host collaborators
    let records = Arc::new(JsonRecordStore::open(&config.storage.records_path).await?);
    let assets = Arc::new(LocalAssetStore::new(
        &config.storage.asset_root,
        &config.storage.public_base_url,
    )?);
    let probe = Arc::new(HttpSizeProbe::new(Some(metrics.clone()))?);

    let session = Arc::new(OptimizationSession::assemble(
        &config,
        records,
        assets,
        probe,
        Some(metrics.clone()),
    )?);
    let state = AppState { session, metrics };

    // Setup CORS
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint))
        .route("/stats", get(stats_endpoint))
        .route("/status", get(status))
        .route("/scan", post(scan_window))
        .route("/scan/reset", post(reset_cursor))
        .route("/scan/force", post(set_force_all))
        .route("/candidates/clear", post(clear_candidates))
        .route("/run", post(start_run))
        .route("/run/stop", post(stop_run))
        .route("/errors/clear", post(clear_errors))
        .route("/records/{id}/optimize", post(test_record))
        .route("/settings/endpoint", put(set_endpoint))
        .nest_service("/assets", ServeDir::new(&config.storage.asset_root))
        .with_state(state)
        .layer(cors);

    let addr = format!("{}:{}", config.server_host(), config.server_port());
    info!("{}", "=".repeat(70));
    info!("Server starting on http://{}", addr);
    info!("{}", "-".repeat(70));
    info!("Endpoints:");
    info!("  GET  /                       - Root endpoint");
    info!("  GET  /health                 - Health check");
    info!("  GET  /metrics                - Prometheus metrics");
    info!("  GET  /stats                  - Detailed statistics");
    info!("  GET  /status                 - Scan/run state, progress and errors");
    info!("  POST /scan                   - Scan the next window");
    info!("  POST /scan/reset             - Reset cursor and candidates");
    info!("  POST /scan/force             - Toggle force-all");
    info!("  POST /candidates/clear       - Drop accumulated candidates");
    info!("  POST /run                    - Start a batch run");
    info!("  POST /run/stop               - Stop after the current item");
    info!("  POST /errors/clear           - Clear the error log");
    info!("  POST /records/{{id}}/optimize  - Test one record via the endpoint");
    info!("  PUT  /settings/endpoint      - Set the conversion endpoint");
    info!("  GET  /assets/*               - Stored assets");
    info!("{}", "=".repeat(70));

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

fn session_error(e: SessionError) -> ApiError {
    let status = match &e {
        SessionError::Busy | SessionError::AlreadyRunning | SessionError::NotRunning => {
            StatusCode::CONFLICT
        }
        SessionError::RecordNotFound(_) => StatusCode::NOT_FOUND,
        SessionError::Optimize(inner) if inner.is_not_configured() => StatusCode::PRECONDITION_FAILED,
        SessionError::Optimize(inner) if inner.is_timeout() => StatusCode::GATEWAY_TIMEOUT,
        SessionError::Optimize(_) => StatusCode::BAD_GATEWAY,
        SessionError::Scan(_) | SessionError::Store(_) => {
            error!("Storage failure: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (status, e.to_string())
}

async fn root() -> &'static str {
    "Asset Rehab - batched image optimization service"
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "phase": state.session.phase(),
    }))
}

/// Prometheus metrics endpoint
async fn metrics_endpoint(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [("Content-Type", "text/plain; version=0.0.4")],
        state.metrics.to_prometheus(),
    )
}

/// Detailed statistics endpoint (JSON)
async fn stats_endpoint(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    let snapshot = state.metrics.snapshot();
    serde_json::to_value(snapshot).map(Json).map_err(|e| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to serialize metrics: {}", e),
        )
    })
}

async fn status(State(state): State<AppState>) -> Json<serde_json::Value> {
    let snapshot: SessionSnapshot = state.session.snapshot();
    Json(serde_json::json!({
        "session": snapshot,
        "candidateTitles": state.session.candidate_titles(),
    }))
}

async fn scan_window(State(state): State<AppState>) -> Result<Json<ScanReport>, ApiError> {
    state.metrics.record_endpoint_request("/scan");
    state.session.scan_window().await.map(Json).map_err(session_error)
}

async fn reset_cursor(State(state): State<AppState>) -> Result<StatusCode, ApiError> {
    state.metrics.record_endpoint_request("/scan/reset");
    state.session.reset_cursor().map_err(session_error)?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct ForceAllRequest {
    enabled: bool,
}

async fn set_force_all(
    State(state): State<AppState>,
    Json(body): Json<ForceAllRequest>,
) -> StatusCode {
    state.metrics.record_endpoint_request("/scan/force");
    state.session.set_force_all(body.enabled);
    StatusCode::NO_CONTENT
}

async fn clear_candidates(State(state): State<AppState>) -> Result<StatusCode, ApiError> {
    state.metrics.record_endpoint_request("/candidates/clear");
    state.session.clear_candidates().map_err(session_error)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn start_run(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    state.metrics.record_endpoint_request("/run");
    let total = state.session.start_run().map_err(session_error)?;
    Ok(Json(serde_json::json!({ "started": true, "total": total })))
}

async fn stop_run(State(state): State<AppState>) -> Result<StatusCode, ApiError> {
    state.metrics.record_endpoint_request("/run/stop");
    state.session.stop_run().map_err(session_error)?;
    Ok(StatusCode::ACCEPTED)
}

async fn clear_errors(State(state): State<AppState>) -> StatusCode {
    state.metrics.record_endpoint_request("/errors/clear");
    state.session.clear_errors();
    StatusCode::NO_CONTENT
}

/// Single-record test through the conversion endpoint
async fn test_record(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Record>, ApiError> {
    state.metrics.record_endpoint_request("/records/optimize");
    info!("Test optimize requested for {}", id);
    state.session.test_record(&id).await.map(Json).map_err(session_error)
}

#[derive(Debug, Deserialize)]
struct EndpointRequest {
    endpoint: Option<String>,
}

async fn set_endpoint(
    State(state): State<AppState>,
    Json(body): Json<EndpointRequest>,
) -> Result<StatusCode, ApiError> {
    state.metrics.record_endpoint_request("/settings/endpoint");
    if let Some(raw) = body.endpoint.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        url::Url::parse(raw)
            .map_err(|e| (StatusCode::BAD_REQUEST, format!("Invalid endpoint URL: {}", e)))?;
    }
    state.session.set_conversion_endpoint(body.endpoint);
    Ok(StatusCode::NO_CONTENT)
}
