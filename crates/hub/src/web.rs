use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::error::ControlError;
use crate::scheduler::{IrrigationScheduler, StartOutcome, ZonePatch};

const INDEX_HTML: &str = include_str!("ui/index.html");

/// Days shown by the history chart.
const HISTORY_DAYS: u32 = 7;

type AppState = Arc<IrrigationScheduler>;

// ---------------------------------------------------------------------------
// Request bodies
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RunZoneRequest {
    zone_name: String,
    #[serde(default)]
    duration: Option<u32>,
    #[serde(default)]
    test_mode: bool,
}

#[derive(Debug, Deserialize)]
struct StopZoneRequest {
    zone_name: String,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

struct ApiError {
    status: StatusCode,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(serde_json::json!({ "error": self.message }));
        (self.status, body).into_response()
    }
}

impl From<ControlError> for ApiError {
    fn from(e: ControlError) -> Self {
        let status = match e {
            ControlError::ZoneNotFound(_) => StatusCode::NOT_FOUND,
            ControlError::InvalidUpdate(_) => StatusCode::BAD_REQUEST,
            ControlError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
        };
        Self {
            status,
            message: e.to_string(),
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        error!(error = %e, "request failed");
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: format!("{e:#}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(scheduler: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/api/status", get(api_status))
        .route("/api/history", get(api_history))
        .route("/api/history/all", get(api_history_all))
        .route("/api/weather_check", get(api_weather_check))
        .route("/api/run_zone", post(api_run_zone))
        .route("/api/stop_zone", post(api_stop_zone))
        .route("/api/zones/{name}", post(api_update_zone))
        .with_state(scheduler)
}

async fn index() -> impl IntoResponse {
    ([(header::CONTENT_TYPE, "text/html; charset=utf-8")], INDEX_HTML)
}

async fn api_status(State(s): State<AppState>) -> impl IntoResponse {
    Json(s.status().await)
}

async fn api_history(State(s): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(s.history(HISTORY_DAYS).await?))
}

async fn api_history_all(State(s): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(s.export_history().await?))
}

async fn api_weather_check(State(s): State<AppState>) -> impl IntoResponse {
    Json(s.check_weather().await)
}

async fn api_run_zone(
    State(s): State<AppState>,
    Json(req): Json<RunZoneRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let outcome = s
        .start_zone(&req.zone_name, req.duration, req.test_mode)
        .await?;
    let status = match outcome {
        StartOutcome::Started { .. } => StatusCode::OK,
        StartOutcome::AlreadyRunning => StatusCode::CONFLICT,
    };
    Ok((status, Json(outcome)))
}

async fn api_stop_zone(
    State(s): State<AppState>,
    Json(req): Json<StopZoneRequest>,
) -> impl IntoResponse {
    Json(s.stop_zone(&req.zone_name).await)
}

async fn api_update_zone(
    State(s): State<AppState>,
    Path(name): Path<String>,
    Json(patch): Json<ZonePatch>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(s.update_zone(&name, patch).await?))
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve(scheduler: AppState, port: u16, shutdown: CancellationToken) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind web port {port}"))?;

    info!(%addr, "web ui listening");

    axum::serve(listener, router(scheduler))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("web server error")
}

// ===========================================================================
// Tests
// ===========================================================================
