//! Read-only HTTP view of the sensors.
//!
//! - `/healthz`
//! - `/api/sensors` and `/api/sensors/:key`
//! - `/api/sensors/:key/history?limit=N`
//! - `/metrics` (Prometheus text)

use std::net::SocketAddr;

use anyhow::{Context, Result};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};

use history::{HistoryPoint, HistoryStore};

use crate::sensors::{SensorBoard, SensorState};

pub const DEFAULT_HISTORY_LIMIT: i64 = 100;
pub const MAX_HISTORY_LIMIT: i64 = 10_000;

#[derive(Clone)]
pub struct ApiState {
    pub board: SensorBoard,
    pub history: HistoryStore,
    pub metrics: Option<PrometheusHandle>,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct HistoryResponse {
    pub unique_id: String,
    pub points: Vec<HistoryPoint>,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/api/sensors", get(list_sensors))
        .route("/api/sensors/:key", get(get_sensor))
        .route("/api/sensors/:key/history", get(sensor_history))
        .route("/metrics", get(render_metrics))
        .with_state(state)
}

/// Serves the router until the shutdown flag flips.
pub async fn serve(state: ApiState, addr: SocketAddr, mut shutdown: watch::Receiver<bool>) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind http listener on {addr}"))?;
    info!(%addr, "http api listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            while shutdown.changed().await.is_ok() {
                if *shutdown.borrow() {
                    break;
                }
            }
        })
        .await
        .context("http server failed")
}

async fn healthz() -> &'static str {
    "ok"
}

async fn list_sensors(State(state): State<ApiState>) -> Json<Vec<SensorState>> {
    Json(state.board.states().await)
}

async fn get_sensor(
    State(state): State<ApiState>,
    Path(key): Path<String>,
) -> Result<Json<SensorState>, ApiError> {
    state
        .board
        .state(&key)
        .await
        .map(Json)
        .ok_or_else(|| not_found(&key))
}

async fn sensor_history(
    State(state): State<ApiState>,
    Path(key): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<HistoryResponse>, ApiError> {
    if !state.board.contains(&key) {
        return Err(not_found(&key));
    }
    let limit = query
        .limit
        .unwrap_or(DEFAULT_HISTORY_LIMIT)
        .clamp(1, MAX_HISTORY_LIMIT);
    match state.history.recent(&key, limit).await {
        Ok(points) => Ok(Json(HistoryResponse {
            unique_id: key,
            points,
        })),
        Err(err) => {
            warn!(key = %key, error = %err, "history query failed");
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse {
                    error: "history unavailable".to_string(),
                }),
            ))
        }
    }
}

async fn render_metrics(State(state): State<ApiState>) -> impl IntoResponse {
    match state.metrics {
        Some(handle) => (StatusCode::OK, handle.render()),
        None => (
            StatusCode::NOT_FOUND,
            "metrics recorder not installed".to_string(),
        ),
    }
}

fn not_found(key: &str) -> ApiError {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorResponse {
            error: format!("unknown sensor {key}"),
        }),
    )
}
