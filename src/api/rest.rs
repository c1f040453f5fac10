// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// All endpoints live under `/api/v1/`. Handlers stay thin: deserialize,
// call the engine, serialize. The engine itself is the library surface;
// this layer only exposes it per scheduled tick or operator request.
//
// CORS is configured permissively for development; tighten the allowed
// origins in production.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::app_state::AppState;
use crate::types::{TradeSignal, TradingMode};

// =============================================================================
// Router construction
// =============================================================================

/// Build the full REST API router with CORS middleware and shared state.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/v1/health", get(health))
        .route("/api/v1/state", get(full_state))
        .route("/api/v1/reports", get(reports))
        .route("/api/v1/levels/stats", get(levels_stats))
        .route("/api/v1/tick", post(tick))
        .route("/api/v1/control/pause", post(control_pause))
        .route("/api/v1/control/resume", post(control_resume))
        .route("/api/v1/control/kill", post(control_kill))
        .route("/api/v1/emergency-stop", post(emergency_stop))
        .layer(cors)
        .with_state(state)
}

// =============================================================================
// Health & state
// =============================================================================

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "state_version": state.current_state_version(),
        "server_time": chrono::Utc::now().timestamp_millis(),
    }))
}

async fn full_state(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.build_snapshot())
}

async fn reports(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let reports = state.recent_reports.read().clone();
    Json(reports)
}

// =============================================================================
// Levels diagnostics
// =============================================================================

async fn levels_stats(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stats = state.store.stats().await;
    Json(stats)
}

// =============================================================================
// Tick — run one invocation
// =============================================================================

#[derive(Debug, Default, Deserialize)]
struct TickRequest {
    #[serde(default)]
    signals: Vec<TradeSignal>,
}

/// Run one engine invocation. An empty body monitors exits only; candidate
/// signals in the body are validated and, if accepted, executed.
async fn tick(
    State(state): State<Arc<AppState>>,
    body: Option<Json<TickRequest>>,
) -> impl IntoResponse {
    let signals = body.map(|Json(req)| req.signals).unwrap_or_default();
    info!(candidates = signals.len(), "tick requested via API");

    let report = state.engine.run_invocation(signals).await;
    state.push_report(report.clone());
    Json(report)
}

// =============================================================================
// Trading mode controls
// =============================================================================

async fn control_pause(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    set_mode(&state, TradingMode::Paused)
}

async fn control_resume(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    set_mode(&state, TradingMode::Live)
}

async fn control_kill(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    warn!("kill requested via API — entries blocked until restart");
    set_mode(&state, TradingMode::Killed)
}

fn set_mode(state: &Arc<AppState>, mode: TradingMode) -> Json<serde_json::Value> {
    state.runtime_config.write().trading_mode = mode;
    state.increment_version();
    info!(mode = %mode, "trading mode changed");
    Json(serde_json::json!({ "trading_mode": mode.to_string() }))
}

// =============================================================================
// Emergency stop
// =============================================================================

async fn emergency_stop(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.engine.emergency_stop().await {
        Ok(report) => {
            state.increment_version();
            Json(serde_json::to_value(report).unwrap_or_default()).into_response()
        }
        Err(e) => {
            warn!(error = %e, "emergency stop rejected");
            state.push_error(format!("emergency stop rejected: {e}"));
            (
                StatusCode::CONFLICT,
                Json(serde_json::json!({ "error": e.to_string() })),
            )
                .into_response()
        }
    }
}
