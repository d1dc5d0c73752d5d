//! Health check routes.

use axum::{Json, Router, extract::State, http::StatusCode, response::IntoResponse, routing::get};

use crate::api::server::AppState;
use crate::metrics::EngineHealth;

/// Create the health router.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/live", get(liveness_check))
}

/// Full health report: queue, jobs, cache, engine pool and callbacks.
async fn health_check(State(state): State<AppState>) -> Json<EngineHealth> {
    Json(state.health_checker.check_all())
}

/// Readiness check - is the engine accepting new render jobs?
/// Returns HTTP 503 while admission is saturated or the scheduler is stopped.
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    if state.health_checker.check_ready() {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready")
    }
}

/// Liveness check - is the service alive?
async fn liveness_check(State(state): State<AppState>) -> impl IntoResponse {
    let uptime = state.health_checker.uptime().as_secs();
    let status = if state.health_checker.check_live() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(serde_json::json!({
            "status": if status == StatusCode::OK { "alive" } else { "stopping" },
            "uptime_secs": uptime
        })),
    )
}
