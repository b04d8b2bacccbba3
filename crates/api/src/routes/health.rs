//! Health check endpoints.

use axum::{extract::State, http::StatusCode, response::Html, Json};
use telemetry::{health, metrics, ComponentHealth};

use crate::response::{ComponentStatus, HealthResponse};
use crate::state::AppState;

/// GET / - Banner.
pub async fn index_handler(State(state): State<AppState>) -> Html<String> {
    Html(format!("<h1>{} is online!</h1>", state.service()))
}

/// GET /health - Full health check.
pub async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let report = health().report();

    Json(HealthResponse {
        status: report.status.as_str().to_string(),
        service: state.service().to_string(),
        queue: state.queue().to_string(),
        table: state.table().to_string(),
        uptime_secs: state.uptime_secs(),
        broker: component_status(&health().broker),
        database: component_status(&health().database),
        metrics: metrics().snapshot(),
    })
}

fn component_status(component: &ComponentHealth) -> ComponentStatus {
    ComponentStatus {
        state: component.state(),
        connected: component.is_connected(),
        message: component.message(),
    }
}

/// GET /health/ready - Readiness probe (consuming from the broker).
pub async fn ready_handler() -> StatusCode {
    if health().is_ready() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

/// GET /health/live - Liveness probe (service is running).
pub async fn live_handler() -> StatusCode {
    if health().is_alive() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}
