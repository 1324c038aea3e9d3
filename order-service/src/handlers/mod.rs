//! HTTP handlers for order-service.

pub mod admin;
pub mod coupons;
pub mod orders;

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde_json::json;
use service_core::observability::render_metrics;

use crate::startup::AppState;

/// Liveness probe.
pub async fn health_check() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(json!({
            "status": "ok",
            "service": "order-service",
            "version": env!("CARGO_PKG_VERSION")
        })),
    )
}

/// Readiness probe; checks the database when one is configured.
pub async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let Some(db) = state.database else {
        return (StatusCode::OK, Json(json!({ "status": "ready", "storage": "memory" })));
    };

    match db.health_check().await {
        Ok(()) => (StatusCode::OK, Json(json!({ "status": "ready", "storage": "postgres" }))),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "unavailable", "error": e.to_string() })),
        ),
    }
}

/// Prometheus metrics endpoint.
pub async fn metrics_endpoint() -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        render_metrics(),
    )
}
