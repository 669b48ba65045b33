//! Liveness handler.
//!
//! - GET /health -> `{"status":"healthy"}`

use axum::{Json, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use tracing::info;

/// `GET /health`
///
/// Never touches a database, so it answers even when both backends are down.
pub async fn health() -> impl IntoResponse {
    info!("health check endpoint called");
    (StatusCode::OK, Json(HealthResponse { status: "healthy" }))
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}
