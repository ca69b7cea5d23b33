// File Path: src/routes/health.rs
//! Health Check Routes
//!
//! Provides health monitoring and system status endpoints

use axum::{routing::get, Json, Router};

use crate::api::state::AppState;
use crate::models::HealthStatus;

/// Health check endpoint
/// Returns a fixed status string and the current UTC time.
pub async fn health_check() -> Json<HealthStatus> {
    Json(HealthStatus::healthy())
}

/// Creates health-related routes and merges them into the main router.
pub fn routes() -> Router<AppState> {
    Router::new().route("/health", get(health_check))
}
