// src/routes/mod.rs

//! # Routes Module
//!
//! Defines the main routing structure for the Axum server.

use axum::{routing::any, Router};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::api::state::AppState;

pub mod health;
pub mod websocket;

/// Creates and configures the main application router.
pub fn create_router(state: AppState) -> Router {
    // Public API: any origin, header and method; no credentials.
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_headers(Any)
        .allow_methods(Any);

    Router::new()
        // The relay endpoint; non-upgrade requests are rejected by the handler.
        .route("/ws", any(websocket::websocket_handler))
        .merge(health::routes())
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}
