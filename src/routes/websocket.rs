// File Path: src/routes/websocket.rs

use std::sync::Arc;

use axum::{
    extract::{State, WebSocketUpgrade},
    response::{IntoResponse, Response},
};
use tracing::warn;

use crate::api::state::AppState;
use crate::models::ApiError;
use crate::services::session;

/// Main entry point for the WebSocket upgrade.
///
/// Anything that is not a valid upgrade request gets a 400 and never reaches
/// the registry.
pub async fn websocket_handler(
    ws: Option<WebSocketUpgrade>,
    State(state): State<AppState>,
) -> Response {
    let Some(ws) = ws else {
        warn!("Rejected non-upgrade request to /ws");
        return ApiError::BadRequest("expected a WebSocket upgrade request".to_string())
            .into_response();
    };

    let registry = Arc::clone(&state.registry);
    let cancel = state.server_token.child_token();
    ws.on_upgrade(move |socket| session::serve_socket(socket, registry, cancel))
}
