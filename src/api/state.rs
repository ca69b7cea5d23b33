// src/api/state.rs

//! # Application State
//!
//! Defines the shared state that will be accessible by all route handlers.

use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::services::connection_manager::ConnectionRegistry;

/// The core application state, wrapped in an Arc for thread-safe sharing.
#[derive(Clone)]
pub struct AppState {
    // The central service for managing all WebSocket connections.
    pub registry: Arc<ConnectionRegistry>,
    // Cancelled when the HTTP server stops accepting; each session gets a child token.
    pub server_token: CancellationToken,
}

impl AppState {
    /// Creates a new instance of the application state.
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        AppState {
            registry,
            server_token: CancellationToken::new(),
        }
    }
}
