// src/main.rs

//! # Main Application Entry Point
//!
//! Sets up logging, builds the shared connection registry and starts the Axum
//! WebSocket relay. Ctrl-C stops the listener and closes every open connection.

use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use relay_backend::{
    api::state::AppState, config::ServerConfig, routes::create_router,
    services::connection_manager::ConnectionRegistry,
};

/// The main entry point for the Tokio runtime.
#[tokio::main]
async fn main() {
    // 1. Setup Logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "relay_backend=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting WebSocket relay server...");

    // 2. Load configuration
    let config = match ServerConfig::load() {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return;
        }
    };

    // 3. Initialize Shared State
    let registry = Arc::new(ConnectionRegistry::new());
    let state = AppState::new(Arc::clone(&registry));
    let server_token = state.server_token.clone();

    // 4. Configure Router
    let app = create_router(state);

    // 5. Configure Server Listener
    let listener = match TcpListener::bind((config.host.as_str(), config.port)).await {
        Ok(l) => l,
        Err(e) => {
            error!("Failed to bind TCP listener to {}:{}: {}", config.host, config.port, e);
            return;
        }
    };

    info!("Server listening on http://{}:{}", config.host, config.port);

    // 6. Run the Server until Ctrl-C, then drain connections
    let shutdown = async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for shutdown signal: {}", e);
        }
        info!("Shutdown signal received");
        server_token.cancel();
        registry.shutdown().await;
    };

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
    {
        error!("Server error: {}", e);
    }
}
