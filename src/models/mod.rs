// File Path: src/models/mod.rs

// =========================================================================================
// SECTION 1: IMPORTS
// =========================================================================================

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// =========================================================================================
// SECTION 2: API ERROR HANDLING
// =========================================================================================

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("YAML parsing error: {0}")]
    YamlParseError(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_message) = match &self {
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            ApiError::Config(_) | ApiError::YamlParseError(_) | ApiError::IoError(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error".to_string(),
            ),
        };

        let body = serde_json::json!({
            "error": error_message,
            "status": status.as_u16()
        });

        (status, axum::Json(body)).into_response()
    }
}

// =========================================================================================
// SECTION 3: RELAY (TRANSPORT) ERRORS
// =========================================================================================

/// Failures on a single connection's transport. These never cross the
/// registry boundary: they are logged and dropped where they happen.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("WebSocket transport error: {0}")]
    Transport(#[from] axum::Error),

    #[error("operation cancelled by shutdown")]
    Cancelled,

    #[error("connection is no longer open")]
    Closed,
}

pub type RelayResult<T> = Result<T, RelayError>;

// =========================================================================================
// SECTION 4: HEALTH MODELS
// =========================================================================================

/// Body returned by `GET /health`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    pub timestamp: DateTime<Utc>,
}

impl HealthStatus {
    pub fn healthy() -> Self {
        Self {
            status: "healthy".to_string(),
            timestamp: Utc::now(),
        }
    }
}
