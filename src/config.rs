// File Path: src/config.rs

//! # Server Configuration
//!
//! Plumbing settings for the HTTP listener. Relay behaviour (history size, grace
//! period, keep-alive) is fixed in the services and not configurable here.
//!
//! Values come from an optional YAML file named by `RELAY_CONFIG`, then
//! `RELAY_HOST` / `RELAY_PORT` override the file.

use std::{env, path::Path};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::models::{ApiError, ApiResult};

pub const CONFIG_PATH_VAR: &str = "RELAY_CONFIG";
pub const HOST_VAR: &str = "RELAY_HOST";
pub const PORT_VAR: &str = "RELAY_PORT";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3100,
        }
    }
}

impl ServerConfig {
    /// Loads the file named by `RELAY_CONFIG` (if set) and applies env overrides.
    pub fn load() -> ApiResult<Self> {
        let config = match env::var(CONFIG_PATH_VAR) {
            Ok(path) => {
                info!("Loading configuration from {}", path);
                Self::from_yaml_file(&path)?
            }
            Err(_) => Self::default(),
        };
        config.with_overrides(env::var(HOST_VAR).ok(), env::var(PORT_VAR).ok())
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> ApiResult<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&contents)
    }

    pub fn from_yaml_str(contents: &str) -> ApiResult<Self> {
        Ok(serde_yaml::from_str(contents)?)
    }

    pub fn with_overrides(mut self, host: Option<String>, port: Option<String>) -> ApiResult<Self> {
        if let Some(host) = host {
            self.host = host;
        }
        if let Some(port) = port {
            self.port = port
                .parse()
                .map_err(|e| ApiError::Config(format!("invalid {PORT_VAR} '{port}': {e}")))?;
        }
        Ok(self)
    }
}
