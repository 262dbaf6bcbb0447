//! Centralized server configuration.
//!
//! This module provides strongly-typed configuration for the server,
//! loaded via the `config` crate from environment variables. Nested keys use
//! a double underscore, e.g. `ENGINE__MAX_CONCURRENCY=16` or
//! `TOOL_SERVICE__BASE_URL=http://tools:8081`.
//!
//! See [`EngineConfig`] for run scheduling configuration.

use flowdeck_workflow::EngineConfig;
use serde::Deserialize;

/// Server configuration composed from library configs.
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// PostgreSQL database connection URL; in-memory stores when absent.
    #[serde(default)]
    pub database_url: Option<String>,

    /// Address the HTTP listener binds to.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Tool execution service configuration.
    #[serde(default)]
    pub tool_service: ToolServiceConfig,

    /// Run scheduling configuration.
    #[serde(default)]
    pub engine: EngineConfig,
}

/// Tool execution service configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ToolServiceConfig {
    /// Base URL of the tool execution service.
    #[serde(default = "default_tool_base_url")]
    pub base_url: String,
}

fn default_listen_addr() -> String {
    "127.0.0.1:3000".to_string()
}

fn default_tool_base_url() -> String {
    "http://127.0.0.1:8081".to_string()
}

impl Default for ToolServiceConfig {
    fn default() -> Self {
        Self {
            base_url: default_tool_base_url(),
        }
    }
}

impl ServerConfig {
    /// Loads configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration is present but invalid.
    pub fn from_env() -> Result<Self, config::ConfigError> {
        Self::from_source(
            config::Environment::default()
                .separator("__")
                .try_parsing(true),
        )
    }

    fn from_source(
        source: impl config::Source + Send + Sync + 'static,
    ) -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .add_source(source)
            .build()?
            .try_deserialize()
    }
}
