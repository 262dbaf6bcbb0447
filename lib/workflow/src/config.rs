//! Engine configuration.
//!
//! Deserialized as the `engine` section of the server configuration; every
//! field has a default so the section may be omitted entirely.

use serde::Deserialize;
use std::time::Duration;

/// Run scheduler and tool adapter settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct EngineConfig {
    /// Maximum number of node dispatches in flight per run.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Run timeout used when a request gives none or a non-positive one.
    #[serde(default = "default_timeout_minutes")]
    pub default_timeout_minutes: i64,

    /// Upper bound for requested run timeouts.
    #[serde(default = "default_max_timeout_minutes")]
    pub max_timeout_minutes: i64,

    /// Tool call timeout used when a node gives none or a non-positive one.
    #[serde(default = "default_tool_timeout_seconds")]
    pub default_tool_timeout_seconds: u64,

    /// Capacity of the node event channel between node tasks and the run coordinator.
    #[serde(default = "default_event_channel_capacity")]
    pub event_channel_capacity: usize,
}

fn default_max_concurrency() -> usize {
    8
}

fn default_timeout_minutes() -> i64 {
    30
}

fn default_max_timeout_minutes() -> i64 {
    240
}

fn default_tool_timeout_seconds() -> u64 {
    30
}

fn default_event_channel_capacity() -> usize {
    64
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            default_timeout_minutes: default_timeout_minutes(),
            max_timeout_minutes: default_max_timeout_minutes(),
            default_tool_timeout_seconds: default_tool_timeout_seconds(),
            event_channel_capacity: default_event_channel_capacity(),
        }
    }
}

impl EngineConfig {
    /// Returns the effective run timeout in minutes.
    ///
    /// Absent or non-positive values fall back to the default; values above
    /// the maximum are clamped down to it.
    #[must_use]
    pub fn effective_timeout_minutes(&self, requested: Option<i64>) -> i64 {
        match requested {
            Some(minutes) if minutes > 0 => minutes.min(self.max_timeout_minutes),
            _ => self.default_timeout_minutes,
        }
    }

    /// Returns the effective tool call timeout.
    ///
    /// Absent or non-positive values fall back to the default.
    #[must_use]
    pub fn effective_tool_timeout(&self, requested_seconds: Option<i64>) -> Duration {
        match requested_seconds {
            Some(seconds) if seconds > 0 => Duration::from_secs(seconds.unsigned_abs()),
            _ => Duration::from_secs(self.default_tool_timeout_seconds),
        }
    }
}
