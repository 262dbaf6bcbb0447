//! Flow node types.
//!
//! Nodes are the units of work in a flow. Each node has:
//! - A key that is unique within its definition (`^[A-Za-z][A-Za-z0-9_]*$`)
//! - A type code naming the tool the node invokes
//! - An opaque configuration payload handed to the tool
//! - An optional retry policy and call timeout
//! - A `required` flag deciding whether its failure or skip fails the run

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;
use std::time::Duration;

/// Type code handled inside the engine without calling the tool service.
///
/// A passthrough node outputs the context it was given.
pub const PASSTHROUGH_TYPE_CODE: &str = "passthrough";

/// Upper bound accepted for `RetryPolicy::max_attempts`.
pub const MAX_RETRY_ATTEMPTS: u32 = 10;

/// The key of a node within a flow definition.
///
/// Keys are not validated on construction; the structure validator reports
/// malformed keys together with every other violation.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeKey(String);

impl NodeKey {
    /// Creates a node key.
    #[must_use]
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Returns the key as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns true if the key matches `^[A-Za-z][A-Za-z0-9_]*$`.
    #[must_use]
    pub fn is_well_formed(&self) -> bool {
        let mut chars = self.0.chars();
        match chars.next() {
            Some(first) if first.is_ascii_alphabetic() => {
                chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
            }
            _ => false,
        }
    }
}

impl fmt::Display for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeKey {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

/// How long to wait between retry attempts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Retry immediately.
    None,
    /// Wait the same delay before every retry.
    Fixed { delay_ms: u64 },
    /// Double the delay after every attempt, capped at `max_delay_ms`.
    Exponential { initial_delay_ms: u64, max_delay_ms: u64 },
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        Self::Fixed { delay_ms: 1_000 }
    }
}

impl BackoffStrategy {
    /// Returns the delay to wait after the given failed attempt (1-based).
    #[must_use]
    pub fn delay_after(&self, attempt: u32) -> Duration {
        match self {
            Self::None => Duration::ZERO,
            Self::Fixed { delay_ms } => Duration::from_millis(*delay_ms),
            Self::Exponential {
                initial_delay_ms,
                max_delay_ms,
            } => {
                let exponent = attempt.saturating_sub(1).min(31);
                let ms = initial_delay_ms
                    .saturating_mul(1u64 << exponent)
                    .min(*max_delay_ms);
                Duration::from_millis(ms)
            }
        }
    }
}

/// Retry policy for a node's tool invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one.
    pub max_attempts: u32,
    /// Delay between attempts.
    #[serde(default)]
    pub backoff: BackoffStrategy,
}

impl RetryPolicy {
    /// A policy that never retries.
    #[must_use]
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            backoff: BackoffStrategy::None,
        }
    }

    /// A policy with the given number of attempts and backoff.
    #[must_use]
    pub fn new(max_attempts: u32, backoff: BackoffStrategy) -> Self {
        Self {
            max_attempts,
            backoff,
        }
    }

    /// Returns true if the attempt count is within `1..=MAX_RETRY_ATTEMPTS`.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        (1..=MAX_RETRY_ATTEMPTS).contains(&self.max_attempts)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::no_retry()
    }
}

fn default_required() -> bool {
    true
}

/// A node in a flow definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowNode {
    /// Key, unique within the definition.
    pub node_key: NodeKey,
    /// Tool type code.
    pub type_code: String,
    /// Human-readable name.
    #[serde(default)]
    pub name: String,
    /// Opaque configuration passed to the tool.
    #[serde(default)]
    pub config: JsonValue,
    /// Retry policy; a single attempt when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_policy: Option<RetryPolicy>,
    /// Tool call timeout in seconds; non-positive values mean the default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<i64>,
    /// Whether a failure or skip of this node fails the run.
    #[serde(default = "default_required")]
    pub required: bool,
}

impl FlowNode {
    /// Creates a required node with an empty configuration.
    #[must_use]
    pub fn new(node_key: impl Into<NodeKey>, type_code: impl Into<String>) -> Self {
        Self {
            node_key: node_key.into(),
            type_code: type_code.into(),
            name: String::new(),
            config: JsonValue::Null,
            retry_policy: None,
            timeout_seconds: None,
            required: true,
        }
    }

    /// Sets the display name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Sets the tool configuration.
    #[must_use]
    pub fn with_config(mut self, config: JsonValue) -> Self {
        self.config = config;
        self
    }

    /// Sets the retry policy.
    #[must_use]
    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    /// Sets the tool call timeout.
    #[must_use]
    pub fn with_timeout_seconds(mut self, seconds: i64) -> Self {
        self.timeout_seconds = Some(seconds);
        self
    }

    /// Marks the node optional: its failure or skip does not fail the run.
    #[must_use]
    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    /// Returns the effective retry policy.
    #[must_use]
    pub fn effective_retry_policy(&self) -> RetryPolicy {
        self.retry_policy.clone().unwrap_or_default()
    }

    /// Returns true if the node is handled without the tool service.
    #[must_use]
    pub fn is_passthrough(&self) -> bool {
        self.type_code == PASSTHROUGH_TYPE_CODE
    }
}
