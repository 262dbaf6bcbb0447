//! Error types for the workflow crate.
//!
//! Errors are layered:
//! - `GraphError`: building a runnable graph from a node/edge set
//! - `StoreError`: persistence failures reported by `FlowStore` / `RunStore`
//! - `ToolError`: a single tool call attempt
//! - `FlowError`: what the command surface reports, wrapped in a rootcause `Report`

use crate::node::NodeKey;
use crate::validation::Violation;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Errors from building a flow graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    /// An edge references a node that does not exist.
    NodeNotFound { node_key: NodeKey },
    /// Two nodes share the same key.
    DuplicateNode { node_key: NodeKey },
    /// An edge condition does not parse.
    InvalidCondition {
        source_key: NodeKey,
        target_key: NodeKey,
        message: String,
    },
    /// Graph contains cycles.
    CycleDetected,
}

impl fmt::Display for GraphError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NodeNotFound { node_key } => write!(f, "node not found: {node_key}"),
            Self::DuplicateNode { node_key } => write!(f, "duplicate node key: {node_key}"),
            Self::InvalidCondition {
                source_key,
                target_key,
                message,
            } => write!(
                f,
                "invalid condition on edge {source_key} -> {target_key}: {message}"
            ),
            Self::CycleDetected => write!(f, "graph contains cycles"),
        }
    }
}

impl std::error::Error for GraphError {}

/// Errors from flow and run persistence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The entity does not exist.
    NotFound { entity: &'static str, id: String },
    /// A uniqueness or state precondition failed.
    Conflict { message: String },
    /// The storage backend failed.
    Backend { message: String },
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound { entity, id } => write!(f, "{entity} not found: {id}"),
            Self::Conflict { message } => write!(f, "conflict: {message}"),
            Self::Backend { message } => write!(f, "storage backend error: {message}"),
        }
    }
}

impl std::error::Error for StoreError {}

/// Errors from a single tool call attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolError {
    /// Infrastructure failure worth retrying.
    Transient { message: String },
    /// The tool rejected the request; retrying will not help.
    Permanent { message: String },
    /// The attempt did not finish within its timeout.
    Timeout { after: Duration },
    /// The attempt was aborted by cancellation.
    Cancelled,
}

impl ToolError {
    /// Returns true if another attempt may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient { .. } | Self::Timeout { .. })
    }
}

impl fmt::Display for ToolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transient { message } => write!(f, "transient tool failure: {message}"),
            Self::Permanent { message } => write!(f, "tool failed: {message}"),
            Self::Timeout { after } => write!(f, "tool call timed out after {}s", after.as_secs()),
            Self::Cancelled => write!(f, "tool call cancelled"),
        }
    }
}

impl std::error::Error for ToolError {}

/// The kind of a `FlowError`, stable across the wire and in storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FlowErrorKind {
    Validation,
    PublishConflict,
    NotFound,
    ToolInvocation,
    NodeExecution,
    Timeout,
    Cancelled,
    Storage,
}

impl FlowErrorKind {
    /// Returns the wire name of this kind.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validation => "VALIDATION",
            Self::PublishConflict => "PUBLISH_CONFLICT",
            Self::NotFound => "NOT_FOUND",
            Self::ToolInvocation => "TOOL_INVOCATION",
            Self::NodeExecution => "NODE_EXECUTION",
            Self::Timeout => "TIMEOUT",
            Self::Cancelled => "CANCELLED",
            Self::Storage => "STORAGE",
        }
    }
}

impl fmt::Display for FlowErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FlowErrorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "VALIDATION" => Ok(Self::Validation),
            "PUBLISH_CONFLICT" => Ok(Self::PublishConflict),
            "NOT_FOUND" => Ok(Self::NotFound),
            "TOOL_INVOCATION" => Ok(Self::ToolInvocation),
            "NODE_EXECUTION" => Ok(Self::NodeExecution),
            "TIMEOUT" => Ok(Self::Timeout),
            "CANCELLED" => Ok(Self::Cancelled),
            "STORAGE" => Ok(Self::Storage),
            other => Err(format!("unknown error kind: {other}")),
        }
    }
}

/// Errors reported by flow commands and recorded on failed runs.
#[derive(Debug, Clone, PartialEq)]
pub enum FlowError {
    /// The structure is malformed; carries every violation found.
    Validation { violations: Vec<Violation> },
    /// The definition is not a draft, or the name is taken.
    PublishConflict { entity_id: String, message: String },
    /// A referenced entity does not exist.
    NotFound { entity: &'static str, id: String },
    /// A tool call failed after exhausting its retries.
    ToolInvocation { node_key: NodeKey, message: String },
    /// A required node did not succeed.
    NodeExecution { node_key: NodeKey, message: String },
    /// The run exceeded its timeout.
    Timeout { run_id: String, timeout_minutes: i64 },
    /// The run was cancelled by its caller.
    Cancelled { run_id: String },
    /// Persistence failed.
    Storage { message: String },
}

impl FlowError {
    /// Returns the error kind.
    #[must_use]
    pub fn kind(&self) -> FlowErrorKind {
        match self {
            Self::Validation { .. } => FlowErrorKind::Validation,
            Self::PublishConflict { .. } => FlowErrorKind::PublishConflict,
            Self::NotFound { .. } => FlowErrorKind::NotFound,
            Self::ToolInvocation { .. } => FlowErrorKind::ToolInvocation,
            Self::NodeExecution { .. } => FlowErrorKind::NodeExecution,
            Self::Timeout { .. } => FlowErrorKind::Timeout,
            Self::Cancelled { .. } => FlowErrorKind::Cancelled,
            Self::Storage { .. } => FlowErrorKind::Storage,
        }
    }

    /// Returns the id or key of the offending entity, if there is one.
    #[must_use]
    pub fn entity_id(&self) -> Option<String> {
        match self {
            Self::Validation { violations } => violations.first().and_then(Violation::subject),
            Self::PublishConflict { entity_id, .. } => Some(entity_id.clone()),
            Self::NotFound { id, .. } => Some(id.clone()),
            Self::ToolInvocation { node_key, .. } | Self::NodeExecution { node_key, .. } => {
                Some(node_key.to_string())
            }
            Self::Timeout { run_id, .. } | Self::Cancelled { run_id } => Some(run_id.clone()),
            Self::Storage { .. } => None,
        }
    }

    /// Returns the structured form stored on runs and sent over the wire.
    #[must_use]
    pub fn detail(&self) -> ErrorDetail {
        ErrorDetail {
            kind: self.kind(),
            message: self.to_string(),
            entity_id: self.entity_id(),
        }
    }
}

impl fmt::Display for FlowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Validation { violations } => {
                write!(f, "flow structure has {} violation(s)", violations.len())?;
                for violation in violations {
                    write!(f, "; {violation}")?;
                }
                Ok(())
            }
            Self::PublishConflict { message, .. } => write!(f, "publish conflict: {message}"),
            Self::NotFound { entity, id } => write!(f, "{entity} not found: {id}"),
            Self::ToolInvocation { node_key, message } => {
                write!(f, "tool invocation failed for node {node_key}: {message}")
            }
            Self::NodeExecution { node_key, message } => {
                write!(f, "node {node_key} failed: {message}")
            }
            Self::Timeout {
                run_id,
                timeout_minutes,
            } => write!(f, "run {run_id} timed out after {timeout_minutes} minute(s)"),
            Self::Cancelled { run_id } => write!(f, "run {run_id} was cancelled"),
            Self::Storage { message } => write!(f, "storage error: {message}"),
        }
    }
}

impl std::error::Error for FlowError {}

impl From<StoreError> for FlowError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound { entity, id } => Self::NotFound { entity, id },
            StoreError::Conflict { message } => Self::PublishConflict {
                entity_id: String::new(),
                message,
            },
            StoreError::Backend { message } => Self::Storage { message },
        }
    }
}

/// Serializable error summary: kind, message and offending entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorDetail {
    pub kind: FlowErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,
}
