//! Run records and state machines.
//!
//! A run binds to a snapshot and moves through:
//!
//! ```text
//! CREATED -> RUNNING -> SUCCEEDED | FAILED | CANCELLED | TIMED_OUT
//! ```
//!
//! Each node of the run moves through:
//!
//! ```text
//! PENDING -> READY -> RUNNING -> SUCCEEDED | FAILED
//!                        ^  |
//!                        |  v
//!                      RETRYING
//! PENDING | READY -> SKIPPED
//! ```

use crate::error::ErrorDetail;
use crate::node::NodeKey;
use chrono::{DateTime, Utc};
use flowdeck_core::{DefinitionId, FlowRunId, SnapshotId, TenantId, ThreadId, UserId};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;
use std::str::FromStr;

/// The overall status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    /// Recorded, not yet started.
    Created,
    /// Nodes are being dispatched.
    Running,
    /// Every required node succeeded.
    Succeeded,
    /// A required node failed or was skipped.
    Failed,
    /// Cancelled by the caller.
    Cancelled,
    /// Exceeded the run timeout.
    TimedOut,
}

impl RunStatus {
    /// Returns true if this is a terminal status.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::Cancelled | Self::TimedOut
        )
    }

    /// Returns the stored name of this status.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "CREATED",
            Self::Running => "RUNNING",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
            Self::TimedOut => "TIMED_OUT",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CREATED" => Ok(Self::Created),
            "RUNNING" => Ok(Self::Running),
            "SUCCEEDED" => Ok(Self::Succeeded),
            "FAILED" => Ok(Self::Failed),
            "CANCELLED" => Ok(Self::Cancelled),
            "TIMED_OUT" => Ok(Self::TimedOut),
            other => Err(format!("unknown run status: {other}")),
        }
    }
}

/// The state of a single node within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeRunState {
    /// Waiting for predecessors.
    Pending,
    /// All predecessors terminal and at least one inbound edge live.
    Ready,
    /// A tool call attempt is in flight.
    Running,
    /// Waiting out the backoff before the next attempt.
    Retrying,
    Succeeded,
    Failed,
    /// Never dispatched: no live inbound edge, or the run stopped early.
    Skipped,
}

impl NodeRunState {
    /// Returns true if this is a terminal state.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Skipped)
    }

    /// Returns true if the node is dispatched and not yet terminal.
    #[must_use]
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Running | Self::Retrying)
    }

    /// Returns true if the state machine allows moving to `next`.
    #[must_use]
    pub fn can_transition_to(&self, next: Self) -> bool {
        use NodeRunState::{Failed, Pending, Ready, Retrying, Running, Skipped, Succeeded};
        matches!(
            (self, next),
            (Pending, Ready)
                | (Pending, Skipped)
                | (Ready, Running)
                | (Ready, Skipped)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Running, Retrying)
                | (Retrying, Running)
                | (Retrying, Failed)
        )
    }
}

/// The per-node outcome recorded on a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeResult {
    pub node_key: NodeKey,
    pub state: NodeRunState,
    /// Number of attempts made.
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// One execution of a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowRun {
    pub id: FlowRunId,
    pub snapshot_id: SnapshotId,
    pub definition_id: DefinitionId,
    pub tenant_id: TenantId,
    pub operator_id: UserId,
    pub thread_id: Option<ThreadId>,
    pub status: RunStatus,
    pub input: JsonValue,
    pub output: Option<JsonValue>,
    pub error: Option<ErrorDetail>,
    /// Effective run timeout after clamping.
    pub timeout_minutes: i64,
    /// Per-node outcomes; filled in when the run finishes.
    #[serde(default)]
    pub nodes: Vec<NodeResult>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl FlowRun {
    /// Creates a run in CREATED status.
    #[must_use]
    pub fn new(
        snapshot_id: SnapshotId,
        definition_id: DefinitionId,
        tenant_id: TenantId,
        operator_id: UserId,
        thread_id: Option<ThreadId>,
        input: JsonValue,
        timeout_minutes: i64,
    ) -> Self {
        Self {
            id: FlowRunId::new(),
            snapshot_id,
            definition_id,
            tenant_id,
            operator_id,
            thread_id,
            status: RunStatus::Created,
            input,
            output: None,
            error: None,
            timeout_minutes,
            nodes: Vec::new(),
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    /// Starts the run.
    pub fn start(&mut self) {
        self.status = RunStatus::Running;
        self.started_at = Some(Utc::now());
    }

    /// Finishes the run with a terminal status.
    pub fn finish(
        &mut self,
        status: RunStatus,
        output: Option<JsonValue>,
        error: Option<ErrorDetail>,
        nodes: Vec<NodeResult>,
    ) {
        self.status = status;
        self.output = output;
        self.error = error;
        self.nodes = nodes;
        self.finished_at = Some(Utc::now());
    }

    /// Returns the duration of the run, if it has started.
    #[must_use]
    pub fn duration(&self) -> Option<chrono::Duration> {
        let start = self.started_at?;
        let end = self.finished_at.unwrap_or_else(Utc::now);
        Some(end - start)
    }
}
