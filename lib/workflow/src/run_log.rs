//! Append-only run log.
//!
//! Every run-level transition and every node attempt is recorded as a
//! `RunLogEntry`. Entries are never updated or deleted. Within a run they are
//! ordered by timestamp, then by a per-run sequence number assigned by the
//! `RunLogWriter`, which also keeps timestamps monotonic so both orders agree.

use crate::error::StoreError;
use crate::node::NodeKey;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flowdeck_core::{FlowRunId, RunLogId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::warn;

/// What a log entry records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LogStatus {
    Started,
    Succeeded,
    Failed,
    Retrying,
    Skipped,
    Cancelled,
    TimedOut,
}

impl LogStatus {
    /// Returns the stored name of this status.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Started => "STARTED",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
            Self::Retrying => "RETRYING",
            Self::Skipped => "SKIPPED",
            Self::Cancelled => "CANCELLED",
            Self::TimedOut => "TIMED_OUT",
        }
    }
}

impl fmt::Display for LogStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "STARTED" => Ok(Self::Started),
            "SUCCEEDED" => Ok(Self::Succeeded),
            "FAILED" => Ok(Self::Failed),
            "RETRYING" => Ok(Self::Retrying),
            "SKIPPED" => Ok(Self::Skipped),
            "CANCELLED" => Ok(Self::Cancelled),
            "TIMED_OUT" => Ok(Self::TimedOut),
            other => Err(format!("unknown log status: {other}")),
        }
    }
}

/// A single run log record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunLogEntry {
    pub id: RunLogId,
    pub run_id: FlowRunId,
    /// Per-run sequence number, starting at 1.
    pub sequence: i64,
    /// Absent for run-level entries.
    pub node_key: Option<NodeKey>,
    pub status: LogStatus,
    /// Attempt number for node entries; 0 for run-level entries.
    pub attempt: u32,
    pub latency_ms: Option<i64>,
    pub message: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Storage for run log entries.
///
/// Entries cannot be updated or deleted once appended.
#[async_trait]
pub trait RunLogRecorder: Send + Sync {
    /// Appends an entry.
    async fn append(&self, entry: RunLogEntry) -> Result<(), StoreError>;

    /// Returns all entries of a run ordered by timestamp, then sequence.
    async fn entries(&self, run_id: FlowRunId) -> Result<Vec<RunLogEntry>, StoreError>;
}

/// In-memory run log.
#[derive(Debug, Default)]
pub struct InMemoryRunLog {
    entries: Mutex<HashMap<FlowRunId, Vec<RunLogEntry>>>,
}

impl InMemoryRunLog {
    /// Creates an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<FlowRunId, Vec<RunLogEntry>>>, StoreError> {
        self.entries.lock().map_err(|e| StoreError::Backend {
            message: format!("run log lock poisoned: {e}"),
        })
    }
}

#[async_trait]
impl RunLogRecorder for InMemoryRunLog {
    async fn append(&self, entry: RunLogEntry) -> Result<(), StoreError> {
        self.lock()?.entry(entry.run_id).or_default().push(entry);
        Ok(())
    }

    async fn entries(&self, run_id: FlowRunId) -> Result<Vec<RunLogEntry>, StoreError> {
        let mut entries = self.lock()?.get(&run_id).cloned().unwrap_or_default();
        entries.sort_by(|a, b| {
            a.timestamp
                .cmp(&b.timestamp)
                .then(a.sequence.cmp(&b.sequence))
        });
        Ok(entries)
    }
}

/// The fields of an entry that vary per event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEvent {
    pub node_key: Option<NodeKey>,
    pub status: LogStatus,
    pub attempt: u32,
    pub latency_ms: Option<i64>,
    pub message: Option<String>,
}

impl LogEvent {
    /// A run-level event.
    #[must_use]
    pub fn run(status: LogStatus) -> Self {
        Self {
            node_key: None,
            status,
            attempt: 0,
            latency_ms: None,
            message: None,
        }
    }

    /// A node-level event.
    #[must_use]
    pub fn node(node_key: &NodeKey, status: LogStatus, attempt: u32) -> Self {
        Self {
            node_key: Some(node_key.clone()),
            status,
            attempt,
            latency_ms: None,
            message: None,
        }
    }

    /// Sets the latency.
    #[must_use]
    pub fn with_latency_ms(mut self, latency_ms: i64) -> Self {
        self.latency_ms = Some(latency_ms);
        self
    }

    /// Sets the message.
    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

#[derive(Debug)]
struct Cursor {
    sequence: i64,
    last_timestamp: DateTime<Utc>,
}

/// Writes the log of one run, assigning sequence numbers and timestamps.
///
/// Cheap to clone; clones share the same sequence.
#[derive(Clone)]
pub struct RunLogWriter {
    run_id: FlowRunId,
    recorder: Arc<dyn RunLogRecorder>,
    cursor: Arc<Mutex<Cursor>>,
}

impl RunLogWriter {
    /// Creates a writer for a run.
    pub fn new(run_id: FlowRunId, recorder: Arc<dyn RunLogRecorder>) -> Self {
        Self {
            run_id,
            recorder,
            cursor: Arc::new(Mutex::new(Cursor {
                sequence: 0,
                last_timestamp: DateTime::<Utc>::MIN_UTC,
            })),
        }
    }

    /// Returns the run this writer logs for.
    #[must_use]
    pub fn run_id(&self) -> FlowRunId {
        self.run_id
    }

    fn stamp(&self, event: LogEvent) -> RunLogEntry {
        let mut cursor = match self.cursor.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        cursor.sequence += 1;
        cursor.last_timestamp = Utc::now().max(cursor.last_timestamp);
        RunLogEntry {
            id: RunLogId::new(),
            run_id: self.run_id,
            sequence: cursor.sequence,
            node_key: event.node_key,
            status: event.status,
            attempt: event.attempt,
            latency_ms: event.latency_ms,
            message: event.message,
            timestamp: cursor.last_timestamp,
        }
    }

    /// Records an event.
    ///
    /// A failing recorder never fails the run; the error is logged instead.
    pub async fn record(&self, event: LogEvent) {
        let entry = self.stamp(event);
        let sequence = entry.sequence;
        if let Err(e) = self.recorder.append(entry).await {
            warn!(run_id = %self.run_id, sequence, error = %e, "Failed to append run log entry");
        }
    }
}
