//! Postgres storage for the append-only run log.
//!
//! Only inserts and reads are issued against `flow_run_logs`.

use super::{parse_column, store_error};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flowdeck_core::FlowRunId;
use flowdeck_workflow::{NodeKey, RunLogEntry, RunLogRecorder, StoreError};
use sqlx::{FromRow, PgPool};

/// Row type for run log queries.
#[derive(FromRow)]
struct RunLogRow {
    id: String,
    run_id: String,
    sequence: i64,
    node_key: Option<String>,
    status: String,
    attempt: i32,
    latency_ms: Option<i64>,
    message: Option<String>,
    timestamp: DateTime<Utc>,
}

impl RunLogRow {
    fn try_into_entry(self) -> Result<RunLogEntry, sqlx::Error> {
        Ok(RunLogEntry {
            id: parse_column("run log id", &self.id)?,
            run_id: parse_column("run id", &self.run_id)?,
            sequence: self.sequence,
            node_key: self.node_key.map(NodeKey::new),
            status: parse_column("log status", &self.status)?,
            attempt: u32::try_from(self.attempt)
                .map_err(|e| super::invalid_column("attempt", &self.attempt.to_string(), e))?,
            latency_ms: self.latency_ms,
            message: self.message,
            timestamp: self.timestamp,
        })
    }
}

/// Postgres implementation of [`RunLogRecorder`].
#[derive(Clone)]
pub struct PgRunLog {
    pool: PgPool,
}

impl PgRunLog {
    /// Creates a new run log.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RunLogRecorder for PgRunLog {
    async fn append(&self, entry: RunLogEntry) -> Result<(), StoreError> {
        let attempt = i32::try_from(entry.attempt).map_err(|e| StoreError::Backend {
            message: format!("attempt out of range: {e}"),
        })?;

        sqlx::query(
            r#"
            INSERT INTO flow_run_logs
                (id, run_id, sequence, node_key, status, attempt, latency_ms, message, timestamp)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(entry.id.to_string())
        .bind(entry.run_id.to_string())
        .bind(entry.sequence)
        .bind(entry.node_key.as_ref().map(NodeKey::as_str))
        .bind(entry.status.as_str())
        .bind(attempt)
        .bind(entry.latency_ms)
        .bind(&entry.message)
        .bind(entry.timestamp)
        .execute(&self.pool)
        .await
        .map_err(store_error)?;
        Ok(())
    }

    async fn entries(&self, run_id: FlowRunId) -> Result<Vec<RunLogEntry>, StoreError> {
        let rows: Vec<RunLogRow> = sqlx::query_as(
            r#"
            SELECT id, run_id, sequence, node_key, status, attempt, latency_ms, message, timestamp
            FROM flow_run_logs
            WHERE run_id = $1
            ORDER BY timestamp, sequence
            "#,
        )
        .bind(run_id.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(store_error)?;

        rows.into_iter()
            .map(RunLogRow::try_into_entry)
            .collect::<Result<_, _>>()
            .map_err(store_error)
    }
}
