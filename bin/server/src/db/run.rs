//! Postgres storage for flow runs.

use super::{json_column, parse_column, store_error, to_json};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flowdeck_core::FlowRunId;
use flowdeck_workflow::{FlowRun, RunStore, StoreError};
use sqlx::{FromRow, PgPool};

/// Row type for run queries.
#[derive(FromRow)]
struct RunRow {
    id: String,
    snapshot_id: String,
    definition_id: String,
    tenant_id: String,
    operator_id: String,
    thread_id: Option<String>,
    status: String,
    input: serde_json::Value,
    output: Option<serde_json::Value>,
    error: Option<serde_json::Value>,
    timeout_minutes: i64,
    nodes: serde_json::Value,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
}

impl RunRow {
    fn try_into_run(self) -> Result<FlowRun, sqlx::Error> {
        Ok(FlowRun {
            id: parse_column("run id", &self.id)?,
            snapshot_id: parse_column("snapshot id", &self.snapshot_id)?,
            definition_id: parse_column("definition id", &self.definition_id)?,
            tenant_id: parse_column("tenant id", &self.tenant_id)?,
            operator_id: parse_column("user id", &self.operator_id)?,
            thread_id: self
                .thread_id
                .map(|id| parse_column("thread id", &id))
                .transpose()?,
            status: parse_column("run status", &self.status)?,
            input: self.input,
            output: self.output,
            error: self
                .error
                .map(|error| json_column("run error", error))
                .transpose()?,
            timeout_minutes: self.timeout_minutes,
            nodes: json_column("run nodes", self.nodes)?,
            created_at: self.created_at,
            started_at: self.started_at,
            finished_at: self.finished_at,
        })
    }
}

/// Postgres implementation of [`RunStore`].
#[derive(Clone)]
pub struct PgRunStore {
    pool: PgPool,
}

impl PgRunStore {
    /// Creates a new store.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RunStore for PgRunStore {
    async fn insert_run(&self, run: &FlowRun) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO flow_runs
                (id, snapshot_id, definition_id, tenant_id, operator_id, thread_id, status,
                 input, output, error, timeout_minutes, nodes, created_at, started_at,
                 finished_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            "#,
        )
        .bind(run.id.to_string())
        .bind(run.snapshot_id.to_string())
        .bind(run.definition_id.to_string())
        .bind(run.tenant_id.to_string())
        .bind(run.operator_id.to_string())
        .bind(run.thread_id.map(|id| id.to_string()))
        .bind(run.status.as_str())
        .bind(&run.input)
        .bind(&run.output)
        .bind(run.error.as_ref().map(to_json).transpose()?)
        .bind(run.timeout_minutes)
        .bind(to_json(&run.nodes)?)
        .bind(run.created_at)
        .bind(run.started_at)
        .bind(run.finished_at)
        .execute(&self.pool)
        .await
        .map_err(store_error)?;
        Ok(())
    }

    async fn update_run(&self, run: &FlowRun) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE flow_runs
            SET status = $2, output = $3, error = $4, nodes = $5,
                started_at = $6, finished_at = $7
            WHERE id = $1
            "#,
        )
        .bind(run.id.to_string())
        .bind(run.status.as_str())
        .bind(&run.output)
        .bind(run.error.as_ref().map(to_json).transpose()?)
        .bind(to_json(&run.nodes)?)
        .bind(run.started_at)
        .bind(run.finished_at)
        .execute(&self.pool)
        .await
        .map_err(store_error)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                entity: "run",
                id: run.id.to_string(),
            });
        }
        Ok(())
    }

    async fn get_run(&self, id: FlowRunId) -> Result<Option<FlowRun>, StoreError> {
        let row: Option<RunRow> = sqlx::query_as(
            r#"
            SELECT id, snapshot_id, definition_id, tenant_id, operator_id, thread_id, status,
                   input, output, error, timeout_minutes, nodes, created_at, started_at,
                   finished_at
            FROM flow_runs
            WHERE id = $1
            "#,
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(store_error)?;

        row.map(RunRow::try_into_run)
            .transpose()
            .map_err(store_error)
    }
}
