//! Postgres storage for projects, flow definitions and snapshots.

use super::{json_column, parse_column, store_error, to_json};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flowdeck_core::{DefinitionId, ProjectId, SnapshotId, UserId};
use flowdeck_workflow::definition::DefinitionStatus;
use flowdeck_workflow::{
    FlowDefinition, FlowProject, FlowSnapshot, FlowStore, PublishPlan, StoreError,
};
use sqlx::{FromRow, PgPool, Postgres, Transaction};

/// Row type for project queries.
#[derive(FromRow)]
struct ProjectRow {
    id: String,
    tenant_id: String,
    name: String,
    description: Option<String>,
    created_by: String,
    created_at: DateTime<Utc>,
    updated_by: String,
    updated_at: DateTime<Utc>,
    deleted_at: Option<DateTime<Utc>>,
}

impl ProjectRow {
    fn try_into_project(self) -> Result<FlowProject, sqlx::Error> {
        Ok(FlowProject {
            id: parse_column("project id", &self.id)?,
            tenant_id: parse_column("tenant id", &self.tenant_id)?,
            name: self.name,
            description: self.description,
            created_by: parse_column("user id", &self.created_by)?,
            created_at: self.created_at,
            updated_by: parse_column("user id", &self.updated_by)?,
            updated_at: self.updated_at,
            deleted_at: self.deleted_at,
        })
    }
}

/// Row type for definition queries.
#[derive(FromRow)]
struct DefinitionRow {
    id: String,
    project_id: String,
    name: String,
    description: Option<String>,
    version: i32,
    status: String,
    is_latest: bool,
    content: serde_json::Value,
    publish_note: Option<String>,
    snapshot_id: Option<String>,
    created_by: String,
    created_at: DateTime<Utc>,
    updated_by: String,
    updated_at: DateTime<Utc>,
}

impl DefinitionRow {
    fn try_into_definition(self) -> Result<FlowDefinition, sqlx::Error> {
        Ok(FlowDefinition {
            id: parse_column("definition id", &self.id)?,
            project_id: parse_column("project id", &self.project_id)?,
            name: self.name,
            description: self.description,
            version: self.version,
            status: parse_column("definition status", &self.status)?,
            is_latest: self.is_latest,
            content: json_column("definition content", self.content)?,
            publish_note: self.publish_note,
            snapshot_id: self
                .snapshot_id
                .map(|id| parse_column("snapshot id", &id))
                .transpose()?,
            created_by: parse_column("user id", &self.created_by)?,
            created_at: self.created_at,
            updated_by: parse_column("user id", &self.updated_by)?,
            updated_at: self.updated_at,
        })
    }
}

/// Row type for snapshot queries.
#[derive(FromRow)]
struct SnapshotRow {
    id: String,
    definition_id: String,
    project_id: String,
    name: String,
    version: i32,
    content: Vec<u8>,
    publish_note: Option<String>,
    created_by: String,
    created_at: DateTime<Utc>,
}

impl SnapshotRow {
    fn try_into_snapshot(self) -> Result<FlowSnapshot, sqlx::Error> {
        let content = serde_json::from_slice(&self.content)
            .map_err(|e| super::invalid_column("snapshot content", &self.id, e))?;
        Ok(FlowSnapshot {
            id: parse_column("snapshot id", &self.id)?,
            definition_id: parse_column("definition id", &self.definition_id)?,
            project_id: parse_column("project id", &self.project_id)?,
            name: self.name,
            version: self.version,
            content,
            content_bytes: self.content,
            publish_note: self.publish_note,
            created_by: parse_column("user id", &self.created_by)?,
            created_at: self.created_at,
        })
    }
}

const DEFINITION_COLUMNS: &str = "id, project_id, name, description, version, status, is_latest, \
     content, publish_note, snapshot_id, created_by, created_at, updated_by, updated_at";

/// Postgres implementation of [`FlowStore`].
#[derive(Clone)]
pub struct PgFlowStore {
    pool: PgPool,
}

impl PgFlowStore {
    /// Creates a new store.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn insert_definition(
        tx: &mut Transaction<'_, Postgres>,
        definition: &FlowDefinition,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO flow_definitions
                (id, project_id, name, description, version, status, is_latest, content,
                 publish_note, snapshot_id, created_by, created_at, updated_by, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(definition.id.to_string())
        .bind(definition.project_id.to_string())
        .bind(&definition.name)
        .bind(&definition.description)
        .bind(definition.version)
        .bind(definition.status.as_str())
        .bind(definition.is_latest)
        .bind(to_json(&definition.content)?)
        .bind(&definition.publish_note)
        .bind(definition.snapshot_id.map(|id| id.to_string()))
        .bind(definition.created_by.to_string())
        .bind(definition.created_at)
        .bind(definition.updated_by.to_string())
        .bind(definition.updated_at)
        .execute(&mut **tx)
        .await
        .map_err(store_error)?;
        Ok(())
    }

    /// Locks a definition row and returns its status.
    async fn lock_status(
        tx: &mut Transaction<'_, Postgres>,
        id: DefinitionId,
    ) -> Result<DefinitionStatus, StoreError> {
        let status: Option<String> =
            sqlx::query_scalar("SELECT status FROM flow_definitions WHERE id = $1 FOR UPDATE")
                .bind(id.to_string())
                .fetch_optional(&mut **tx)
                .await
                .map_err(store_error)?;
        let status = status.ok_or_else(|| StoreError::NotFound {
            entity: "definition",
            id: id.to_string(),
        })?;
        parse_column("definition status", &status).map_err(store_error)
    }
}

#[async_trait]
impl FlowStore for PgFlowStore {
    async fn insert_project(&self, project: &FlowProject) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO flow_projects
                (id, tenant_id, name, description, created_by, created_at,
                 updated_by, updated_at, deleted_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(project.id.to_string())
        .bind(project.tenant_id.to_string())
        .bind(&project.name)
        .bind(&project.description)
        .bind(project.created_by.to_string())
        .bind(project.created_at)
        .bind(project.updated_by.to_string())
        .bind(project.updated_at)
        .bind(project.deleted_at)
        .execute(&self.pool)
        .await
        .map_err(store_error)?;
        Ok(())
    }

    async fn get_project(&self, id: ProjectId) -> Result<Option<FlowProject>, StoreError> {
        let row: Option<ProjectRow> = sqlx::query_as(
            r#"
            SELECT id, tenant_id, name, description, created_by, created_at,
                   updated_by, updated_at, deleted_at
            FROM flow_projects
            WHERE id = $1
            "#,
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(store_error)?;

        row.map(ProjectRow::try_into_project)
            .transpose()
            .map_err(store_error)
    }

    async fn soft_delete_project(
        &self,
        id: ProjectId,
        operator: UserId,
        at: DateTime<Utc>,
    ) -> Result<FlowProject, StoreError> {
        let row: Option<ProjectRow> = sqlx::query_as(
            r#"
            UPDATE flow_projects
            SET deleted_at = $3, updated_by = $2, updated_at = $3
            WHERE id = $1 AND deleted_at IS NULL
            RETURNING id, tenant_id, name, description, created_by, created_at,
                      updated_by, updated_at, deleted_at
            "#,
        )
        .bind(id.to_string())
        .bind(operator.to_string())
        .bind(at)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_error)?;

        row.ok_or_else(|| StoreError::NotFound {
            entity: "project",
            id: id.to_string(),
        })?
        .try_into_project()
        .map_err(store_error)
    }

    async fn create_draft(&self, mut draft: FlowDefinition) -> Result<FlowDefinition, StoreError> {
        let mut tx = self.pool.begin().await.map_err(store_error)?;

        // Serializes draft creation within a project.
        sqlx::query("SELECT id FROM flow_projects WHERE id = $1 FOR UPDATE")
            .bind(draft.project_id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(store_error)?;

        let (live, max_version): (i64, Option<i32>) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FILTER (WHERE status <> 'ARCHIVED'), MAX(version)
            FROM flow_definitions
            WHERE project_id = $1 AND name = $2
            "#,
        )
        .bind(draft.project_id.to_string())
        .bind(&draft.name)
        .fetch_one(&mut *tx)
        .await
        .map_err(store_error)?;

        if live > 0 {
            return Err(StoreError::Conflict {
                message: format!("flow name '{}' is already in use", draft.name),
            });
        }
        draft.version = max_version.unwrap_or(0) + 1;
        Self::insert_definition(&mut tx, &draft).await?;
        tx.commit().await.map_err(store_error)?;
        Ok(draft)
    }

    async fn get_definition(
        &self,
        id: DefinitionId,
    ) -> Result<Option<FlowDefinition>, StoreError> {
        let row: Option<DefinitionRow> = sqlx::query_as(&format!(
            "SELECT {DEFINITION_COLUMNS} FROM flow_definitions WHERE id = $1"
        ))
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(store_error)?;

        row.map(DefinitionRow::try_into_definition)
            .transpose()
            .map_err(store_error)
    }

    async fn update_draft(&self, draft: &FlowDefinition) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(store_error)?;
        let status = Self::lock_status(&mut tx, draft.id).await?;
        if status != DefinitionStatus::Draft {
            return Err(StoreError::Conflict {
                message: format!("definition {} is {status}", draft.id),
            });
        }

        sqlx::query(
            r#"
            UPDATE flow_definitions
            SET description = $2, content = $3, updated_by = $4, updated_at = $5
            WHERE id = $1
            "#,
        )
        .bind(draft.id.to_string())
        .bind(&draft.description)
        .bind(to_json(&draft.content)?)
        .bind(draft.updated_by.to_string())
        .bind(draft.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(store_error)?;

        tx.commit().await.map_err(store_error)
    }

    async fn list_versions(
        &self,
        project_id: ProjectId,
        name: &str,
    ) -> Result<Vec<FlowDefinition>, StoreError> {
        let rows: Vec<DefinitionRow> = sqlx::query_as(&format!(
            r#"
            SELECT {DEFINITION_COLUMNS}
            FROM flow_definitions
            WHERE project_id = $1 AND name = $2
            ORDER BY version DESC
            "#
        ))
        .bind(project_id.to_string())
        .bind(name)
        .fetch_all(&self.pool)
        .await
        .map_err(store_error)?;

        rows.into_iter()
            .map(DefinitionRow::try_into_definition)
            .collect::<Result<_, _>>()
            .map_err(store_error)
    }

    async fn apply_publish(&self, plan: &PublishPlan) -> Result<(), StoreError> {
        let published = &plan.published;
        let snapshot = &plan.snapshot;
        let mut tx = self.pool.begin().await.map_err(store_error)?;

        let status = Self::lock_status(&mut tx, published.id).await?;
        if status != DefinitionStatus::Draft {
            return Err(StoreError::Conflict {
                message: format!("definition {} is {status}", published.id),
            });
        }

        sqlx::query(
            r#"
            UPDATE flow_definitions
            SET is_latest = FALSE
            WHERE project_id = $1 AND name = $2 AND is_latest
            "#,
        )
        .bind(published.project_id.to_string())
        .bind(&published.name)
        .execute(&mut *tx)
        .await
        .map_err(store_error)?;

        sqlx::query(
            r#"
            INSERT INTO flow_snapshots
                (id, definition_id, project_id, name, version, content, publish_note,
                 created_by, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(snapshot.id.to_string())
        .bind(snapshot.definition_id.to_string())
        .bind(snapshot.project_id.to_string())
        .bind(&snapshot.name)
        .bind(snapshot.version)
        .bind(&snapshot.content_bytes)
        .bind(&snapshot.publish_note)
        .bind(snapshot.created_by.to_string())
        .bind(snapshot.created_at)
        .execute(&mut *tx)
        .await
        .map_err(store_error)?;

        sqlx::query(
            r#"
            UPDATE flow_definitions
            SET status = $2, is_latest = TRUE, publish_note = $3, snapshot_id = $4,
                updated_by = $5, updated_at = $6
            WHERE id = $1
            "#,
        )
        .bind(published.id.to_string())
        .bind(published.status.as_str())
        .bind(&published.publish_note)
        .bind(published.snapshot_id.map(|id| id.to_string()))
        .bind(published.updated_by.to_string())
        .bind(published.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(store_error)?;

        Self::insert_definition(&mut tx, &plan.next_draft).await?;
        tx.commit().await.map_err(store_error)
    }

    async fn archive_flow(
        &self,
        project_id: ProjectId,
        name: &str,
        operator: UserId,
        at: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE flow_definitions
            SET status = 'ARCHIVED', is_latest = FALSE, updated_by = $3, updated_at = $4
            WHERE project_id = $1 AND name = $2 AND status <> 'ARCHIVED'
            "#,
        )
        .bind(project_id.to_string())
        .bind(name)
        .bind(operator.to_string())
        .bind(at)
        .execute(&self.pool)
        .await
        .map_err(store_error)?;

        usize::try_from(result.rows_affected()).map_err(|e| StoreError::Backend {
            message: e.to_string(),
        })
    }

    async fn get_snapshot(&self, id: SnapshotId) -> Result<Option<FlowSnapshot>, StoreError> {
        let row: Option<SnapshotRow> = sqlx::query_as(
            r#"
            SELECT id, definition_id, project_id, name, version, content, publish_note,
                   created_by, created_at
            FROM flow_snapshots
            WHERE id = $1
            "#,
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(store_error)?;

        row.map(SnapshotRow::try_into_snapshot)
            .transpose()
            .map_err(store_error)
    }
}
