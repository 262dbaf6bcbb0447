//! Persistence traits for flows and runs, with in-memory implementations.
//!
//! The server provides Postgres implementations of the same traits.

use crate::definition::{DefinitionStatus, FlowDefinition, FlowProject};
use crate::error::StoreError;
use crate::execution::FlowRun;
use crate::snapshot::{FlowSnapshot, PublishPlan};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flowdeck_core::{DefinitionId, FlowRunId, ProjectId, SnapshotId, UserId};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

/// Storage for projects, definitions and snapshots.
#[async_trait]
pub trait FlowStore: Send + Sync {
    /// Inserts a project.
    ///
    /// Fails with `Conflict` if a non-deleted project of the same tenant has the same name.
    async fn insert_project(&self, project: &FlowProject) -> Result<(), StoreError>;

    /// Loads a project, including soft-deleted ones.
    async fn get_project(&self, id: ProjectId) -> Result<Option<FlowProject>, StoreError>;

    /// Soft-deletes a project and returns it.
    async fn soft_delete_project(
        &self,
        id: ProjectId,
        operator: UserId,
        at: DateTime<Utc>,
    ) -> Result<FlowProject, StoreError>;

    /// Inserts a new draft, assigning the next version of its `(project, name)`.
    ///
    /// Fails with `Conflict` if a non-archived definition already uses the name.
    async fn create_draft(&self, draft: FlowDefinition) -> Result<FlowDefinition, StoreError>;

    /// Loads a definition.
    async fn get_definition(&self, id: DefinitionId)
    -> Result<Option<FlowDefinition>, StoreError>;

    /// Replaces a draft's content.
    ///
    /// Fails with `Conflict` if the stored definition is no longer a DRAFT.
    async fn update_draft(&self, draft: &FlowDefinition) -> Result<(), StoreError>;

    /// Lists every version of a flow, newest first.
    async fn list_versions(
        &self,
        project_id: ProjectId,
        name: &str,
    ) -> Result<Vec<FlowDefinition>, StoreError>;

    /// Applies a publish atomically.
    ///
    /// Fails with `Conflict`, changing nothing, if the draft was already published.
    async fn apply_publish(&self, plan: &PublishPlan) -> Result<(), StoreError>;

    /// Archives every version of a flow and returns how many changed.
    async fn archive_flow(
        &self,
        project_id: ProjectId,
        name: &str,
        operator: UserId,
        at: DateTime<Utc>,
    ) -> Result<usize, StoreError>;

    /// Loads a snapshot.
    async fn get_snapshot(&self, id: SnapshotId) -> Result<Option<FlowSnapshot>, StoreError>;
}

/// Storage for run records.
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Inserts a run.
    async fn insert_run(&self, run: &FlowRun) -> Result<(), StoreError>;

    /// Replaces a run record.
    async fn update_run(&self, run: &FlowRun) -> Result<(), StoreError>;

    /// Loads a run.
    async fn get_run(&self, id: FlowRunId) -> Result<Option<FlowRun>, StoreError>;
}

#[derive(Debug, Default)]
struct FlowState {
    projects: HashMap<ProjectId, FlowProject>,
    definitions: HashMap<DefinitionId, FlowDefinition>,
    snapshots: HashMap<SnapshotId, FlowSnapshot>,
}

impl FlowState {
    fn lineage(&self, project_id: ProjectId, name: &str) -> impl Iterator<Item = &FlowDefinition> {
        self.definitions
            .values()
            .filter(move |d| d.project_id == project_id && d.name == name)
    }
}

/// In-memory flow store.
#[derive(Debug, Default)]
pub struct InMemoryFlowStore {
    state: Mutex<FlowState>,
}

impl InMemoryFlowStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, FlowState>, StoreError> {
        self.state.lock().map_err(|e| StoreError::Backend {
            message: format!("flow store lock poisoned: {e}"),
        })
    }
}

#[async_trait]
impl FlowStore for InMemoryFlowStore {
    async fn insert_project(&self, project: &FlowProject) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        let taken = state.projects.values().any(|p| {
            p.tenant_id == project.tenant_id && p.name == project.name && !p.is_deleted()
        });
        if taken {
            return Err(StoreError::Conflict {
                message: format!("project name '{}' is already in use", project.name),
            });
        }
        state.projects.insert(project.id, project.clone());
        Ok(())
    }

    async fn get_project(&self, id: ProjectId) -> Result<Option<FlowProject>, StoreError> {
        Ok(self.lock()?.projects.get(&id).cloned())
    }

    async fn soft_delete_project(
        &self,
        id: ProjectId,
        operator: UserId,
        at: DateTime<Utc>,
    ) -> Result<FlowProject, StoreError> {
        let mut state = self.lock()?;
        let project = state
            .projects
            .get_mut(&id)
            .filter(|p| !p.is_deleted())
            .ok_or_else(|| StoreError::NotFound {
                entity: "project",
                id: id.to_string(),
            })?;
        project.deleted_at = Some(at);
        project.updated_by = operator;
        project.updated_at = at;
        Ok(project.clone())
    }

    async fn create_draft(&self, mut draft: FlowDefinition) -> Result<FlowDefinition, StoreError> {
        let mut state = self.lock()?;
        let mut max_version = 0;
        for existing in state.lineage(draft.project_id, &draft.name) {
            if existing.status != DefinitionStatus::Archived {
                return Err(StoreError::Conflict {
                    message: format!("flow name '{}' is already in use", draft.name),
                });
            }
            max_version = max_version.max(existing.version);
        }
        draft.version = max_version + 1;
        state.definitions.insert(draft.id, draft.clone());
        Ok(draft)
    }

    async fn get_definition(
        &self,
        id: DefinitionId,
    ) -> Result<Option<FlowDefinition>, StoreError> {
        Ok(self.lock()?.definitions.get(&id).cloned())
    }

    async fn update_draft(&self, draft: &FlowDefinition) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        let stored = state
            .definitions
            .get_mut(&draft.id)
            .ok_or_else(|| StoreError::NotFound {
                entity: "definition",
                id: draft.id.to_string(),
            })?;
        if !stored.is_draft() {
            return Err(StoreError::Conflict {
                message: format!("definition {} is {}", draft.id, stored.status),
            });
        }
        *stored = draft.clone();
        Ok(())
    }

    async fn list_versions(
        &self,
        project_id: ProjectId,
        name: &str,
    ) -> Result<Vec<FlowDefinition>, StoreError> {
        let state = self.lock()?;
        let mut versions: Vec<FlowDefinition> = state.lineage(project_id, name).cloned().collect();
        versions.sort_by(|a, b| b.version.cmp(&a.version));
        Ok(versions)
    }

    async fn apply_publish(&self, plan: &PublishPlan) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        let published = &plan.published;
        match state.definitions.get(&published.id) {
            Some(current) if current.is_draft() => {}
            Some(current) => {
                return Err(StoreError::Conflict {
                    message: format!("definition {} is {}", published.id, current.status),
                });
            }
            None => {
                return Err(StoreError::NotFound {
                    entity: "definition",
                    id: published.id.to_string(),
                });
            }
        }

        for definition in state.definitions.values_mut() {
            if definition.project_id == published.project_id
                && definition.name == published.name
                && definition.is_latest
            {
                definition.is_latest = false;
            }
        }
        state
            .snapshots
            .insert(plan.snapshot.id, plan.snapshot.clone());
        state.definitions.insert(published.id, published.clone());
        state
            .definitions
            .insert(plan.next_draft.id, plan.next_draft.clone());
        Ok(())
    }

    async fn archive_flow(
        &self,
        project_id: ProjectId,
        name: &str,
        operator: UserId,
        at: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        let mut state = self.lock()?;
        let mut changed = 0;
        for definition in state.definitions.values_mut() {
            if definition.project_id == project_id
                && definition.name == name
                && definition.status != DefinitionStatus::Archived
            {
                definition.status = DefinitionStatus::Archived;
                definition.is_latest = false;
                definition.updated_by = operator;
                definition.updated_at = at;
                changed += 1;
            }
        }
        Ok(changed)
    }

    async fn get_snapshot(&self, id: SnapshotId) -> Result<Option<FlowSnapshot>, StoreError> {
        Ok(self.lock()?.snapshots.get(&id).cloned())
    }
}

/// In-memory run store.
#[derive(Debug, Default)]
pub struct InMemoryRunStore {
    runs: Mutex<HashMap<FlowRunId, FlowRun>>,
}

impl InMemoryRunStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<FlowRunId, FlowRun>>, StoreError> {
        self.runs.lock().map_err(|e| StoreError::Backend {
            message: format!("run store lock poisoned: {e}"),
        })
    }
}

#[async_trait]
impl RunStore for InMemoryRunStore {
    async fn insert_run(&self, run: &FlowRun) -> Result<(), StoreError> {
        self.lock()?.insert(run.id, run.clone());
        Ok(())
    }

    async fn update_run(&self, run: &FlowRun) -> Result<(), StoreError> {
        let mut runs = self.lock()?;
        let stored = runs.get_mut(&run.id).ok_or_else(|| StoreError::NotFound {
            entity: "run",
            id: run.id.to_string(),
        })?;
        *stored = run.clone();
        Ok(())
    }

    async fn get_run(&self, id: FlowRunId) -> Result<Option<FlowRun>, StoreError> {
        Ok(self.lock()?.get(&id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowdeck_core::TenantId;
    use serde_json::json;

    fn draft(project_id: ProjectId, name: &str) -> FlowDefinition {
        FlowDefinition::new_draft(project_id, name, None, json!({}), UserId::new())
    }

    #[tokio::test]
    async fn project_names_unique_among_live_projects() {
        let store = InMemoryFlowStore::new();
        let tenant = TenantId::new();
        let first = FlowProject::new(tenant, "ops", None, UserId::new());
        store.insert_project(&first).await.expect("insert");

        let clash = FlowProject::new(tenant, "ops", None, UserId::new());
        assert!(matches!(
            store.insert_project(&clash).await,
            Err(StoreError::Conflict { .. })
        ));

        store
            .insert_project(&FlowProject::new(TenantId::new(), "ops", None, UserId::new()))
            .await
            .expect("other tenant");

        store
            .soft_delete_project(first.id, UserId::new(), Utc::now())
            .await
            .expect("delete");
        store.insert_project(&clash).await.expect("name freed");
    }

    #[tokio::test]
    async fn draft_names_unique_until_archived() {
        let store = InMemoryFlowStore::new();
        let project = ProjectId::new();
        let first = store.create_draft(draft(project, "orders")).await.expect("v1");
        assert_eq!(first.version, 1);

        assert!(matches!(
            store.create_draft(draft(project, "orders")).await,
            Err(StoreError::Conflict { .. })
        ));

        let archived = store
            .archive_flow(project, "orders", UserId::new(), Utc::now())
            .await
            .expect("archive");
        assert_eq!(archived, 1);

        let again = store
            .create_draft(draft(project, "orders"))
            .await
            .expect("recreate");
        assert_eq!(again.version, 2);
    }

    #[tokio::test]
    async fn published_definitions_cannot_be_updated() {
        let store = InMemoryFlowStore::new();
        let mut def = store
            .create_draft(draft(ProjectId::new(), "orders"))
            .await
            .expect("create");
        def.status = DefinitionStatus::Published;
        store.update_draft(&def).await.expect("still draft in store");

        assert!(matches!(
            store.update_draft(&def).await,
            Err(StoreError::Conflict { .. })
        ));
    }

    #[tokio::test]
    async fn list_versions_newest_first() {
        let store = InMemoryFlowStore::new();
        let project = ProjectId::new();
        for _ in 0..3 {
            store.create_draft(draft(project, "orders")).await.expect("create");
            store
                .archive_flow(project, "orders", UserId::new(), Utc::now())
                .await
                .expect("archive");
        }
        let versions: Vec<i32> = store
            .list_versions(project, "orders")
            .await
            .expect("list")
            .iter()
            .map(|d| d.version)
            .collect();
        assert_eq!(versions, vec![3, 2, 1]);
    }

    #[tokio::test]
    async fn run_store_round_trip() {
        let store = InMemoryRunStore::new();
        let mut run = FlowRun::new(
            SnapshotId::new(),
            DefinitionId::new(),
            TenantId::new(),
            UserId::new(),
            None,
            json!({}),
            30,
        );
        assert!(matches!(
            store.update_run(&run).await,
            Err(StoreError::NotFound { .. })
        ));
        store.insert_run(&run).await.expect("insert");
        run.start();
        store.update_run(&run).await.expect("update");
        let loaded = store.get_run(run.id).await.expect("get").expect("run");
        assert_eq!(loaded.status, crate::execution::RunStatus::Running);
    }
}
