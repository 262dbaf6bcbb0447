//! Command surface over flows and runs.
//!
//! Every command takes the caller's `RequestContext`. Entities of another
//! tenant are reported as not found.

use crate::config::EngineConfig;
use crate::context::RequestContext;
use crate::definition::{FlowContent, FlowDefinition, FlowProject, VersionSummary};
use crate::error::{FlowError, StoreError};
use crate::execution::FlowRun;
use crate::graph::FlowGraph;
use crate::run_log::{RunLogEntry, RunLogRecorder};
use crate::scheduler::RunScheduler;
use crate::snapshot::{FlowSnapshot, PublishPlan, SnapshotPublisher};
use crate::store::{FlowStore, RunStore};
use crate::tool::{ToolExecutionService, ToolInvoker};
use crate::validation::{Violation, ViolationCode, validate_structure};
use async_trait::async_trait;
use chrono::Utc;
use flowdeck_core::{DefinitionId, FlowRunId, ProjectId, Result, SnapshotId, UserId};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, instrument};

/// Resolves operator ids to display names.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    /// Returns the display name of a user, if known.
    async fn display_name(&self, user: UserId) -> Option<String>;
}

/// In-memory user directory.
#[derive(Debug, Default)]
pub struct InMemoryUserDirectory {
    names: Mutex<HashMap<UserId, String>>,
}

impl InMemoryUserDirectory {
    /// Creates an empty directory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a display name.
    pub fn insert(&self, user: UserId, name: impl Into<String>) {
        self.names
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(user, name.into());
    }
}

#[async_trait]
impl UserDirectory for InMemoryUserDirectory {
    async fn display_name(&self, user: UserId) -> Option<String> {
        self.names
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&user)
            .cloned()
    }
}

/// Creates a project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateProject {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
}

/// Creates the first draft of a named flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateFlowDefinition {
    pub project_id: ProjectId,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub diagram: JsonValue,
}

/// What a run executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RunTarget {
    /// A specific snapshot.
    SnapshotId(SnapshotId),
    /// A published definition's snapshot; a draft resolves to the latest
    /// published version of its flow.
    DefinitionId(DefinitionId),
}

/// Starts a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteFlow {
    pub target: RunTarget,
    #[serde(default)]
    pub input: JsonValue,
    /// Run timeout; clamped, with a default when absent or non-positive.
    #[serde(default)]
    pub timeout_minutes: Option<i64>,
    /// Return as soon as the run has started instead of waiting for it.
    #[serde(default)]
    pub async_mode: bool,
}

/// Cancellation tokens of the runs currently executing.
#[derive(Debug, Clone, Default)]
struct ActiveRuns(Arc<Mutex<HashMap<FlowRunId, CancellationToken>>>);

impl ActiveRuns {
    fn register(&self, id: FlowRunId) -> CancellationToken {
        let token = CancellationToken::new();
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, token.clone());
        token
    }

    fn release(&self, id: FlowRunId) {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
    }

    fn cancel(&self, id: FlowRunId) -> bool {
        match self.0.lock().unwrap_or_else(PoisonError::into_inner).get(&id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    fn cancel_all(&self) {
        for token in self.0.lock().unwrap_or_else(PoisonError::into_inner).values() {
            token.cancel();
        }
    }
}

/// The flow command service.
pub struct FlowService {
    flows: Arc<dyn FlowStore>,
    runs: Arc<dyn RunStore>,
    run_log: Arc<dyn RunLogRecorder>,
    users: Arc<dyn UserDirectory>,
    publisher: SnapshotPublisher,
    scheduler: Arc<RunScheduler>,
    active: ActiveRuns,
    background: TaskTracker,
}

impl FlowService {
    /// Creates a service over the given stores and tool service.
    pub fn new(
        flows: Arc<dyn FlowStore>,
        runs: Arc<dyn RunStore>,
        run_log: Arc<dyn RunLogRecorder>,
        users: Arc<dyn UserDirectory>,
        tools: Arc<dyn ToolExecutionService>,
        config: EngineConfig,
    ) -> Self {
        let invoker = Arc::new(ToolInvoker::new(tools));
        Self {
            publisher: SnapshotPublisher::new(flows.clone()),
            scheduler: Arc::new(RunScheduler::new(invoker, run_log.clone(), config)),
            flows,
            runs,
            run_log,
            users,
            active: ActiveRuns::default(),
            background: TaskTracker::new(),
        }
    }

    /// Creates a project.
    ///
    /// # Errors
    ///
    /// `Validation` for an empty name, `PublishConflict` if the name is taken.
    #[instrument(skip(self, command), fields(tenant_id = %ctx.tenant_id))]
    pub async fn create_project(
        &self,
        ctx: &RequestContext,
        command: CreateProject,
    ) -> Result<FlowProject, FlowError> {
        let name = command.name.trim();
        if name.is_empty() {
            return Err(required_name("project").into());
        }
        let project = FlowProject::new(ctx.tenant_id, name, command.description, ctx.operator_id);
        self.flows
            .insert_project(&project)
            .await
            .map_err(|e| conflict_on(e, project.name.clone()))?;
        info!(project_id = %project.id, "Project created");
        Ok(project)
    }

    /// Soft-deletes a project.
    ///
    /// # Errors
    ///
    /// `NotFound` if the project does not exist or is already deleted.
    #[instrument(skip(self), fields(tenant_id = %ctx.tenant_id))]
    pub async fn delete_project(
        &self,
        ctx: &RequestContext,
        project_id: ProjectId,
    ) -> Result<FlowProject, FlowError> {
        self.live_project(ctx, project_id).await?;
        let project = self
            .flows
            .soft_delete_project(project_id, ctx.operator_id, Utc::now())
            .await
            .map_err(FlowError::from)?;
        info!(%project_id, "Project deleted");
        Ok(project)
    }

    /// Creates the first draft of a flow.
    ///
    /// # Errors
    ///
    /// `NotFound` for a missing or deleted project, `Validation` for an empty
    /// name, `PublishConflict` if a live flow already uses the name.
    #[instrument(skip(self, command), fields(tenant_id = %ctx.tenant_id, project_id = %command.project_id))]
    pub async fn create_definition(
        &self,
        ctx: &RequestContext,
        command: CreateFlowDefinition,
    ) -> Result<FlowDefinition, FlowError> {
        self.live_project(ctx, command.project_id).await?;
        let name = command.name.trim();
        if name.is_empty() {
            return Err(required_name("flow").into());
        }
        let draft = FlowDefinition::new_draft(
            command.project_id,
            name,
            command.description,
            command.diagram,
            ctx.operator_id,
        );
        let created = self
            .flows
            .create_draft(draft)
            .await
            .map_err(|e| conflict_on(e, name.to_string()))?;
        info!(definition_id = %created.id, version = created.version, "Flow definition created");
        Ok(created)
    }

    /// Loads a definition.
    ///
    /// # Errors
    ///
    /// `NotFound` if it does not exist or belongs to another tenant.
    pub async fn get_definition(
        &self,
        ctx: &RequestContext,
        definition_id: DefinitionId,
    ) -> Result<FlowDefinition, FlowError> {
        let definition = self.definition(definition_id).await?;
        self.project(ctx, definition.project_id).await?;
        Ok(definition)
    }

    /// Replaces the structure of a draft.
    ///
    /// Nothing is stored unless the whole structure is valid.
    ///
    /// # Errors
    ///
    /// `Validation` with every violation found, `PublishConflict` if the
    /// definition is not a DRAFT.
    #[instrument(skip(self, content), fields(tenant_id = %ctx.tenant_id, %definition_id))]
    pub async fn update_structure(
        &self,
        ctx: &RequestContext,
        definition_id: DefinitionId,
        content: FlowContent,
    ) -> Result<FlowDefinition, FlowError> {
        let definition = self.definition(definition_id).await?;
        self.live_project(ctx, definition.project_id).await?;
        if !definition.is_draft() {
            return Err(FlowError::PublishConflict {
                entity_id: definition_id.to_string(),
                message: format!(
                    "definition {definition_id} is {}, only drafts can be edited",
                    definition.status
                ),
            }
            .into());
        }
        validate_structure(&content.nodes, &content.edges).map_err(FlowError::from)?;

        let updated = definition.with_structure(content, ctx.operator_id);
        self.flows
            .update_draft(&updated)
            .await
            .map_err(|e| conflict_on(e, definition_id.to_string()))?;
        info!(
            nodes = updated.content.nodes.len(),
            edges = updated.content.edges.len(),
            "Flow structure updated"
        );
        Ok(updated)
    }

    /// Publishes a draft into an immutable snapshot.
    ///
    /// # Errors
    ///
    /// See [`SnapshotPublisher::publish`].
    #[instrument(skip(self, publish_note), fields(tenant_id = %ctx.tenant_id, %definition_id))]
    pub async fn publish(
        &self,
        ctx: &RequestContext,
        definition_id: DefinitionId,
        publish_note: Option<String>,
    ) -> Result<PublishPlan, FlowError> {
        let definition = self.definition(definition_id).await?;
        self.live_project(ctx, definition.project_id).await?;
        Ok(self
            .publisher
            .publish(definition_id, publish_note, ctx.operator_id)
            .await?)
    }

    /// Lists every version of a flow, newest first, with operator names.
    ///
    /// # Errors
    ///
    /// `NotFound` if the project or the flow does not exist.
    pub async fn list_versions(
        &self,
        ctx: &RequestContext,
        project_id: ProjectId,
        name: &str,
    ) -> Result<Vec<VersionSummary>, FlowError> {
        self.project(ctx, project_id).await?;
        let versions = self
            .flows
            .list_versions(project_id, name)
            .await
            .map_err(FlowError::from)?;
        if versions.is_empty() {
            return Err(FlowError::NotFound {
                entity: "flow",
                id: name.to_string(),
            }
            .into());
        }

        let mut names: HashMap<UserId, Option<String>> = HashMap::new();
        let mut summaries = Vec::with_capacity(versions.len());
        for definition in &versions {
            let mut summary = VersionSummary::from_definition(definition);
            let user = definition.updated_by;
            if !names.contains_key(&user) {
                names.insert(user, self.users.display_name(user).await);
            }
            summary.updated_by_name = names.get(&user).cloned().flatten();
            summaries.push(summary);
        }
        Ok(summaries)
    }

    /// Archives every version of a flow, freeing its name.
    ///
    /// # Errors
    ///
    /// `NotFound` if no live version of the flow exists.
    #[instrument(skip(self), fields(tenant_id = %ctx.tenant_id))]
    pub async fn archive_flow(
        &self,
        ctx: &RequestContext,
        project_id: ProjectId,
        name: &str,
    ) -> Result<usize, FlowError> {
        self.project(ctx, project_id).await?;
        let archived = self
            .flows
            .archive_flow(project_id, name, ctx.operator_id, Utc::now())
            .await
            .map_err(FlowError::from)?;
        if archived == 0 {
            return Err(FlowError::NotFound {
                entity: "flow",
                id: name.to_string(),
            }
            .into());
        }
        info!(archived, "Flow archived");
        Ok(archived)
    }

    /// Loads a snapshot.
    ///
    /// # Errors
    ///
    /// `NotFound` if it does not exist or belongs to another tenant.
    pub async fn get_snapshot(
        &self,
        ctx: &RequestContext,
        snapshot_id: SnapshotId,
    ) -> Result<FlowSnapshot, FlowError> {
        let snapshot = self.snapshot(snapshot_id).await?;
        self.project(ctx, snapshot.project_id).await?;
        Ok(snapshot)
    }

    /// Starts a run of a published snapshot.
    ///
    /// Waits for the run to finish unless `async_mode` is set, in which case
    /// the RUNNING run is returned and execution continues in the background.
    ///
    /// # Errors
    ///
    /// `NotFound` for a missing snapshot, definition or deleted project,
    /// `PublishConflict` if a definition has never been published.
    #[instrument(skip(self, command), fields(tenant_id = %ctx.tenant_id))]
    pub async fn execute_flow(
        &self,
        ctx: &RequestContext,
        command: ExecuteFlow,
    ) -> Result<FlowRun, FlowError> {
        let snapshot = self.resolve_target(command.target).await?;
        self.live_project(ctx, snapshot.project_id).await?;
        let graph = snapshot.graph().map_err(|e| FlowError::Storage {
            message: format!("snapshot {} does not hold a valid graph: {e}", snapshot.id),
        })?;

        let timeout_minutes = self
            .scheduler
            .config()
            .effective_timeout_minutes(command.timeout_minutes);
        let mut run = FlowRun::new(
            snapshot.id,
            snapshot.definition_id,
            ctx.tenant_id,
            ctx.operator_id,
            ctx.thread_id,
            command.input,
            timeout_minutes,
        );
        self.runs.insert_run(&run).await.map_err(FlowError::from)?;
        run.start();
        self.runs.update_run(&run).await.map_err(FlowError::from)?;
        info!(run_id = %run.id, snapshot_id = %snapshot.id, timeout_minutes, "Run accepted");

        let cancel = self.active.register(run.id);
        let execution = RunExecution {
            scheduler: self.scheduler.clone(),
            runs: self.runs.clone(),
            active: self.active.clone(),
            graph: Arc::new(graph),
            async_mode: command.async_mode,
        };
        if command.async_mode {
            let started = run.clone();
            self.background.spawn(execution.complete(run, cancel));
            Ok(started)
        } else {
            Ok(execution.complete(run, cancel).await)
        }
    }

    /// Loads a run.
    ///
    /// # Errors
    ///
    /// `NotFound` if it does not exist or belongs to another tenant.
    pub async fn get_run(
        &self,
        ctx: &RequestContext,
        run_id: FlowRunId,
    ) -> Result<FlowRun, FlowError> {
        let run = self
            .runs
            .get_run(run_id)
            .await
            .map_err(FlowError::from)?
            .filter(|r| r.tenant_id == ctx.tenant_id)
            .ok_or_else(|| not_found("run", run_id))?;
        Ok(run)
    }

    /// Requests cancellation of a run.
    ///
    /// A run that already finished is returned unchanged.
    ///
    /// # Errors
    ///
    /// `NotFound` if the run does not exist or belongs to another tenant.
    #[instrument(skip(self), fields(tenant_id = %ctx.tenant_id, %run_id))]
    pub async fn cancel_run(
        &self,
        ctx: &RequestContext,
        run_id: FlowRunId,
    ) -> Result<FlowRun, FlowError> {
        let run = self.get_run(ctx, run_id).await?;
        if !run.status.is_terminal() && self.active.cancel(run_id) {
            info!("Run cancellation requested");
        }
        Ok(run)
    }

    /// Returns the log of a run in order of occurrence.
    ///
    /// # Errors
    ///
    /// `NotFound` if the run does not exist or belongs to another tenant.
    pub async fn run_logs(
        &self,
        ctx: &RequestContext,
        run_id: FlowRunId,
    ) -> Result<Vec<RunLogEntry>, FlowError> {
        self.get_run(ctx, run_id).await?;
        Ok(self
            .run_log
            .entries(run_id)
            .await
            .map_err(FlowError::from)?)
    }

    /// Cancels every run in flight and waits until background runs have
    /// stored their final record.
    pub async fn shutdown(&self) {
        self.active.cancel_all();
        self.background.close();
        self.background.wait().await;
        info!("Flow service stopped");
    }

    async fn resolve_target(&self, target: RunTarget) -> Result<FlowSnapshot, FlowError> {
        let definition = match target {
            RunTarget::SnapshotId(id) => return self.snapshot(id).await,
            RunTarget::DefinitionId(id) => self.definition(id).await?,
        };
        if let Some(snapshot_id) = definition.snapshot_id {
            return self.snapshot(snapshot_id).await;
        }

        let latest = self
            .flows
            .list_versions(definition.project_id, &definition.name)
            .await
            .map_err(FlowError::from)?
            .into_iter()
            .find(|d| d.is_latest)
            .and_then(|d| d.snapshot_id);
        match latest {
            Some(snapshot_id) if definition.is_draft() => self.snapshot(snapshot_id).await,
            _ => Err(FlowError::PublishConflict {
                entity_id: definition.id.to_string(),
                message: format!("flow '{}' has no published version", definition.name),
            }
            .into()),
        }
    }

    async fn project(
        &self,
        ctx: &RequestContext,
        project_id: ProjectId,
    ) -> Result<FlowProject, FlowError> {
        let project = self
            .flows
            .get_project(project_id)
            .await
            .map_err(FlowError::from)?
            .filter(|p| p.tenant_id == ctx.tenant_id)
            .ok_or_else(|| not_found("project", project_id))?;
        Ok(project)
    }

    async fn live_project(
        &self,
        ctx: &RequestContext,
        project_id: ProjectId,
    ) -> Result<FlowProject, FlowError> {
        let project = self.project(ctx, project_id).await?;
        if project.is_deleted() {
            return Err(not_found("project", project_id).into());
        }
        Ok(project)
    }

    async fn definition(&self, id: DefinitionId) -> Result<FlowDefinition, FlowError> {
        let definition = self
            .flows
            .get_definition(id)
            .await
            .map_err(FlowError::from)?
            .ok_or_else(|| not_found("definition", id))?;
        Ok(definition)
    }

    async fn snapshot(&self, id: SnapshotId) -> Result<FlowSnapshot, FlowError> {
        let snapshot = self
            .flows
            .get_snapshot(id)
            .await
            .map_err(FlowError::from)?
            .ok_or_else(|| not_found("snapshot", id))?;
        Ok(snapshot)
    }
}

/// Everything needed to drive a run to completion, detached from the service.
struct RunExecution {
    scheduler: Arc<RunScheduler>,
    runs: Arc<dyn RunStore>,
    active: ActiveRuns,
    graph: Arc<FlowGraph>,
    async_mode: bool,
}

impl RunExecution {
    async fn complete(self, mut run: FlowRun, cancel: CancellationToken) -> FlowRun {
        let outcome = self
            .scheduler
            .execute(&run, self.graph, self.async_mode, &cancel)
            .await;
        run.finish(
            outcome.status,
            Some(outcome.output),
            outcome.error.as_ref().map(FlowError::detail),
            outcome.nodes,
        );
        if let Err(e) = self.runs.update_run(&run).await {
            error!(run_id = %run.id, error = %e, "Failed to store finished run");
        }
        self.active.release(run.id);
        run
    }
}

fn not_found(entity: &'static str, id: impl ToString) -> FlowError {
    FlowError::NotFound {
        entity,
        id: id.to_string(),
    }
}

fn required_name(entity: &str) -> FlowError {
    FlowError::Validation {
        violations: vec![Violation::flow(
            ViolationCode::EmptyName,
            format!("{entity} name must not be empty"),
        )],
    }
}

fn conflict_on(error: StoreError, entity_id: String) -> FlowError {
    match error {
        StoreError::Conflict { message } => FlowError::PublishConflict { entity_id, message },
        other => other.into(),
    }
}
