//! Flow projects and flow definitions.
//!
//! A definition is one version of a named flow within a project. Versions of
//! the same `(project, name)` form a lineage: at most one of them is a DRAFT
//! at a time, published versions are frozen into snapshots, and the most
//! recently published version carries `is_latest`.

use crate::edge::FlowEdge;
use crate::node::FlowNode;
use chrono::{DateTime, Utc};
use flowdeck_core::{DefinitionId, ProjectId, SnapshotId, TenantId, UserId};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;
use std::str::FromStr;

/// A container for flows, owned by a tenant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowProject {
    pub id: ProjectId,
    pub tenant_id: TenantId,
    pub name: String,
    pub description: Option<String>,
    pub created_by: UserId,
    pub created_at: DateTime<Utc>,
    pub updated_by: UserId,
    pub updated_at: DateTime<Utc>,
    /// Set when the project is soft-deleted.
    pub deleted_at: Option<DateTime<Utc>>,
}

impl FlowProject {
    /// Creates a new project.
    #[must_use]
    pub fn new(
        tenant_id: TenantId,
        name: impl Into<String>,
        description: Option<String>,
        operator: UserId,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: ProjectId::new(),
            tenant_id,
            name: name.into(),
            description,
            created_by: operator,
            created_at: now,
            updated_by: operator,
            updated_at: now,
            deleted_at: None,
        }
    }

    /// Returns true if the project was soft-deleted.
    #[must_use]
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

/// Lifecycle status of a definition version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DefinitionStatus {
    /// Editable working copy.
    Draft,
    /// Frozen into a snapshot; executable.
    Published,
    /// Retired; frees the flow name.
    Archived,
}

impl DefinitionStatus {
    /// Returns the stored name of this status.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "DRAFT",
            Self::Published => "PUBLISHED",
            Self::Archived => "ARCHIVED",
        }
    }
}

impl fmt::Display for DefinitionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DefinitionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "DRAFT" => Ok(Self::Draft),
            "PUBLISHED" => Ok(Self::Published),
            "ARCHIVED" => Ok(Self::Archived),
            other => Err(format!("unknown definition status: {other}")),
        }
    }
}

/// The structural content of a flow: what a snapshot freezes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowContent {
    #[serde(default)]
    pub nodes: Vec<FlowNode>,
    #[serde(default)]
    pub edges: Vec<FlowEdge>,
    /// Opaque editor diagram.
    #[serde(default)]
    pub diagram: JsonValue,
}

/// One version of a flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowDefinition {
    pub id: DefinitionId,
    pub project_id: ProjectId,
    pub name: String,
    pub description: Option<String>,
    /// Monotonic per `(project, name)`, starting at 1.
    pub version: i32,
    pub status: DefinitionStatus,
    pub is_latest: bool,
    pub content: FlowContent,
    pub publish_note: Option<String>,
    /// Snapshot frozen from this version, once published.
    pub snapshot_id: Option<SnapshotId>,
    pub created_by: UserId,
    pub created_at: DateTime<Utc>,
    pub updated_by: UserId,
    pub updated_at: DateTime<Utc>,
}

impl FlowDefinition {
    /// Creates an empty draft. The store assigns the final version number.
    #[must_use]
    pub fn new_draft(
        project_id: ProjectId,
        name: impl Into<String>,
        description: Option<String>,
        diagram: JsonValue,
        operator: UserId,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: DefinitionId::new(),
            project_id,
            name: name.into(),
            description,
            version: 1,
            status: DefinitionStatus::Draft,
            is_latest: false,
            content: FlowContent {
                nodes: Vec::new(),
                edges: Vec::new(),
                diagram,
            },
            publish_note: None,
            snapshot_id: None,
            created_by: operator,
            created_at: now,
            updated_by: operator,
            updated_at: now,
        }
    }

    /// Returns true if the definition can still be edited.
    #[must_use]
    pub fn is_draft(&self) -> bool {
        self.status == DefinitionStatus::Draft
    }

    /// Returns this draft with a new structure.
    #[must_use]
    pub fn with_structure(&self, content: FlowContent, operator: UserId) -> Self {
        Self {
            content,
            updated_by: operator,
            updated_at: Utc::now(),
            ..self.clone()
        }
    }

    /// Returns this draft as published: latest, frozen into `snapshot_id`.
    #[must_use]
    pub fn published(
        &self,
        snapshot_id: SnapshotId,
        publish_note: Option<String>,
        operator: UserId,
    ) -> Self {
        Self {
            status: DefinitionStatus::Published,
            is_latest: true,
            publish_note,
            snapshot_id: Some(snapshot_id),
            updated_by: operator,
            updated_at: Utc::now(),
            ..self.clone()
        }
    }

    /// Returns the draft that follows this version, holding a copy of its structure.
    #[must_use]
    pub fn next_draft(&self, operator: UserId) -> Self {
        let now = Utc::now();
        Self {
            id: DefinitionId::new(),
            version: self.version + 1,
            status: DefinitionStatus::Draft,
            is_latest: false,
            publish_note: None,
            snapshot_id: None,
            created_by: operator,
            created_at: now,
            updated_by: operator,
            updated_at: now,
            ..self.clone()
        }
    }
}

/// A row of a flow's version history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionSummary {
    pub definition_id: DefinitionId,
    pub version: i32,
    pub status: DefinitionStatus,
    pub is_latest: bool,
    pub publish_note: Option<String>,
    pub snapshot_id: Option<SnapshotId>,
    pub updated_by: UserId,
    /// Operator display name, when the user directory knows it.
    pub updated_by_name: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl VersionSummary {
    /// Summarizes a definition without a display name.
    #[must_use]
    pub fn from_definition(definition: &FlowDefinition) -> Self {
        Self {
            definition_id: definition.id,
            version: definition.version,
            status: definition.status,
            is_latest: definition.is_latest,
            publish_note: definition.publish_note.clone(),
            snapshot_id: definition.snapshot_id,
            updated_by: definition.updated_by,
            updated_by_name: None,
            updated_at: definition.updated_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn draft() -> FlowDefinition {
        FlowDefinition::new_draft(
            ProjectId::new(),
            "orders",
            None,
            JsonValue::Null,
            UserId::new(),
        )
    }

    #[test]
    fn new_draft_is_editable() {
        let def = draft();
        assert!(def.is_draft());
        assert!(!def.is_latest);
        assert_eq!(def.version, 1);
        assert!(def.snapshot_id.is_none());
    }

    #[test]
    fn publishing_then_next_draft() {
        let operator = UserId::new();
        let content = FlowContent {
            nodes: vec![FlowNode::new("a", "http")],
            ..FlowContent::default()
        };
        let def = draft().with_structure(content.clone(), operator);
        let snapshot_id = SnapshotId::new();
        let published = def.published(snapshot_id, Some("first".into()), operator);
        assert_eq!(published.status, DefinitionStatus::Published);
        assert!(published.is_latest);
        assert_eq!(published.snapshot_id, Some(snapshot_id));
        assert_eq!(published.id, def.id);

        let next = published.next_draft(operator);
        assert_ne!(next.id, published.id);
        assert_eq!(next.version, 2);
        assert!(next.is_draft());
        assert!(!next.is_latest);
        assert_eq!(next.content, content);
        assert!(next.publish_note.is_none());
    }

    #[test]
    fn status_round_trips_through_str() {
        for status in [
            DefinitionStatus::Draft,
            DefinitionStatus::Published,
            DefinitionStatus::Archived,
        ] {
            assert_eq!(status.as_str().parse::<DefinitionStatus>(), Ok(status));
        }
        assert!("LIVE".parse::<DefinitionStatus>().is_err());
    }

    #[test]
    fn project_soft_delete_flag() {
        let mut project = FlowProject::new(TenantId::new(), "ops", None, UserId::new());
        assert!(!project.is_deleted());
        project.deleted_at = Some(Utc::now());
        assert!(project.is_deleted());
    }
}
