//! Immutable flow snapshots and the publisher that freezes them.
//!
//! Publishing a draft:
//! 1. Checks the definition is still a DRAFT and passes publish validation
//! 2. Freezes a deep copy of its content into a snapshot, with canonical bytes
//! 3. Hands the store a `PublishPlan` applied atomically: insert the snapshot,
//!    mark the draft PUBLISHED and latest, clear the previous latest, open the
//!    next DRAFT with a copy of the structure
//!
//! Runs only ever bind to snapshots, never to definitions.

use crate::definition::{FlowContent, FlowDefinition};
use crate::error::{FlowError, GraphError, StoreError};
use crate::graph::FlowGraph;
use crate::store::FlowStore;
use crate::validation::validate_for_publish;
use chrono::{DateTime, Utc};
use flowdeck_core::{DefinitionId, ProjectId, SnapshotId, UserId};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument};

/// A frozen, executable copy of a published definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowSnapshot {
    pub id: SnapshotId,
    pub definition_id: DefinitionId,
    pub project_id: ProjectId,
    pub name: String,
    pub version: i32,
    pub content: FlowContent,
    /// Canonical JSON encoding of `content` at publish time.
    #[serde(skip)]
    pub content_bytes: Vec<u8>,
    pub publish_note: Option<String>,
    pub created_by: UserId,
    pub created_at: DateTime<Utc>,
}

impl FlowSnapshot {
    /// Freezes the content of a definition.
    ///
    /// # Errors
    ///
    /// Returns an error if the content cannot be encoded.
    pub fn freeze(
        definition: &FlowDefinition,
        publish_note: Option<String>,
        operator: UserId,
    ) -> Result<Self, serde_json::Error> {
        let content = definition.content.clone();
        let content_bytes = serde_json::to_vec(&content)?;
        Ok(Self {
            id: SnapshotId::new(),
            definition_id: definition.id,
            project_id: definition.project_id,
            name: definition.name.clone(),
            version: definition.version,
            content,
            content_bytes,
            publish_note,
            created_by: operator,
            created_at: Utc::now(),
        })
    }

    /// Builds the runnable graph of this snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error if the frozen structure is not a valid DAG.
    pub fn graph(&self) -> Result<FlowGraph, GraphError> {
        FlowGraph::build(&self.content.nodes, &self.content.edges)
    }
}

/// Everything a publish changes, applied by the store as one unit.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishPlan {
    pub snapshot: FlowSnapshot,
    /// The former draft, now PUBLISHED and latest.
    pub published: FlowDefinition,
    /// The DRAFT opened at the next version.
    pub next_draft: FlowDefinition,
}

/// Freezes drafts into snapshots.
pub struct SnapshotPublisher {
    store: Arc<dyn FlowStore>,
}

impl SnapshotPublisher {
    /// Creates a publisher over the given store.
    pub fn new(store: Arc<dyn FlowStore>) -> Self {
        Self { store }
    }

    /// Publishes a draft definition.
    ///
    /// # Errors
    ///
    /// - `NotFound` if the definition does not exist
    /// - `PublishConflict` if it is not a DRAFT, including when a concurrent
    ///   publish of the same draft won
    /// - `Validation` if the structure is invalid or empty
    #[instrument(skip(self, publish_note), fields(definition_id = %definition_id))]
    pub async fn publish(
        &self,
        definition_id: DefinitionId,
        publish_note: Option<String>,
        operator: UserId,
    ) -> Result<PublishPlan, FlowError> {
        let definition = self
            .store
            .get_definition(definition_id)
            .await?
            .ok_or_else(|| FlowError::NotFound {
                entity: "definition",
                id: definition_id.to_string(),
            })?;

        if !definition.is_draft() {
            return Err(FlowError::PublishConflict {
                entity_id: definition_id.to_string(),
                message: format!(
                    "definition {definition_id} is {}, only drafts can be published",
                    definition.status
                ),
            });
        }

        validate_for_publish(&definition.content.nodes, &definition.content.edges)?;

        let snapshot = FlowSnapshot::freeze(&definition, publish_note.clone(), operator).map_err(
            |e| FlowError::Storage {
                message: format!("failed to encode snapshot content: {e}"),
            },
        )?;
        let published = definition.published(snapshot.id, publish_note, operator);
        let next_draft = published.next_draft(operator);
        let plan = PublishPlan {
            snapshot,
            published,
            next_draft,
        };

        self.store
            .apply_publish(&plan)
            .await
            .map_err(|e| match e {
                StoreError::Conflict { message } => FlowError::PublishConflict {
                    entity_id: definition_id.to_string(),
                    message,
                },
                other => other.into(),
            })?;

        info!(
            snapshot_id = %plan.snapshot.id,
            version = plan.published.version,
            next_version = plan.next_draft.version,
            "Published flow definition"
        );

        Ok(plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::edge::FlowEdge;
    use crate::error::FlowErrorKind;
    use crate::node::FlowNode;
    use crate::store::InMemoryFlowStore;
    use serde_json::json;

    async fn draft_with(store: &InMemoryFlowStore, content: FlowContent) -> FlowDefinition {
        let draft = FlowDefinition::new_draft(
            ProjectId::new(),
            "orders",
            None,
            json!({}),
            UserId::new(),
        );
        let draft = store.create_draft(draft).await.expect("create");
        let draft = draft.with_structure(content, UserId::new());
        store.update_draft(&draft).await.expect("update");
        draft
    }

    fn content(keys: &[&str]) -> FlowContent {
        let nodes = keys.iter().map(|k| FlowNode::new(*k, "http")).collect();
        let edges = keys
            .windows(2)
            .map(|pair| FlowEdge::new(pair[0], pair[1]))
            .collect();
        FlowContent {
            nodes,
            edges,
            diagram: json!({"zoom": 1}),
        }
    }

    #[tokio::test]
    async fn publishing_twice_without_edits_is_rejected() {
        let store = Arc::new(InMemoryFlowStore::new());
        let draft = draft_with(&store, content(&["a", "b"])).await;
        let publisher = SnapshotPublisher::new(store.clone());

        let plan = publisher
            .publish(draft.id, Some("v1".into()), UserId::new())
            .await
            .expect("first publish");
        assert_eq!(plan.published.version, 1);
        assert_eq!(plan.next_draft.version, 2);

        let err = publisher
            .publish(draft.id, None, UserId::new())
            .await
            .expect_err("second publish");
        assert_eq!(err.kind(), FlowErrorKind::PublishConflict);
    }

    #[tokio::test]
    async fn earlier_snapshot_is_byte_identical_after_later_publish() {
        let store = Arc::new(InMemoryFlowStore::new());
        let draft = draft_with(&store, content(&["a", "b"])).await;
        let publisher = SnapshotPublisher::new(store.clone());
        let operator = UserId::new();

        let first = publisher
            .publish(draft.id, None, operator)
            .await
            .expect("publish v1");
        let before = store
            .get_snapshot(first.snapshot.id)
            .await
            .expect("get")
            .expect("snapshot v1");

        let edited = first
            .next_draft
            .with_structure(content(&["a", "b", "c"]), operator);
        store.update_draft(&edited).await.expect("edit v2");
        let second = publisher
            .publish(edited.id, None, operator)
            .await
            .expect("publish v2");
        assert!(second.published.version > first.published.version);

        let after = store
            .get_snapshot(first.snapshot.id)
            .await
            .expect("get")
            .expect("snapshot v1");
        assert_eq!(before.content_bytes, after.content_bytes);
        assert_eq!(
            serde_json::to_vec(&after.content).expect("encode"),
            after.content_bytes
        );
        assert_eq!(after.content.nodes.len(), 2);
    }

    #[tokio::test]
    async fn empty_or_invalid_drafts_are_not_published() {
        let store = Arc::new(InMemoryFlowStore::new());
        let publisher = SnapshotPublisher::new(store.clone());

        let empty = draft_with(&store, FlowContent::default()).await;
        let err = publisher
            .publish(empty.id, None, UserId::new())
            .await
            .expect_err("empty");
        assert_eq!(err.kind(), FlowErrorKind::Validation);

        let err = publisher
            .publish(DefinitionId::new(), None, UserId::new())
            .await
            .expect_err("missing");
        assert_eq!(err.kind(), FlowErrorKind::NotFound);
    }

    #[tokio::test]
    async fn concurrent_publishes_have_one_winner() {
        let store = Arc::new(InMemoryFlowStore::new());
        let draft = draft_with(&store, content(&["a"])).await;
        let publisher = Arc::new(SnapshotPublisher::new(store.clone()));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let publisher = publisher.clone();
                tokio::spawn(async move { publisher.publish(draft.id, None, UserId::new()).await })
            })
            .collect();

        let mut wins = 0;
        for handle in handles {
            match handle.await.expect("join") {
                Ok(_) => wins += 1,
                Err(e) => assert_eq!(e.kind(), FlowErrorKind::PublishConflict),
            }
        }
        assert_eq!(wins, 1);
    }
}
