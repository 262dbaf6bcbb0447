//! Edge types for flow graphs.
//!
//! An edge is a dependency from a source node to a target node, optionally
//! gated by a condition expression evaluated against the run context once
//! the source node has succeeded.

use crate::node::NodeKey;
use serde::{Deserialize, Serialize};

/// A directed edge between two nodes of a flow definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowEdge {
    /// Key of the upstream node.
    pub source_key: NodeKey,
    /// Key of the downstream node.
    pub target_key: NodeKey,
    /// Condition expression; the edge is always live when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
}

impl FlowEdge {
    /// Creates an unconditional edge.
    #[must_use]
    pub fn new(source_key: impl Into<NodeKey>, target_key: impl Into<NodeKey>) -> Self {
        Self {
            source_key: source_key.into(),
            target_key: target_key.into(),
            condition: None,
        }
    }

    /// Creates an edge gated by a condition.
    #[must_use]
    pub fn conditional(
        source_key: impl Into<NodeKey>,
        target_key: impl Into<NodeKey>,
        condition: impl Into<String>,
    ) -> Self {
        Self {
            source_key: source_key.into(),
            target_key: target_key.into(),
            condition: Some(condition.into()),
        }
    }

    /// Returns the condition, ignoring blank expressions.
    #[must_use]
    pub fn condition_expr(&self) -> Option<&str> {
        self.condition
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty())
    }
}

impl std::fmt::Display for FlowEdge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} -> {}", self.source_key, self.target_key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_condition_is_unconditional() {
        let edge = FlowEdge::conditional("a", "b", "   ");
        assert_eq!(edge.condition_expr(), None);
        let edge = FlowEdge::conditional("a", "b", " input.ok ");
        assert_eq!(edge.condition_expr(), Some("input.ok"));
    }

    #[test]
    fn edge_display() {
        assert_eq!(FlowEdge::new("a", "b").to_string(), "a -> b");
    }

    #[test]
    fn edge_wire_format_is_camel_case() {
        let json = serde_json::to_value(FlowEdge::new("a", "b")).expect("serialize");
        assert_eq!(json["sourceKey"], "a");
        assert_eq!(json["targetKey"], "b");
        assert!(json.get("condition").is_none());
    }
}
