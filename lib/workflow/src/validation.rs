//! Structure validation for flow definitions.
//!
//! Validation never stops at the first problem: every violation found in a
//! node/edge set is collected and returned together, so a caller can fix a
//! draft in one round trip. Nothing is applied when any violation exists.

use crate::condition::Condition;
use crate::edge::FlowEdge;
use crate::error::FlowError;
use crate::node::{FlowNode, NodeKey};
use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Bfs;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;

/// Stable code identifying the kind of a violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ViolationCode {
    InvalidNodeKey,
    DuplicateNodeKey,
    EmptyTypeCode,
    UnknownSourceNode,
    UnknownTargetNode,
    SelfLoop,
    DuplicateEdge,
    InvalidCondition,
    InvalidRetryPolicy,
    CycleDetected,
    UnreachableNode,
    EmptyFlow,
    EmptyName,
}

impl ViolationCode {
    /// Returns the wire name of this code.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidNodeKey => "INVALID_NODE_KEY",
            Self::DuplicateNodeKey => "DUPLICATE_NODE_KEY",
            Self::EmptyTypeCode => "EMPTY_TYPE_CODE",
            Self::UnknownSourceNode => "UNKNOWN_SOURCE_NODE",
            Self::UnknownTargetNode => "UNKNOWN_TARGET_NODE",
            Self::SelfLoop => "SELF_LOOP",
            Self::DuplicateEdge => "DUPLICATE_EDGE",
            Self::InvalidCondition => "INVALID_CONDITION",
            Self::InvalidRetryPolicy => "INVALID_RETRY_POLICY",
            Self::CycleDetected => "CYCLE_DETECTED",
            Self::UnreachableNode => "UNREACHABLE_NODE",
            Self::EmptyFlow => "EMPTY_FLOW",
            Self::EmptyName => "EMPTY_NAME",
        }
    }
}

impl fmt::Display for ViolationCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single structural problem, pointing at the offending node or edge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Violation {
    pub code: ViolationCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_key: Option<NodeKey>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_key: Option<NodeKey>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_key: Option<NodeKey>,
}

impl Violation {
    /// A violation about a node.
    #[must_use]
    pub fn node(code: ViolationCode, node_key: &NodeKey, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            node_key: Some(node_key.clone()),
            source_key: None,
            target_key: None,
        }
    }

    /// A violation about an edge.
    #[must_use]
    pub fn edge(
        code: ViolationCode,
        source_key: &NodeKey,
        target_key: &NodeKey,
        message: impl Into<String>,
    ) -> Self {
        Self {
            code,
            message: message.into(),
            node_key: None,
            source_key: Some(source_key.clone()),
            target_key: Some(target_key.clone()),
        }
    }

    /// A violation about the flow as a whole.
    #[must_use]
    pub fn flow(code: ViolationCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            node_key: None,
            source_key: None,
            target_key: None,
        }
    }

    /// Returns the offending node key or `source -> target` edge label.
    #[must_use]
    pub fn subject(&self) -> Option<String> {
        if let Some(key) = &self.node_key {
            return Some(key.to_string());
        }
        match (&self.source_key, &self.target_key) {
            (Some(source), Some(target)) => Some(format!("{source} -> {target}")),
            _ => None,
        }
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.subject() {
            Some(subject) => write!(f, "{} [{subject}]: {}", self.code, self.message),
            None => write!(f, "{}: {}", self.code, self.message),
        }
    }
}

/// The full list of violations found in a structure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub violations: Vec<Violation>,
}

impl ValidationError {
    /// Returns true if any violation carries the given code.
    #[must_use]
    pub fn has(&self, code: ViolationCode) -> bool {
        self.violations.iter().any(|v| v.code == code)
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} structure violation(s)", self.violations.len())
    }
}

impl std::error::Error for ValidationError {}

impl From<ValidationError> for FlowError {
    fn from(e: ValidationError) -> Self {
        Self::Validation {
            violations: e.violations,
        }
    }
}

/// Validates a draft structure.
///
/// Checks node keys, type codes, retry policies, edge endpoints, duplicate
/// edges, condition syntax, acyclicity and reachability from entry nodes.
///
/// # Errors
///
/// Returns every violation found.
pub fn validate_structure(nodes: &[FlowNode], edges: &[FlowEdge]) -> Result<(), ValidationError> {
    let violations = collect_violations(nodes, edges);
    if violations.is_empty() {
        Ok(())
    } else {
        Err(ValidationError { violations })
    }
}

/// Validates a structure about to be published; an empty flow is rejected.
///
/// # Errors
///
/// Returns every violation found.
pub fn validate_for_publish(
    nodes: &[FlowNode],
    edges: &[FlowEdge],
) -> Result<(), ValidationError> {
    let mut violations = collect_violations(nodes, edges);
    if nodes.is_empty() {
        violations.push(Violation::flow(
            ViolationCode::EmptyFlow,
            "a flow must contain at least one node to be published",
        ));
    }
    if violations.is_empty() {
        Ok(())
    } else {
        Err(ValidationError { violations })
    }
}

fn collect_violations(nodes: &[FlowNode], edges: &[FlowEdge]) -> Vec<Violation> {
    let mut violations = Vec::new();
    let mut graph: DiGraph<&NodeKey, ()> = DiGraph::new();
    let mut index: HashMap<&NodeKey, NodeIndex> = HashMap::new();

    for node in nodes {
        let key = &node.node_key;
        if !key.is_well_formed() {
            violations.push(Violation::node(
                ViolationCode::InvalidNodeKey,
                key,
                "node key must match ^[A-Za-z][A-Za-z0-9_]*$",
            ));
        }
        if node.type_code.trim().is_empty() {
            violations.push(Violation::node(
                ViolationCode::EmptyTypeCode,
                key,
                "node type code must not be empty",
            ));
        }
        if let Some(policy) = &node.retry_policy
            && !policy.is_valid()
        {
            violations.push(Violation::node(
                ViolationCode::InvalidRetryPolicy,
                key,
                format!("max attempts {} is out of range", policy.max_attempts),
            ));
        }
        if index.contains_key(key) {
            violations.push(Violation::node(
                ViolationCode::DuplicateNodeKey,
                key,
                "node key is used more than once",
            ));
            continue;
        }
        index.insert(key, graph.add_node(key));
    }

    let mut seen_edges: HashSet<(&NodeKey, &NodeKey)> = HashSet::new();
    for edge in edges {
        let (source, target) = (&edge.source_key, &edge.target_key);
        let source_idx = index.get(source);
        let target_idx = index.get(target);

        if source_idx.is_none() {
            violations.push(Violation::edge(
                ViolationCode::UnknownSourceNode,
                source,
                target,
                format!("source node '{source}' does not exist"),
            ));
        }
        if target_idx.is_none() {
            violations.push(Violation::edge(
                ViolationCode::UnknownTargetNode,
                source,
                target,
                format!("target node '{target}' does not exist"),
            ));
        }
        if source == target {
            violations.push(Violation::edge(
                ViolationCode::SelfLoop,
                source,
                target,
                "edge source and target are the same node",
            ));
            continue;
        }
        if let Some(expr) = edge.condition_expr()
            && let Err(e) = Condition::parse(expr)
        {
            violations.push(Violation::edge(
                ViolationCode::InvalidCondition,
                source,
                target,
                e.to_string(),
            ));
        }
        if !seen_edges.insert((source, target)) {
            violations.push(Violation::edge(
                ViolationCode::DuplicateEdge,
                source,
                target,
                "edge is declared more than once",
            ));
            continue;
        }
        if let (Some(&s), Some(&t)) = (source_idx, target_idx) {
            graph.add_edge(s, t, ());
        }
    }

    let mut in_cycle: HashSet<NodeIndex> = HashSet::new();
    for component in petgraph::algo::tarjan_scc(&graph) {
        if component.len() < 2 {
            continue;
        }
        in_cycle.extend(component.iter().copied());
        let mut keys: Vec<&NodeKey> = component.iter().map(|&i| graph[i]).collect();
        keys.sort();
        let members = keys
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ");
        violations.push(Violation::node(
            ViolationCode::CycleDetected,
            keys[0],
            format!("nodes form a cycle: {members}"),
        ));
    }

    let mut reachable: HashSet<NodeIndex> = HashSet::new();
    for entry in graph.externals(Direction::Incoming) {
        let mut bfs = Bfs::new(&graph, entry);
        while let Some(idx) = bfs.next(&graph) {
            reachable.insert(idx);
        }
    }
    for idx in graph.node_indices() {
        if !reachable.contains(&idx) {
            violations.push(Violation::node(
                ViolationCode::UnreachableNode,
                graph[idx],
                "node is not reachable from any entry node",
            ));
        }
    }

    violations
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{BackoffStrategy, RetryPolicy};

    fn nodes(keys: &[&str]) -> Vec<FlowNode> {
        keys.iter().map(|k| FlowNode::new(*k, "http")).collect()
    }

    fn codes(result: Result<(), ValidationError>) -> Vec<ViolationCode> {
        result
            .expect_err("expected violations")
            .violations
            .into_iter()
            .map(|v| v.code)
            .collect()
    }

    #[test]
    fn valid_dag_passes() {
        let edges = vec![
            FlowEdge::new("a", "b"),
            FlowEdge::new("a", "c"),
            FlowEdge::conditional("b", "d", "nodes.b.ok == true"),
            FlowEdge::new("c", "d"),
        ];
        assert!(validate_structure(&nodes(&["a", "b", "c", "d"]), &edges).is_ok());
    }

    #[test]
    fn self_loop_has_specific_code() {
        let codes = codes(validate_structure(
            &nodes(&["a"]),
            &[FlowEdge::new("a", "a")],
        ));
        assert_eq!(codes, vec![ViolationCode::SelfLoop]);
    }

    #[test]
    fn malformed_key_rejected_and_well_formed_accepted() {
        let codes = codes(validate_structure(&nodes(&["1abc"]), &[]));
        assert_eq!(codes, vec![ViolationCode::InvalidNodeKey]);
        assert!(validate_structure(&nodes(&["abc_1"]), &[]).is_ok());
    }

    #[test]
    fn all_violations_are_reported_together() {
        let mut flow = nodes(&["a", "a", "b"]);
        flow.push(FlowNode::new("c", " "));
        flow.push(FlowNode::new("d", "http").with_retry(RetryPolicy::new(
            0,
            BackoffStrategy::None,
        )));
        let edges = vec![
            FlowEdge::new("a", "zz"),
            FlowEdge::new("yy", "b"),
            FlowEdge::new("a", "b"),
            FlowEdge::new("a", "b"),
            FlowEdge::conditional("b", "c", "input.x =="),
        ];
        let codes = codes(validate_structure(&flow, &edges));
        for expected in [
            ViolationCode::DuplicateNodeKey,
            ViolationCode::EmptyTypeCode,
            ViolationCode::InvalidRetryPolicy,
            ViolationCode::UnknownTargetNode,
            ViolationCode::UnknownSourceNode,
            ViolationCode::DuplicateEdge,
            ViolationCode::InvalidCondition,
        ] {
            assert!(codes.contains(&expected), "missing {expected}");
        }
    }

    #[test]
    fn deeply_nested_condition_is_invalid() {
        let expr = format!("{}true{}", "(".repeat(20_000), ")".repeat(20_000));
        let edges = vec![FlowEdge::conditional("a", "b", expr)];
        let codes = codes(validate_structure(&nodes(&["a", "b"]), &edges));
        assert_eq!(codes, vec![ViolationCode::InvalidCondition]);
    }

    #[test]
    fn cycle_is_detected() {
        let edges = vec![
            FlowEdge::new("a", "b"),
            FlowEdge::new("b", "c"),
            FlowEdge::new("c", "b"),
        ];
        let err = validate_structure(&nodes(&["a", "b", "c"]), &edges).expect_err("cycle");
        assert!(err.has(ViolationCode::CycleDetected));
        assert!(!err.has(ViolationCode::UnreachableNode));
    }

    #[test]
    fn isolated_cycle_is_also_unreachable() {
        let edges = vec![FlowEdge::new("x", "y"), FlowEdge::new("y", "x")];
        let err = validate_structure(&nodes(&["a", "x", "y"]), &edges).expect_err("cycle");
        assert!(err.has(ViolationCode::CycleDetected));
        assert!(err.has(ViolationCode::UnreachableNode));
    }

    #[test]
    fn empty_flow_rejected_only_at_publish() {
        assert!(validate_structure(&[], &[]).is_ok());
        let codes = codes(validate_for_publish(&[], &[]));
        assert_eq!(codes, vec![ViolationCode::EmptyFlow]);
    }

    #[test]
    fn violation_wire_format() {
        let v = Violation::edge(
            ViolationCode::SelfLoop,
            &NodeKey::new("a"),
            &NodeKey::new("a"),
            "loop",
        );
        let json = serde_json::to_value(&v).expect("serialize");
        assert_eq!(json["code"], "SELF_LOOP");
        assert_eq!(json["sourceKey"], "a");
        assert!(json.get("nodeKey").is_none());
    }
}
