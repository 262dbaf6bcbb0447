//! Runnable flow graph built on petgraph.
//!
//! A `FlowGraph` is built from a validated node/edge set, typically the
//! frozen content of a snapshot. Every node gets a stable slot (its petgraph
//! index) that the run context and the remaining work graph index into.
//! Edge conditions are parsed once at build time.

use crate::condition::Condition;
use crate::edge::FlowEdge;
use crate::error::GraphError;
use crate::node::{FlowNode, NodeKey};
use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use std::collections::HashMap;

/// Edge weight: the parsed condition gating the edge, if any.
#[derive(Debug, Clone)]
pub struct GraphEdge {
    pub condition: Option<Condition>,
}

impl GraphEdge {
    /// Returns true if the edge carries a condition.
    #[must_use]
    pub fn is_conditional(&self) -> bool {
        self.condition.is_some()
    }
}

/// A flow graph ready for scheduling.
#[derive(Debug, Clone)]
pub struct FlowGraph {
    graph: DiGraph<FlowNode, GraphEdge>,
    node_index_map: HashMap<NodeKey, NodeIndex>,
}

impl FlowGraph {
    /// Builds a graph from nodes and edges.
    ///
    /// # Errors
    ///
    /// Returns an error on duplicate keys, dangling edges, unparsable
    /// conditions or cycles. Structures that passed validation never fail.
    pub fn build(nodes: &[FlowNode], edges: &[FlowEdge]) -> Result<Self, GraphError> {
        let mut graph = DiGraph::with_capacity(nodes.len(), edges.len());
        let mut node_index_map = HashMap::with_capacity(nodes.len());

        for node in nodes {
            if node_index_map.contains_key(&node.node_key) {
                return Err(GraphError::DuplicateNode {
                    node_key: node.node_key.clone(),
                });
            }
            let index = graph.add_node(node.clone());
            node_index_map.insert(node.node_key.clone(), index);
        }

        for edge in edges {
            let source = *node_index_map
                .get(&edge.source_key)
                .ok_or_else(|| GraphError::NodeNotFound {
                    node_key: edge.source_key.clone(),
                })?;
            let target = *node_index_map
                .get(&edge.target_key)
                .ok_or_else(|| GraphError::NodeNotFound {
                    node_key: edge.target_key.clone(),
                })?;
            let condition = edge
                .condition_expr()
                .map(Condition::parse)
                .transpose()
                .map_err(|e| GraphError::InvalidCondition {
                    source_key: edge.source_key.clone(),
                    target_key: edge.target_key.clone(),
                    message: e.to_string(),
                })?;
            graph.add_edge(source, target, GraphEdge { condition });
        }

        if petgraph::algo::is_cyclic_directed(&graph) {
            return Err(GraphError::CycleDetected);
        }

        Ok(Self {
            graph,
            node_index_map,
        })
    }

    /// Returns the number of nodes.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Returns the number of edges.
    #[must_use]
    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// Returns the node in the given slot.
    ///
    /// # Panics
    ///
    /// Panics if the slot is out of range.
    #[must_use]
    pub fn node(&self, slot: usize) -> &FlowNode {
        &self.graph[NodeIndex::new(slot)]
    }

    /// Returns the slot of a node key.
    #[must_use]
    pub fn slot_of(&self, key: &NodeKey) -> Option<usize> {
        self.node_index_map.get(key).map(|idx| idx.index())
    }

    /// Returns all nodes with their slots, in definition order.
    pub fn nodes(&self) -> impl Iterator<Item = (usize, &FlowNode)> {
        self.graph
            .node_indices()
            .map(|idx| (idx.index(), &self.graph[idx]))
    }

    /// Returns slots of nodes with no incoming edges.
    #[must_use]
    pub fn entry_slots(&self) -> Vec<usize> {
        self.graph
            .externals(Direction::Incoming)
            .map(NodeIndex::index)
            .collect()
    }

    /// Returns slots of nodes with no outgoing edges.
    #[must_use]
    pub fn sink_slots(&self) -> Vec<usize> {
        self.graph
            .externals(Direction::Outgoing)
            .map(NodeIndex::index)
            .collect()
    }

    /// Returns the slots of the downstream nodes of a slot.
    #[must_use]
    pub fn successors(&self, slot: usize) -> Vec<usize> {
        let mut successors: Vec<usize> = self
            .graph
            .neighbors_directed(NodeIndex::new(slot), Direction::Outgoing)
            .map(NodeIndex::index)
            .collect();
        successors.sort_unstable();
        successors
    }

    /// Returns the inbound edges of a slot as `(source slot, edge)` pairs.
    #[must_use]
    pub fn incoming(&self, slot: usize) -> Vec<(usize, &GraphEdge)> {
        self.graph
            .edges_directed(NodeIndex::new(slot), Direction::Incoming)
            .map(|edge| (edge.source().index(), edge.weight()))
            .collect()
    }

    /// Returns all slots in a topological order.
    #[must_use]
    pub fn topological_order(&self) -> Vec<usize> {
        petgraph::algo::toposort(&self.graph, None)
            .map(|order| order.into_iter().map(NodeIndex::index).collect())
            .unwrap_or_default()
    }
}
