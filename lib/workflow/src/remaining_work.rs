//! Remaining work graph for run execution.
//!
//! Execution walks a shrinking copy of the flow graph:
//! - Start with every node; entry nodes are READY, the rest PENDING
//! - Remove a node once it reaches a terminal state
//! - A PENDING node with no incoming edges left has every predecessor
//!   terminal and is resolved: READY if at least one inbound edge is live
//!   (its source SUCCEEDED and its condition holds), SKIPPED otherwise
//! - SKIPPED nodes are removed at once, which resolves their successors in turn
//! - The run is complete when every node is terminal
//!
//! The graph is owned by the single coordinator task of a run, so all
//! readiness updates are serialized.

use crate::context::RunContext;
use crate::execution::NodeRunState;
use crate::graph::FlowGraph;
use petgraph::Direction;
use petgraph::graph::NodeIndex;
use petgraph::stable_graph::StableDiGraph;
use serde_json::Value as JsonValue;
use std::cell::OnceCell;
use std::collections::VecDeque;

/// Tracks which nodes of a run still need to execute.
#[derive(Debug, Clone)]
pub struct RemainingWorkGraph {
    /// Node weights are slots; a stable graph keeps `NodeIndex == slot` across removals.
    graph: StableDiGraph<usize, ()>,
    states: Vec<NodeRunState>,
}

impl RemainingWorkGraph {
    /// Creates the remaining work graph of a flow.
    #[must_use]
    pub fn from_flow(flow: &FlowGraph) -> Self {
        let mut graph = StableDiGraph::with_capacity(flow.node_count(), flow.edge_count());
        for (slot, _) in flow.nodes() {
            graph.add_node(slot);
        }
        for (slot, _) in flow.nodes() {
            for successor in flow.successors(slot) {
                graph.add_edge(NodeIndex::new(slot), NodeIndex::new(successor), ());
            }
        }

        let mut states = vec![NodeRunState::Pending; flow.node_count()];
        for slot in flow.entry_slots() {
            states[slot] = NodeRunState::Ready;
        }

        Self { graph, states }
    }

    /// Returns the state of a node.
    #[must_use]
    pub fn state(&self, slot: usize) -> NodeRunState {
        self.states[slot]
    }

    /// Returns the states of all nodes, indexed by slot.
    #[must_use]
    pub fn states(&self) -> &[NodeRunState] {
        &self.states
    }

    /// Returns READY nodes in slot order.
    #[must_use]
    pub fn ready_nodes(&self) -> Vec<usize> {
        self.slots_in(NodeRunState::Ready)
    }

    /// Returns every node in the given state.
    #[must_use]
    pub fn slots_in(&self, state: NodeRunState) -> Vec<usize> {
        self.states
            .iter()
            .enumerate()
            .filter(|(_, s)| **s == state)
            .map(|(slot, _)| slot)
            .collect()
    }

    /// Returns the number of RUNNING or RETRYING nodes.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.states.iter().filter(|s| s.is_active()).count()
    }

    /// Returns the number of nodes not yet terminal.
    #[must_use]
    pub fn remaining_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Returns true once every node is terminal.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.states.iter().all(NodeRunState::is_terminal)
    }

    /// Marks a READY or RETRYING node as running.
    ///
    /// Returns false, changing nothing, if the transition is not allowed.
    pub fn mark_running(&mut self, slot: usize) -> bool {
        self.transition(slot, NodeRunState::Running)
    }

    /// Marks a running node as waiting to retry.
    pub fn mark_retrying(&mut self, slot: usize) -> bool {
        self.transition(slot, NodeRunState::Retrying)
    }

    /// Marks a node as succeeded and resolves its successors.
    ///
    /// Returns the nodes skipped as a consequence.
    pub fn mark_succeeded(&mut self, slot: usize, flow: &FlowGraph, ctx: &RunContext) -> Vec<usize> {
        self.settle(slot, NodeRunState::Succeeded, flow, ctx)
    }

    /// Marks a node as failed and resolves its successors.
    ///
    /// Its outgoing edges are dead: successors without another live edge are
    /// skipped. Returns the nodes skipped as a consequence.
    pub fn mark_failed(&mut self, slot: usize, flow: &FlowGraph, ctx: &RunContext) -> Vec<usize> {
        self.settle(slot, NodeRunState::Failed, flow, ctx)
    }

    /// Skips every node that was never dispatched.
    ///
    /// Used when a run stops early. Returns the skipped nodes.
    pub fn skip_remaining(&mut self) -> Vec<usize> {
        let mut skipped = Vec::new();
        for slot in 0..self.states.len() {
            if self.transition(slot, NodeRunState::Skipped) {
                self.graph.remove_node(NodeIndex::new(slot));
                skipped.push(slot);
            }
        }
        skipped
    }

    fn transition(&mut self, slot: usize, next: NodeRunState) -> bool {
        match self.states.get(slot) {
            Some(current) if current.can_transition_to(next) => {
                self.states[slot] = next;
                true
            }
            _ => false,
        }
    }

    fn settle(
        &mut self,
        slot: usize,
        outcome: NodeRunState,
        flow: &FlowGraph,
        ctx: &RunContext,
    ) -> Vec<usize> {
        if !self.transition(slot, outcome) {
            return Vec::new();
        }

        let mut queue: VecDeque<usize> = self.detach(slot).into();
        let view: OnceCell<JsonValue> = OnceCell::new();
        let mut skipped = Vec::new();

        while let Some(candidate) = queue.pop_front() {
            let index = NodeIndex::new(candidate);
            let unresolved = self
                .graph
                .neighbors_directed(index, Direction::Incoming)
                .next()
                .is_some();
            if self.states[candidate] != NodeRunState::Pending || unresolved {
                continue;
            }

            let live = flow.incoming(candidate).iter().any(|(source, edge)| {
                self.states[*source] == NodeRunState::Succeeded
                    && edge
                        .condition
                        .as_ref()
                        .is_none_or(|c| c.evaluate(view.get_or_init(|| ctx.view())))
            });

            if live {
                self.states[candidate] = NodeRunState::Ready;
            } else {
                self.states[candidate] = NodeRunState::Skipped;
                skipped.push(candidate);
                queue.extend(self.detach(candidate));
            }
        }

        skipped
    }

    /// Removes a node and returns its successors.
    fn detach(&mut self, slot: usize) -> Vec<usize> {
        let index = NodeIndex::new(slot);
        let successors = self
            .graph
            .neighbors_directed(index, Direction::Outgoing)
            .map(NodeIndex::index)
            .collect();
        self.graph.remove_node(index);
        successors
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::edge::FlowEdge;
    use crate::node::FlowNode;
    use serde_json::json;

    fn flow(keys: &[&str], edges: Vec<FlowEdge>) -> FlowGraph {
        let nodes: Vec<FlowNode> = keys.iter().map(|k| FlowNode::new(*k, "http")).collect();
        FlowGraph::build(&nodes, &edges).expect("graph")
    }

    fn succeed(
        work: &mut RemainingWorkGraph,
        slot: usize,
        graph: &FlowGraph,
        ctx: &RunContext,
    ) -> Vec<usize> {
        assert!(work.mark_running(slot));
        work.mark_succeeded(slot, graph, ctx)
    }

    #[test]
    fn empty_flow_is_immediately_complete() {
        let graph = flow(&[], Vec::new());
        let work = RemainingWorkGraph::from_flow(&graph);
        assert!(work.is_complete());
        assert_eq!(work.remaining_count(), 0);
    }

    #[test]
    fn linear_flow_execution() {
        let graph = flow(
            &["a", "b", "c"],
            vec![FlowEdge::new("a", "b"), FlowEdge::new("b", "c")],
        );
        let ctx = RunContext::new(&graph, json!({}));
        let mut work = RemainingWorkGraph::from_flow(&graph);

        assert_eq!(work.ready_nodes(), vec![0]);
        assert_eq!(work.state(1), NodeRunState::Pending);

        succeed(&mut work, 0, &graph, &ctx);
        assert_eq!(work.ready_nodes(), vec![1]);
        succeed(&mut work, 1, &graph, &ctx);
        assert_eq!(work.ready_nodes(), vec![2]);
        succeed(&mut work, 2, &graph, &ctx);

        assert!(work.is_complete());
        assert_eq!(work.remaining_count(), 0);
    }

    #[test]
    fn join_waits_for_all_predecessors() {
        // a -> b -> d, a -> c -> d
        let graph = flow(
            &["a", "b", "c", "d"],
            vec![
                FlowEdge::new("a", "b"),
                FlowEdge::new("a", "c"),
                FlowEdge::new("b", "d"),
                FlowEdge::new("c", "d"),
            ],
        );
        let ctx = RunContext::new(&graph, json!({}));
        let mut work = RemainingWorkGraph::from_flow(&graph);

        succeed(&mut work, 0, &graph, &ctx);
        assert_eq!(work.ready_nodes(), vec![1, 2]);

        succeed(&mut work, 1, &graph, &ctx);
        assert_eq!(work.state(3), NodeRunState::Pending);

        succeed(&mut work, 2, &graph, &ctx);
        assert_eq!(work.ready_nodes(), vec![3]);
    }

    #[test]
    fn false_condition_skips_transitively() {
        // a -> b -[input.go]-> c -> d
        let graph = flow(
            &["a", "b", "c", "d"],
            vec![
                FlowEdge::new("a", "b"),
                FlowEdge::conditional("b", "c", "input.go == true"),
                FlowEdge::new("c", "d"),
            ],
        );
        let ctx = RunContext::new(&graph, json!({"go": false}));
        let mut work = RemainingWorkGraph::from_flow(&graph);

        succeed(&mut work, 0, &graph, &ctx);
        let skipped = succeed(&mut work, 1, &graph, &ctx);

        assert_eq!(skipped, vec![2, 3]);
        assert_eq!(work.state(2), NodeRunState::Skipped);
        assert_eq!(work.state(3), NodeRunState::Skipped);
        assert!(work.is_complete());
    }

    #[test]
    fn conditions_see_upstream_outputs() {
        let graph = flow(
            &["a", "b"],
            vec![FlowEdge::conditional("a", "b", "nodes.a.count > 2")],
        );
        let ctx = RunContext::new(&graph, json!({}));
        let mut work = RemainingWorkGraph::from_flow(&graph);

        work.mark_running(0);
        ctx.set_output(0, json!({"count": 3})).expect("write");
        work.mark_succeeded(0, &graph, &ctx);
        assert_eq!(work.ready_nodes(), vec![1]);
    }

    #[test]
    fn failure_kills_outgoing_edges_only() {
        // a -> c, b -> c, b -> d
        let graph = flow(
            &["a", "b", "c", "d"],
            vec![
                FlowEdge::new("a", "c"),
                FlowEdge::new("b", "c"),
                FlowEdge::new("b", "d"),
            ],
        );
        let ctx = RunContext::new(&graph, json!({}));
        let mut work = RemainingWorkGraph::from_flow(&graph);

        work.mark_running(1);
        let skipped = work.mark_failed(1, &graph, &ctx);
        assert_eq!(skipped, vec![3]);
        assert_eq!(work.state(2), NodeRunState::Pending);

        succeed(&mut work, 0, &graph, &ctx);
        assert_eq!(work.ready_nodes(), vec![2]);
    }

    #[test]
    fn retrying_and_invalid_transitions() {
        let graph = flow(&["a", "b"], vec![FlowEdge::new("a", "b")]);
        let ctx = RunContext::new(&graph, json!({}));
        let mut work = RemainingWorkGraph::from_flow(&graph);

        assert!(!work.mark_running(1), "pending node cannot run");
        assert!(work.mark_running(0));
        assert_eq!(work.active_count(), 1);
        assert!(work.mark_retrying(0));
        assert_eq!(work.state(0), NodeRunState::Retrying);
        assert!(work.mark_running(0));
        work.mark_succeeded(0, &graph, &ctx);
        assert!(work.mark_succeeded(0, &graph, &ctx).is_empty());
        assert_eq!(work.state(0), NodeRunState::Succeeded);
    }

    #[test]
    fn skip_remaining_leaves_active_nodes_alone() {
        let graph = flow(
            &["a", "b", "c"],
            vec![FlowEdge::new("a", "c"), FlowEdge::new("b", "c")],
        );
        let mut work = RemainingWorkGraph::from_flow(&graph);
        work.mark_running(0);

        assert_eq!(work.skip_remaining(), vec![1, 2]);
        assert_eq!(work.state(0), NodeRunState::Running);
        assert!(!work.is_complete());
    }
}
