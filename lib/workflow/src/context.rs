//! Request and run contexts.
//!
//! `RequestContext` carries who is acting and on whose behalf; it is passed
//! explicitly to every command and into every tool request.
//!
//! `RunContext` holds the run input and one write-once output slot per node.
//! A slot is written only by the task executing that node, so the arena is
//! shared across tasks without locks.

use crate::graph::FlowGraph;
use crate::node::NodeKey;
use flowdeck_core::{TenantId, ThreadId, UserId};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use std::sync::OnceLock;

/// Identity of the caller of a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestContext {
    pub tenant_id: TenantId,
    pub operator_id: UserId,
    #[serde(default)]
    pub thread_id: Option<ThreadId>,
}

impl RequestContext {
    /// Creates a context without a thread.
    #[must_use]
    pub fn new(tenant_id: TenantId, operator_id: UserId) -> Self {
        Self {
            tenant_id,
            operator_id,
            thread_id: None,
        }
    }

    /// Sets the conversation thread.
    #[must_use]
    pub fn with_thread(mut self, thread_id: ThreadId) -> Self {
        self.thread_id = Some(thread_id);
        self
    }
}

/// The data of one run: input plus write-once node outputs.
#[derive(Debug)]
pub struct RunContext {
    input: JsonValue,
    keys: Vec<NodeKey>,
    outputs: Vec<OnceLock<JsonValue>>,
}

impl RunContext {
    /// Creates a context with an empty slot per graph node.
    #[must_use]
    pub fn new(graph: &FlowGraph, input: JsonValue) -> Self {
        let keys: Vec<NodeKey> = graph.nodes().map(|(_, n)| n.node_key.clone()).collect();
        let outputs = keys.iter().map(|_| OnceLock::new()).collect();
        Self {
            input,
            keys,
            outputs,
        }
    }

    /// Returns the run input.
    #[must_use]
    pub fn input(&self) -> &JsonValue {
        &self.input
    }

    /// Writes a node's output.
    ///
    /// # Errors
    ///
    /// Returns the rejected value if the slot was already written or does not exist.
    pub fn set_output(&self, slot: usize, output: JsonValue) -> Result<(), JsonValue> {
        match self.outputs.get(slot) {
            Some(cell) => cell.set(output),
            None => Err(output),
        }
    }

    /// Returns a node's output, if written.
    #[must_use]
    pub fn output(&self, slot: usize) -> Option<&JsonValue> {
        self.outputs.get(slot)?.get()
    }

    /// Returns `{"input": ..., "nodes": {key: output}}` over every written slot.
    ///
    /// This is the view edge conditions are evaluated against.
    #[must_use]
    pub fn view(&self) -> JsonValue {
        self.view_of(0..self.keys.len())
    }

    /// Returns the context handed to a node: the input and its predecessors' outputs.
    #[must_use]
    pub fn node_context(&self, graph: &FlowGraph, slot: usize) -> JsonValue {
        self.view_of(graph.incoming(slot).into_iter().map(|(source, _)| source))
    }

    /// Returns the outputs of the given slots keyed by node key, skipping empty slots.
    #[must_use]
    pub fn outputs_of(&self, slots: impl IntoIterator<Item = usize>) -> Map<String, JsonValue> {
        slots
            .into_iter()
            .filter_map(|slot| {
                let output = self.output(slot)?;
                Some((self.keys[slot].to_string(), output.clone()))
            })
            .collect()
    }

    fn view_of(&self, slots: impl IntoIterator<Item = usize>) -> JsonValue {
        let mut view = Map::new();
        view.insert("input".to_string(), self.input.clone());
        view.insert(
            "nodes".to_string(),
            JsonValue::Object(self.outputs_of(slots)),
        );
        JsonValue::Object(view)
    }
}
