//! Flow engine for the flowdeck platform.
//!
//! This crate provides the flow definition pipeline and the run engine:
//!
//! - **Structure**: Nodes, edges and a small condition language, validated
//!   into a petgraph DAG
//! - **Versioning**: Drafts, published versions and immutable snapshots
//! - **Scheduling**: A per-run coordinator dispatching ready nodes with
//!   bounded concurrency, deadlines and cancellation
//! - **Tools**: Tool invocation with timeouts, retries and streaming
//! - **Run log**: An append-only, ordered record of every attempt

pub mod condition;
pub mod config;
pub mod context;
pub mod definition;
pub mod edge;
pub mod error;
pub mod execution;
pub mod graph;
pub mod node;
pub mod remaining_work;
pub mod run_log;
pub mod scheduler;
pub mod service;
pub mod snapshot;
pub mod store;
pub mod tool;
pub mod validation;

#[cfg(test)]
pub(crate) mod testing;

pub use condition::{Condition, ConditionError};
pub use config::EngineConfig;
pub use context::{RequestContext, RunContext};
pub use definition::{DefinitionStatus, FlowContent, FlowDefinition, FlowProject, VersionSummary};
pub use edge::FlowEdge;
pub use error::{ErrorDetail, FlowError, FlowErrorKind, GraphError, StoreError, ToolError};
pub use execution::{FlowRun, NodeResult, NodeRunState, RunStatus};
pub use graph::FlowGraph;
pub use node::{BackoffStrategy, FlowNode, NodeKey, RetryPolicy};
pub use run_log::{InMemoryRunLog, LogStatus, RunLogEntry, RunLogRecorder};
pub use scheduler::{RunOutcome, RunScheduler};
pub use service::{
    CreateFlowDefinition, CreateProject, ExecuteFlow, FlowService, InMemoryUserDirectory,
    RunTarget, UserDirectory,
};
pub use snapshot::{FlowSnapshot, PublishPlan, SnapshotPublisher};
pub use store::{FlowStore, InMemoryFlowStore, InMemoryRunStore, RunStore};
pub use tool::{HttpToolService, ToolChunk, ToolExecutionService, ToolRequest};
pub use validation::{ValidationError, Violation, ViolationCode, validate_structure};
