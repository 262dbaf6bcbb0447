//! Run scheduler.
//!
//! One coordinator per run:
//! - Owns the remaining work graph; all readiness decisions happen here
//! - Dispatches READY nodes to tasks, bounded by a per-run semaphore
//! - Node tasks call tools and report back over a bounded channel
//! - Watches the caller's cancellation token and the run deadline
//!
//! A node task writes its output into the run context before reporting, so
//! by the time the coordinator resolves successors every predecessor output
//! is visible.

use crate::config::EngineConfig;
use crate::context::RunContext;
use crate::error::{FlowError, ToolError};
use crate::execution::{FlowRun, NodeResult, NodeRunState, RunStatus};
use crate::graph::FlowGraph;
use crate::remaining_work::RemainingWorkGraph;
use crate::run_log::{LogEvent, LogStatus, RunLogRecorder, RunLogWriter};
use crate::tool::{AttemptObserver, ToolCall, ToolFailure, ToolInvoker, ToolOutcome, ToolRequest};
use async_trait::async_trait;
use serde_json::Value as JsonValue;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// The result of scheduling one run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunOutcome {
    pub status: RunStatus,
    /// Outputs of the sink nodes that succeeded, keyed by node key.
    pub output: JsonValue,
    pub error: Option<FlowError>,
    /// One result per node, in graph order.
    pub nodes: Vec<NodeResult>,
}

/// Progress reported by node tasks.
#[derive(Debug)]
enum NodeEvent {
    Retrying { slot: usize, attempt: u32 },
    Resumed { slot: usize, attempt: u32 },
    Finished {
        slot: usize,
        result: Result<ToolOutcome, ToolFailure>,
    },
}

/// Forwards retry progress of one node to the coordinator.
struct NodeReporter {
    slot: usize,
    events: mpsc::Sender<NodeEvent>,
}

#[async_trait]
impl AttemptObserver for NodeReporter {
    async fn retrying(&self, attempt: u32, _delay: Duration) {
        let _ = self
            .events
            .send(NodeEvent::Retrying {
                slot: self.slot,
                attempt,
            })
            .await;
    }

    async fn resumed(&self, attempt: u32) {
        let _ = self
            .events
            .send(NodeEvent::Resumed {
                slot: self.slot,
                attempt,
            })
            .await;
    }
}

/// Why a run stopped dispatching before its graph was exhausted.
#[derive(Debug)]
enum Stop {
    NodeFailed { slot: usize, error: ToolError },
    Cancelled,
    TimedOut,
}

/// Schedules flow runs over a tool invoker.
pub struct RunScheduler {
    invoker: Arc<ToolInvoker>,
    run_log: Arc<dyn RunLogRecorder>,
    config: EngineConfig,
}

impl RunScheduler {
    /// Creates a scheduler.
    pub fn new(
        invoker: Arc<ToolInvoker>,
        run_log: Arc<dyn RunLogRecorder>,
        config: EngineConfig,
    ) -> Self {
        Self {
            invoker,
            run_log,
            config,
        }
    }

    /// Returns the engine configuration.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Executes a started run to completion.
    ///
    /// Returns once every node is terminal. Cancelling `cancel` or reaching
    /// the run's deadline cancels in-flight tool calls and skips the rest.
    #[instrument(skip_all, fields(run_id = %run.id, snapshot_id = %run.snapshot_id))]
    pub async fn execute(
        &self,
        run: &FlowRun,
        graph: Arc<FlowGraph>,
        async_mode: bool,
        cancel: &CancellationToken,
    ) -> RunOutcome {
        let log = RunLogWriter::new(run.id, self.run_log.clone());
        log.record(LogEvent::run(LogStatus::Started)).await;
        info!(nodes = graph.node_count(), "Run started");

        let minutes = u64::try_from(run.timeout_minutes).unwrap_or(0);
        let deadline = Instant::now() + Duration::from_secs(minutes * 60);
        let (events, rx) = mpsc::channel(self.config.event_channel_capacity.max(1));

        let mut driver = RunDriver {
            run,
            work: RemainingWorkGraph::from_flow(&graph),
            ctx: Arc::new(RunContext::new(&graph, run.input.clone())),
            attempts: vec![0; graph.node_count()],
            errors: vec![None; graph.node_count()],
            graph,
            invoker: self.invoker.clone(),
            config: &self.config,
            permits: Arc::new(Semaphore::new(self.config.max_concurrency.max(1))),
            in_flight: cancel.child_token(),
            events,
            tasks: JoinSet::new(),
            log,
            deadline,
            async_mode,
            stop: None,
            interrupted: false,
        };
        driver.drive(cancel, rx).await;
        driver.finish().await
    }
}

/// Per-run coordinator state.
struct RunDriver<'a> {
    run: &'a FlowRun,
    graph: Arc<FlowGraph>,
    work: RemainingWorkGraph,
    ctx: Arc<RunContext>,
    attempts: Vec<u32>,
    errors: Vec<Option<String>>,
    invoker: Arc<ToolInvoker>,
    config: &'a EngineConfig,
    permits: Arc<Semaphore>,
    in_flight: CancellationToken,
    events: mpsc::Sender<NodeEvent>,
    tasks: JoinSet<()>,
    log: RunLogWriter,
    deadline: Instant,
    async_mode: bool,
    stop: Option<Stop>,
    /// Set once in-flight calls have been cancelled.
    interrupted: bool,
}

impl RunDriver<'_> {
    async fn drive(&mut self, cancel: &CancellationToken, mut rx: mpsc::Receiver<NodeEvent>) {
        let watchdog = tokio::time::sleep_until(self.deadline);
        tokio::pin!(watchdog);

        loop {
            if self.stop.is_none() && !cancel.is_cancelled() && Instant::now() < self.deadline {
                self.dispatch_ready();
            }
            let idle = self.stop.is_some() || self.work.ready_nodes().is_empty();
            if self.work.active_count() == 0 && idle {
                break;
            }

            tokio::select! {
                biased;
                () = cancel.cancelled(), if !self.interrupted => {
                    info!("Run cancelled");
                    self.halt(Stop::Cancelled);
                }
                () = &mut watchdog, if !self.interrupted => {
                    warn!(timeout_minutes = self.run.timeout_minutes, "Run timed out");
                    self.halt(Stop::TimedOut);
                }
                Some(event) = rx.recv() => {
                    if !self.interrupted && Instant::now() >= self.deadline {
                        self.halt(Stop::TimedOut);
                    }
                    self.apply(event).await;
                }
                Some(joined) = self.tasks.join_next(), if !self.tasks.is_empty() => {
                    if let Err(e) = joined {
                        error!(error = %e, "Node task aborted");
                    }
                    if self.tasks.is_empty() {
                        self.reap_orphans(&mut rx).await;
                    }
                }
            }
        }

        while self.tasks.join_next().await.is_some() {}
    }

    /// Stops dispatching. Cancellation and timeout also abort in-flight
    /// calls; a required node failure lets them drain. The first stop decides
    /// the run status.
    fn halt(&mut self, stop: Stop) {
        if !matches!(stop, Stop::NodeFailed { .. }) {
            self.interrupted = true;
            self.in_flight.cancel();
        }
        if self.stop.is_none() {
            self.stop = Some(stop);
        }
    }

    fn dispatch_ready(&mut self) {
        for slot in self.work.ready_nodes() {
            let Ok(permit) = self.permits.clone().try_acquire_owned() else {
                break;
            };
            if !self.work.mark_running(slot) {
                continue;
            }

            let node = self.graph.node(slot);
            let timeout = self.config.effective_tool_timeout(node.timeout_seconds);
            let retry_policy = node.effective_retry_policy();
            let request = ToolRequest {
                tenant_id: self.run.tenant_id,
                user_id: self.run.operator_id,
                thread_id: self.run.thread_id,
                flow_run_id: self.run.id,
                node_key: node.node_key.clone(),
                tool_code: node.type_code.clone(),
                params: node.config.clone(),
                context: self.ctx.node_context(&self.graph, slot),
                async_mode: self.async_mode,
                timeout_seconds: timeout.as_secs(),
                attempt: 1,
            };
            debug!(node_key = %node.node_key, "Dispatching node");

            let invoker = self.invoker.clone();
            let ctx = self.ctx.clone();
            let cancel = self.in_flight.clone();
            let log = self.log.clone();
            let events = self.events.clone();
            let deadline = self.deadline;
            self.tasks.spawn(async move {
                let reporter = NodeReporter {
                    slot,
                    events: events.clone(),
                };
                let node_key = request.node_key.clone();
                let result = invoker
                    .invoke(ToolCall {
                        request,
                        retry_policy,
                        timeout,
                        deadline: Some(deadline),
                        cancel: &cancel,
                        log: &log,
                        observer: &reporter,
                    })
                    .await;
                if let Ok(outcome) = &result
                    && ctx.set_output(slot, outcome.output.clone()).is_err()
                {
                    warn!(node_key = %node_key, "Node output already written");
                }
                drop(permit);
                let _ = events.send(NodeEvent::Finished { slot, result }).await;
            });
        }
    }

    async fn apply(&mut self, event: NodeEvent) {
        match event {
            NodeEvent::Retrying { slot, attempt } => {
                self.attempts[slot] = attempt;
                self.work.mark_retrying(slot);
            }
            NodeEvent::Resumed { slot, attempt } => {
                self.attempts[slot] = attempt;
                self.work.mark_running(slot);
            }
            NodeEvent::Finished { slot, result } => {
                let skipped = match result {
                    Ok(outcome) => {
                        self.attempts[slot] = outcome.attempts;
                        self.work.mark_succeeded(slot, &self.graph, &self.ctx)
                    }
                    Err(failure) => {
                        self.attempts[slot] = failure.attempts;
                        self.record_failure(slot, failure.error);
                        self.work.mark_failed(slot, &self.graph, &self.ctx)
                    }
                };
                self.log_skipped(&skipped, None).await;
            }
        }
    }

    fn record_failure(&mut self, slot: usize, error: ToolError) {
        let node = self.graph.node(slot);
        let message = match (&error, &self.stop) {
            (ToolError::Cancelled, Some(Stop::TimedOut)) => "run timed out".to_string(),
            (ToolError::Cancelled, Some(Stop::Cancelled)) => "run cancelled".to_string(),
            _ => error.to_string(),
        };
        warn!(node_key = %node.node_key, required = node.required, error = %message, "Node failed");
        self.errors[slot] = Some(message);
        if node.required && self.stop.is_none() {
            self.halt(Stop::NodeFailed { slot, error });
        }
    }

    /// Fails nodes whose task ended without reporting.
    async fn reap_orphans(&mut self, rx: &mut mpsc::Receiver<NodeEvent>) {
        while let Ok(event) = rx.try_recv() {
            self.apply(event).await;
        }
        let orphans: Vec<usize> = (0..self.graph.node_count())
            .filter(|&slot| self.work.state(slot).is_active())
            .collect();
        for slot in orphans {
            self.attempts[slot] = self.attempts[slot].max(1);
            self.record_failure(
                slot,
                ToolError::Permanent {
                    message: "node task ended without a result".to_string(),
                },
            );
            let skipped = self.work.mark_failed(slot, &self.graph, &self.ctx);
            self.log_skipped(&skipped, None).await;
        }
    }

    async fn log_skipped(&self, slots: &[usize], message: Option<&str>) {
        for &slot in slots {
            let node = self.graph.node(slot);
            debug!(node_key = %node.node_key, "Node skipped");
            let mut event = LogEvent::node(&node.node_key, LogStatus::Skipped, 0);
            if let Some(message) = message {
                event = event.with_message(message);
            }
            self.log.record(event).await;
        }
    }

    async fn finish(mut self) -> RunOutcome {
        if self.stop.is_some() || !self.work.is_complete() {
            let skipped = self.work.skip_remaining();
            self.log_skipped(&skipped, Some("run stopped")).await;
        }

        let run_id = self.run.id.to_string();
        let (status, error) = match self.stop.take() {
            Some(Stop::Cancelled) => (RunStatus::Cancelled, Some(FlowError::Cancelled { run_id })),
            Some(Stop::TimedOut) => (
                RunStatus::TimedOut,
                Some(FlowError::Timeout {
                    run_id,
                    timeout_minutes: self.run.timeout_minutes,
                }),
            ),
            Some(Stop::NodeFailed { slot, error }) => (
                RunStatus::Failed,
                Some(node_failure(&self.graph, slot, &error)),
            ),
            None => match self.unmet_required() {
                Some(slot) => (
                    RunStatus::Failed,
                    Some(FlowError::NodeExecution {
                        node_key: self.graph.node(slot).node_key.clone(),
                        message: "required node was skipped".to_string(),
                    }),
                ),
                None => (RunStatus::Succeeded, None),
            },
        };

        let sinks = self
            .graph
            .sink_slots()
            .into_iter()
            .filter(|&slot| self.work.state(slot) == NodeRunState::Succeeded);
        let output = JsonValue::Object(self.ctx.outputs_of(sinks));

        let nodes = self
            .graph
            .nodes()
            .map(|(slot, node)| NodeResult {
                node_key: node.node_key.clone(),
                state: self.work.state(slot),
                attempts: self.attempts[slot],
                output: self.ctx.output(slot).cloned(),
                error: self.errors[slot].clone(),
            })
            .collect();

        let mut event = LogEvent::run(run_log_status(status));
        if let Some(error) = &error {
            event = event.with_message(error.to_string());
        }
        self.log.record(event).await;
        info!(status = status.as_str(), "Run finished");

        RunOutcome {
            status,
            output,
            error,
            nodes,
        }
    }

    /// Returns the first required node, in topological order, that did not succeed.
    fn unmet_required(&self) -> Option<usize> {
        self.graph.topological_order().into_iter().find(|&slot| {
            self.graph.node(slot).required && self.work.state(slot) != NodeRunState::Succeeded
        })
    }
}

fn node_failure(graph: &FlowGraph, slot: usize, error: &ToolError) -> FlowError {
    let node_key = graph.node(slot).node_key.clone();
    let message = error.to_string();
    if error.is_retryable() {
        FlowError::ToolInvocation { node_key, message }
    } else {
        FlowError::NodeExecution { node_key, message }
    }
}

fn run_log_status(status: RunStatus) -> LogStatus {
    match status {
        RunStatus::Succeeded => LogStatus::Succeeded,
        RunStatus::Cancelled => LogStatus::Cancelled,
        RunStatus::TimedOut => LogStatus::TimedOut,
        RunStatus::Created | RunStatus::Running | RunStatus::Failed => LogStatus::Failed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::edge::FlowEdge;
    use crate::error::FlowErrorKind;
    use crate::node::{BackoffStrategy, FlowNode, RetryPolicy};
    use crate::run_log::{InMemoryRunLog, RunLogEntry};
    use crate::testing::{FakeToolService, Step};
    use flowdeck_core::{DefinitionId, SnapshotId, TenantId, UserId};
    use serde_json::json;

    struct Harness {
        tools: Arc<FakeToolService>,
        log: Arc<InMemoryRunLog>,
        scheduler: RunScheduler,
    }

    impl Harness {
        fn new(tools: FakeToolService) -> Self {
            Self::with_config(tools, EngineConfig::default())
        }

        fn with_config(tools: FakeToolService, config: EngineConfig) -> Self {
            let tools = Arc::new(tools);
            let log = Arc::new(InMemoryRunLog::new());
            let scheduler = RunScheduler::new(
                Arc::new(ToolInvoker::new(tools.clone())),
                log.clone(),
                config,
            );
            Self {
                tools,
                log,
                scheduler,
            }
        }

        async fn run(&self, nodes: &[FlowNode], edges: &[FlowEdge]) -> (FlowRun, RunOutcome) {
            self.run_with(nodes, edges, 30, &CancellationToken::new())
                .await
        }

        async fn run_with(
            &self,
            nodes: &[FlowNode],
            edges: &[FlowEdge],
            timeout_minutes: i64,
            cancel: &CancellationToken,
        ) -> (FlowRun, RunOutcome) {
            let graph = Arc::new(FlowGraph::build(nodes, edges).expect("graph"));
            let mut run = FlowRun::new(
                SnapshotId::new(),
                DefinitionId::new(),
                TenantId::new(),
                UserId::new(),
                None,
                json!({"q": "hello"}),
                timeout_minutes,
            );
            run.start();
            let outcome = self.scheduler.execute(&run, graph, false, cancel).await;
            (run, outcome)
        }

        async fn entries(&self, run: &FlowRun) -> Vec<RunLogEntry> {
            self.log.entries(run.id).await.expect("entries")
        }
    }

    fn state_of(outcome: &RunOutcome, key: &str) -> NodeRunState {
        outcome
            .nodes
            .iter()
            .find(|n| n.node_key.as_str() == key)
            .map(|n| n.state)
            .expect("node result")
    }

    fn node_entries<'a>(entries: &'a [RunLogEntry], key: &str) -> Vec<&'a RunLogEntry> {
        entries
            .iter()
            .filter(|e| e.node_key.as_ref().is_some_and(|k| k.as_str() == key))
            .collect()
    }

    #[tokio::test]
    async fn linear_flow_succeeds_with_sink_output() {
        let h = Harness::new(
            FakeToolService::new().then("c", Step::Succeed(json!({"answer": 42}))),
        );
        let nodes = [
            FlowNode::new("a", "http"),
            FlowNode::new("b", "http"),
            FlowNode::new("c", "http"),
        ];
        let edges = [FlowEdge::new("a", "b"), FlowEdge::new("b", "c")];

        let (run, outcome) = h.run(&nodes, &edges).await;

        assert_eq!(outcome.status, RunStatus::Succeeded);
        assert!(outcome.error.is_none());
        assert_eq!(outcome.output, json!({"c": {"answer": 42}}));
        assert_eq!(h.tools.calls(), vec!["a", "b", "c"]);
        assert!(outcome.nodes.iter().all(|n| n.state == NodeRunState::Succeeded));

        let entries = h.entries(&run).await;
        assert_eq!(entries.first().map(|e| e.status), Some(LogStatus::Started));
        assert!(entries.first().is_some_and(|e| e.node_key.is_none()));
        assert_eq!(entries.last().map(|e| e.status), Some(LogStatus::Succeeded));
        assert!(entries.last().is_some_and(|e| e.node_key.is_none()));
    }

    #[tokio::test]
    async fn node_context_contains_predecessor_outputs() {
        let h = Harness::new(
            FakeToolService::new()
                .then("a", Step::Succeed(json!("from-a")))
                .then("b", Step::Succeed(json!("from-b"))),
        );
        let nodes = [
            FlowNode::new("a", "http"),
            FlowNode::new("b", "http"),
            FlowNode::new("join", crate::node::PASSTHROUGH_TYPE_CODE),
        ];
        let edges = [FlowEdge::new("a", "join"), FlowEdge::new("b", "join")];

        let (_, outcome) = h.run(&nodes, &edges).await;

        assert_eq!(outcome.status, RunStatus::Succeeded);
        assert_eq!(
            outcome.output,
            json!({"join": {"input": {"q": "hello"}, "nodes": {"a": "from-a", "b": "from-b"}}})
        );
    }

    #[tokio::test]
    async fn false_condition_skips_optional_branch() {
        let h = Harness::new(
            FakeToolService::new().then("b", Step::Succeed(json!({"score": 0.2}))),
        );
        let nodes = [
            FlowNode::new("a", "http"),
            FlowNode::new("b", "http"),
            FlowNode::new("c", "http").optional(),
        ];
        let edges = [
            FlowEdge::new("a", "b"),
            FlowEdge::conditional("b", "c", "nodes.b.score > 0.5"),
        ];

        let (run, outcome) = h.run(&nodes, &edges).await;

        assert_eq!(outcome.status, RunStatus::Succeeded);
        assert_eq!(state_of(&outcome, "c"), NodeRunState::Skipped);
        assert_eq!(h.tools.calls_for("c"), 0);
        let c = node_entries(&h.entries(&run).await, "c")
            .iter()
            .map(|e| e.status)
            .collect::<Vec<_>>();
        assert_eq!(c, vec![LogStatus::Skipped]);
    }

    #[tokio::test]
    async fn skipped_required_node_fails_run() {
        let h = Harness::new(
            FakeToolService::new().then("b", Step::Succeed(json!({"score": 0.2}))),
        );
        let nodes = [
            FlowNode::new("a", "http"),
            FlowNode::new("b", "http"),
            FlowNode::new("c", "http"),
        ];
        let edges = [
            FlowEdge::new("a", "b"),
            FlowEdge::conditional("b", "c", "nodes.b.score > 0.5"),
        ];

        let (_, outcome) = h.run(&nodes, &edges).await;

        assert_eq!(outcome.status, RunStatus::Failed);
        assert_eq!(state_of(&outcome, "c"), NodeRunState::Skipped);
        let error = outcome.error.clone().expect("error");
        assert_eq!(error.kind(), FlowErrorKind::NodeExecution);
        assert_eq!(error.entity_id().as_deref(), Some("c"));
    }

    #[tokio::test]
    async fn true_condition_runs_branch() {
        let h = Harness::new(
            FakeToolService::new().then("b", Step::Succeed(json!({"score": 0.9}))),
        );
        let nodes = [
            FlowNode::new("b", "http"),
            FlowNode::new("c", "http"),
            FlowNode::new("d", "http").optional(),
        ];
        let edges = [
            FlowEdge::conditional("b", "c", "nodes.b.score > 0.5"),
            FlowEdge::conditional("b", "d", "nodes.b.score <= 0.5"),
        ];

        let (_, outcome) = h.run(&nodes, &edges).await;

        assert_eq!(outcome.status, RunStatus::Succeeded);
        assert_eq!(state_of(&outcome, "c"), NodeRunState::Succeeded);
        assert_eq!(state_of(&outcome, "d"), NodeRunState::Skipped);
        assert!(outcome.output.get("c").is_some());
    }

    #[tokio::test]
    async fn required_failure_stops_dispatch_and_drains_in_flight() {
        let h = Harness::new(
            FakeToolService::new()
                .then(
                    "a",
                    Step::Fail(ToolError::Permanent {
                        message: "bad params".to_string(),
                    }),
                )
                .delay("slow", Duration::from_millis(50)),
        );
        let nodes = [
            FlowNode::new("a", "http"),
            FlowNode::new("after_a", "http"),
            FlowNode::new("slow", "http"),
            FlowNode::new("after_slow", "http"),
        ];
        let edges = [
            FlowEdge::new("a", "after_a"),
            FlowEdge::new("slow", "after_slow"),
        ];

        let (run, outcome) = h.run(&nodes, &edges).await;

        assert_eq!(outcome.status, RunStatus::Failed);
        let error = outcome.error.clone().expect("error");
        assert_eq!(error.kind(), FlowErrorKind::NodeExecution);
        assert_eq!(error.entity_id().as_deref(), Some("a"));
        assert_eq!(state_of(&outcome, "a"), NodeRunState::Failed);
        assert_eq!(state_of(&outcome, "after_a"), NodeRunState::Skipped);
        // Already running when `a` failed, so it runs to completion.
        assert_eq!(state_of(&outcome, "slow"), NodeRunState::Succeeded);
        // Became ready after the failure, so it is never dispatched.
        assert_eq!(state_of(&outcome, "after_slow"), NodeRunState::Skipped);
        assert_eq!(h.tools.calls_for("after_slow"), 0);

        let entries = h.entries(&run).await;
        let last = entries.last().expect("entries");
        assert_eq!(last.status, LogStatus::Failed);
        assert!(last.node_key.is_none());
    }

    #[tokio::test]
    async fn optional_failure_does_not_fail_run() {
        let h = Harness::new(FakeToolService::new().then(
            "enrich",
            Step::Fail(ToolError::Permanent {
                message: "no data".to_string(),
            }),
        ));
        let nodes = [
            FlowNode::new("fetch", "http"),
            FlowNode::new("enrich", "http").optional(),
            FlowNode::new("report", "http").optional(),
            FlowNode::new("answer", "http"),
        ];
        let edges = [
            FlowEdge::new("fetch", "enrich"),
            FlowEdge::new("enrich", "report"),
            FlowEdge::new("fetch", "answer"),
        ];

        let (_, outcome) = h.run(&nodes, &edges).await;

        assert_eq!(outcome.status, RunStatus::Succeeded);
        assert_eq!(state_of(&outcome, "enrich"), NodeRunState::Failed);
        assert_eq!(state_of(&outcome, "report"), NodeRunState::Skipped);
        assert_eq!(state_of(&outcome, "answer"), NodeRunState::Succeeded);
        let enrich = outcome
            .nodes
            .iter()
            .find(|n| n.node_key.as_str() == "enrich")
            .expect("enrich");
        assert_eq!(enrich.error.as_deref(), Some("tool failed: no data"));
        assert_eq!(outcome.output, json!({"answer": {"node": "answer", "attempt": 1}}));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried_within_run() {
        let h = Harness::new(
            FakeToolService::new()
                .then(
                    "flaky",
                    Step::Fail(ToolError::Transient {
                        message: "503".to_string(),
                    }),
                )
                .then("flaky", Step::Succeed(json!("ok"))),
        );
        let nodes = [FlowNode::new("flaky", "http").with_retry(RetryPolicy::new(
            3,
            BackoffStrategy::Fixed { delay_ms: 100 },
        ))];

        let (run, outcome) = h.run(&nodes, &[]).await;

        assert_eq!(outcome.status, RunStatus::Succeeded);
        assert_eq!(outcome.nodes[0].attempts, 2);
        let statuses: Vec<_> = node_entries(&h.entries(&run).await, "flaky")
            .iter()
            .map(|e| (e.status, e.attempt))
            .collect();
        assert_eq!(
            statuses,
            vec![
                (LogStatus::Started, 1),
                (LogStatus::Failed, 1),
                (LogStatus::Retrying, 1),
                (LogStatus::Started, 2),
                (LogStatus::Succeeded, 2),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_report_tool_invocation_error() {
        let transient = || {
            Step::Fail(ToolError::Transient {
                message: "502".to_string(),
            })
        };
        let h = Harness::new(
            FakeToolService::new()
                .then("flaky", transient())
                .then("flaky", transient()),
        );
        let nodes = [FlowNode::new("flaky", "http").with_retry(RetryPolicy::new(
            2,
            BackoffStrategy::Fixed { delay_ms: 10 },
        ))];

        let (_, outcome) = h.run(&nodes, &[]).await;

        assert_eq!(outcome.status, RunStatus::Failed);
        assert_eq!(outcome.nodes[0].attempts, 2);
        let error = outcome.error.clone().expect("error");
        assert_eq!(error.kind(), FlowErrorKind::ToolInvocation);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_times_out_run_and_keeps_partial_results() {
        let h = Harness::new(FakeToolService::new().then("wait", Step::Hang));
        let nodes = [
            FlowNode::new("first", "http"),
            FlowNode::new("wait", "http").with_timeout_seconds(7200),
            FlowNode::new("never", "http"),
        ];
        let edges = [FlowEdge::new("first", "wait"), FlowEdge::new("wait", "never")];
        let started = Instant::now();

        let (run, outcome) = h
            .run_with(&nodes, &edges, 1, &CancellationToken::new())
            .await;

        assert_eq!(outcome.status, RunStatus::TimedOut);
        assert!(started.elapsed() >= Duration::from_secs(60));
        assert!(started.elapsed() < Duration::from_secs(120));
        let error = outcome.error.clone().expect("error");
        assert_eq!(error.kind(), FlowErrorKind::Timeout);
        assert_eq!(state_of(&outcome, "first"), NodeRunState::Succeeded);
        assert_eq!(state_of(&outcome, "wait"), NodeRunState::Failed);
        assert_eq!(state_of(&outcome, "never"), NodeRunState::Skipped);

        let entries = h.entries(&run).await;
        assert!(!node_entries(&entries, "first").is_empty());
        assert_eq!(entries.last().map(|e| e.status), Some(LogStatus::TimedOut));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_run() {
        let h = Harness::new(FakeToolService::new().then("wait", Step::Hang));
        let nodes = [
            FlowNode::new("wait", "http").with_timeout_seconds(600),
            FlowNode::new("next", "http"),
        ];
        let edges = [FlowEdge::new("wait", "next")];
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            trigger.cancel();
        });

        let (run, outcome) = h.run_with(&nodes, &edges, 30, &cancel).await;

        assert_eq!(outcome.status, RunStatus::Cancelled);
        assert_eq!(
            outcome.error.as_ref().map(FlowError::kind),
            Some(FlowErrorKind::Cancelled)
        );
        assert_eq!(state_of(&outcome, "wait"), NodeRunState::Failed);
        assert_eq!(state_of(&outcome, "next"), NodeRunState::Skipped);
        let entries = h.entries(&run).await;
        assert_eq!(entries.last().map(|e| e.status), Some(LogStatus::Cancelled));
    }

    #[tokio::test]
    async fn cancelled_before_start_dispatches_nothing() {
        let h = Harness::new(FakeToolService::new());
        let nodes = [FlowNode::new("a", "http"), FlowNode::new("b", "http")];
        let edges = [FlowEdge::new("a", "b")];
        let cancel = CancellationToken::new();
        cancel.cancel();

        let (_, outcome) = h.run_with(&nodes, &edges, 30, &cancel).await;

        assert_eq!(outcome.status, RunStatus::Cancelled);
        assert!(h.tools.calls().is_empty());
        for node in &outcome.nodes {
            assert_eq!(node.state, NodeRunState::Skipped, "{}", node.node_key);
            assert_eq!(node.attempts, 0);
        }
    }

    #[tokio::test]
    async fn concurrency_is_bounded() {
        let mut tools = FakeToolService::new();
        let mut nodes = Vec::new();
        for i in 0..6 {
            let key = format!("n{i}");
            tools = tools.delay(&key, Duration::from_millis(20));
            nodes.push(FlowNode::new(key.as_str(), "http"));
        }
        let config = EngineConfig {
            max_concurrency: 2,
            ..EngineConfig::default()
        };
        let h = Harness::with_config(tools, config);

        let (_, outcome) = h.run(&nodes, &[]).await;

        assert_eq!(outcome.status, RunStatus::Succeeded);
        assert_eq!(h.tools.calls().len(), 6);
        assert!(h.tools.max_in_flight() <= 2);
        assert_eq!(h.tools.max_in_flight(), 2);
    }

    #[tokio::test]
    async fn nodes_start_only_after_predecessors_are_terminal() {
        let h = Harness::new(
            FakeToolService::new()
                .delay("left", Duration::from_millis(30))
                .delay("right", Duration::from_millis(5)),
        );
        let nodes = [
            FlowNode::new("root", "http"),
            FlowNode::new("left", "http"),
            FlowNode::new("right", "http"),
            FlowNode::new("join", "http"),
        ];
        let edges = [
            FlowEdge::new("root", "left"),
            FlowEdge::new("root", "right"),
            FlowEdge::new("left", "join"),
            FlowEdge::new("right", "join"),
        ];

        let (run, outcome) = h.run(&nodes, &edges).await;
        assert_eq!(outcome.status, RunStatus::Succeeded);

        let entries = h.entries(&run).await;
        let terminal_seq = |key: &str| {
            node_entries(&entries, key)
                .iter()
                .filter(|e| e.status == LogStatus::Succeeded)
                .map(|e| e.sequence)
                .max()
                .expect("terminal entry")
        };
        let start_seq = |key: &str| {
            node_entries(&entries, key)
                .iter()
                .filter(|e| e.status == LogStatus::Started)
                .map(|e| e.sequence)
                .min()
                .expect("start entry")
        };
        for (source, target) in [("root", "left"), ("root", "right"), ("left", "join"), ("right", "join")] {
            assert!(
                terminal_seq(source) < start_seq(target),
                "{target} started before {source} finished"
            );
        }
    }

    #[tokio::test]
    async fn every_node_reaches_one_terminal_state() {
        let h = Harness::new(
            FakeToolService::new()
                .then("b", Step::Succeed(json!({"go": false})))
                .then(
                    "d",
                    Step::Fail(ToolError::Permanent {
                        message: "x".to_string(),
                    }),
                ),
        );
        let nodes = [
            FlowNode::new("a", "http"),
            FlowNode::new("b", "http"),
            FlowNode::new("c", "http").optional(),
            FlowNode::new("d", "http").optional(),
            FlowNode::new("e", "http").optional(),
        ];
        let edges = [
            FlowEdge::new("a", "b"),
            FlowEdge::conditional("b", "c", "nodes.b.go == true"),
            FlowEdge::new("a", "d"),
            FlowEdge::new("d", "e"),
        ];

        let (run, outcome) = h.run(&nodes, &edges).await;

        assert_eq!(outcome.status, RunStatus::Succeeded);
        assert_eq!(outcome.nodes.len(), 5);
        assert!(outcome.nodes.iter().all(|n| n.state.is_terminal()));

        let entries = h.entries(&run).await;
        for node in &outcome.nodes {
            let key = node.node_key.as_str();
            let finals = node_entries(&entries, key)
                .iter()
                .filter(|e| matches!(e.status, LogStatus::Succeeded | LogStatus::Skipped))
                .count();
            let expected = usize::from(node.state != NodeRunState::Failed);
            assert_eq!(finals, expected, "node {key}");
        }
        assert_eq!(state_of(&outcome, "e"), NodeRunState::Skipped);
    }
}
