//! Scriptable tool service used by scheduler and service tests.

use crate::error::ToolError;
use crate::tool::{ToolExecutionService, ToolRequest};
use async_trait::async_trait;
use serde_json::{Value as JsonValue, json};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// What a scripted call does after its delay.
#[derive(Debug, Clone)]
pub(crate) enum Step {
    Succeed(JsonValue),
    Fail(ToolError),
    /// Blocks until cancelled.
    Hang,
}

#[derive(Debug, Default)]
struct Script {
    delay: Duration,
    steps: VecDeque<Step>,
}

/// Tool service scripted per node key.
///
/// Unscripted calls succeed with `{"node": <key>, "attempt": <n>}`.
#[derive(Debug, Default)]
pub(crate) struct FakeToolService {
    scripts: Mutex<HashMap<String, Script>>,
    calls: Mutex<Vec<String>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl FakeToolService {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Delays every call of a node.
    pub(crate) fn delay(self, node_key: &str, delay: Duration) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .entry(node_key.to_string())
            .or_default()
            .delay = delay;
        self
    }

    /// Queues what the next call of a node does.
    pub(crate) fn then(self, node_key: &str, step: Step) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .entry(node_key.to_string())
            .or_default()
            .steps
            .push_back(step);
        self
    }

    /// Node keys in call order, one entry per attempt.
    pub(crate) fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// Number of calls made for a node.
    pub(crate) fn calls_for(&self, node_key: &str) -> usize {
        self.calls().iter().filter(|k| *k == node_key).count()
    }

    /// Highest number of calls observed in flight at once.
    pub(crate) fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ToolExecutionService for FakeToolService {
    async fn execute(
        &self,
        request: &ToolRequest,
        cancel: &CancellationToken,
    ) -> Result<JsonValue, ToolError> {
        let key = request.node_key.to_string();
        self.calls.lock().unwrap().push(key.clone());
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlight(&self.in_flight);

        let (delay, step) = {
            let mut scripts = self.scripts.lock().unwrap();
            match scripts.get_mut(&key) {
                Some(script) => (script.delay, script.steps.pop_front()),
                None => (Duration::ZERO, None),
            }
        };

        tokio::select! {
            () = cancel.cancelled() => return Err(ToolError::Cancelled),
            () = tokio::time::sleep(delay) => {}
        }

        match step {
            Some(Step::Succeed(value)) => Ok(value),
            Some(Step::Fail(error)) => Err(error),
            Some(Step::Hang) => {
                cancel.cancelled().await;
                Err(ToolError::Cancelled)
            }
            None => Ok(json!({"node": key, "attempt": request.attempt})),
        }
    }
}
