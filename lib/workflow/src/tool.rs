//! Tool invocation adapter.
//!
//! Nodes do their work by calling an external tool execution service. The
//! `ToolInvoker` wraps every call with:
//! - a per-attempt timeout, bounded by what is left of the run budget
//! - retries of transient failures and timeouts per the node's retry policy
//! - cancellation through the run's in-flight token
//! - a STARTED / SUCCEEDED / FAILED run log entry per attempt
//!
//! Nodes with the `passthrough` type code are answered locally with their
//! context and never reach the service.

use crate::error::ToolError;
use crate::node::{NodeKey, RetryPolicy};
use crate::run_log::{LogEvent, LogStatus, RunLogWriter};
use async_trait::async_trait;
use flowdeck_core::{FlowRunId, TenantId, ThreadId, UserId};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, warn};

/// A request to execute one tool call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolRequest {
    pub tenant_id: TenantId,
    pub user_id: UserId,
    pub thread_id: Option<ThreadId>,
    pub flow_run_id: FlowRunId,
    pub node_key: NodeKey,
    pub tool_code: String,
    /// The node's configuration.
    pub params: JsonValue,
    /// Run input and upstream outputs.
    pub context: JsonValue,
    pub async_mode: bool,
    /// Timeout of this attempt.
    pub timeout_seconds: u64,
    /// Attempt number, starting at 1.
    pub attempt: u32,
}

/// A piece of partial tool output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolChunk {
    Text { text: String },
    Data { value: JsonValue },
}

/// The external tool execution service.
#[async_trait]
pub trait ToolExecutionService: Send + Sync {
    /// Executes a tool call and returns its output.
    ///
    /// Implementations should return promptly once `cancel` fires.
    async fn execute(
        &self,
        request: &ToolRequest,
        cancel: &CancellationToken,
    ) -> Result<JsonValue, ToolError>;

    /// Executes a tool call, pushing partial output into `chunks`.
    ///
    /// The sender is dropped on return, which closes the stream. The default
    /// sends the whole output as a single chunk.
    async fn execute_streaming(
        &self,
        request: &ToolRequest,
        chunks: mpsc::Sender<ToolChunk>,
        cancel: &CancellationToken,
    ) -> Result<JsonValue, ToolError> {
        let output = self.execute(request, cancel).await?;
        if chunks
            .send(ToolChunk::Data {
                value: output.clone(),
            })
            .await
            .is_err()
        {
            debug!(node_key = %request.node_key, "Tool stream consumer went away");
        }
        Ok(output)
    }
}

/// Consumer side of a streaming tool call.
///
/// Dropping the stream cancels the call.
pub struct ToolStream {
    chunks: mpsc::Receiver<ToolChunk>,
    result: JoinHandle<Result<JsonValue, ToolError>>,
    cancel_guard: DropGuard,
}

impl ToolStream {
    /// Starts a streaming call with a channel of the given capacity.
    pub fn open(
        service: Arc<dyn ToolExecutionService>,
        request: ToolRequest,
        capacity: usize,
        cancel: &CancellationToken,
    ) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let token = cancel.child_token();
        let producer_token = token.clone();
        let result = tokio::spawn(async move {
            service
                .execute_streaming(&request, tx, &producer_token)
                .await
        });
        Self {
            chunks: rx,
            result,
            cancel_guard: token.drop_guard(),
        }
    }

    /// Returns the next chunk, or `None` once the producer is done.
    pub async fn next_chunk(&mut self) -> Option<ToolChunk> {
        self.chunks.recv().await
    }

    /// Discards unread chunks and waits for the final result.
    ///
    /// # Errors
    ///
    /// Returns the tool error, or a transient error if the producer task died.
    pub async fn finish(self) -> Result<JsonValue, ToolError> {
        let Self {
            mut chunks,
            result,
            cancel_guard: _cancel_guard,
        } = self;
        chunks.close();
        while chunks.recv().await.is_some() {}
        result.await.unwrap_or_else(|e| {
            Err(ToolError::Transient {
                message: format!("tool task failed: {e}"),
            })
        })
    }
}

#[derive(Debug, Deserialize)]
struct ToolResponseBody {
    #[serde(default)]
    output: JsonValue,
    #[serde(default)]
    error: Option<String>,
}

/// Tool execution service reached over HTTP.
///
/// Each call is a JSON `POST {base_url}/tools/{toolCode}/execute` with the
/// `ToolRequest` as body. The response body is `{"output": ..., "error": ...}`.
#[derive(Debug, Clone)]
pub struct HttpToolService {
    client: reqwest::Client,
    base_url: String,
}

impl HttpToolService {
    /// Creates a service with a default client.
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), base_url)
    }

    /// Creates a service with the given client.
    #[must_use]
    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Returns the URL a tool is executed at.
    #[must_use]
    pub fn execute_url(&self, tool_code: &str) -> String {
        format!("{}/tools/{tool_code}/execute", self.base_url)
    }
}

/// Maps a non-success HTTP status to a tool error.
///
/// Server errors and 429 are transient; every other status is permanent.
#[must_use]
pub fn classify_status(status: StatusCode, body: &str) -> ToolError {
    let message = if body.is_empty() {
        status.to_string()
    } else {
        format!("{status}: {body}")
    };
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        ToolError::Transient { message }
    } else {
        ToolError::Permanent { message }
    }
}

fn classify_transport(error: &reqwest::Error, timeout: Duration) -> ToolError {
    if error.is_timeout() {
        ToolError::Timeout { after: timeout }
    } else if error.is_decode() {
        ToolError::Permanent {
            message: format!("invalid tool response: {error}"),
        }
    } else {
        ToolError::Transient {
            message: error.to_string(),
        }
    }
}

#[async_trait]
impl ToolExecutionService for HttpToolService {
    async fn execute(
        &self,
        request: &ToolRequest,
        cancel: &CancellationToken,
    ) -> Result<JsonValue, ToolError> {
        let timeout = Duration::from_secs(request.timeout_seconds);
        let call = async {
            let response = self
                .client
                .post(self.execute_url(&request.tool_code))
                .timeout(timeout)
                .json(request)
                .send()
                .await
                .map_err(|e| classify_transport(&e, timeout))?;

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(classify_status(status, &body));
            }

            let body: ToolResponseBody = response
                .json()
                .await
                .map_err(|e| classify_transport(&e, timeout))?;
            match body.error {
                Some(message) => Err(ToolError::Permanent { message }),
                None => Ok(body.output),
            }
        };

        tokio::select! {
            () = cancel.cancelled() => Err(ToolError::Cancelled),
            result = call => result,
        }
    }
}

/// Receives retry progress of a tool call.
#[async_trait]
pub trait AttemptObserver: Send + Sync {
    /// An attempt failed and the next one starts after `delay`.
    async fn retrying(&self, attempt: u32, delay: Duration);

    /// The given attempt is starting after a backoff.
    async fn resumed(&self, attempt: u32);
}

/// Observer that ignores retry progress.
pub struct NoopObserver;

#[async_trait]
impl AttemptObserver for NoopObserver {
    async fn retrying(&self, _attempt: u32, _delay: Duration) {}

    async fn resumed(&self, _attempt: u32) {}
}

/// One node's tool call with everything the invoker needs around it.
pub struct ToolCall<'a> {
    pub request: ToolRequest,
    pub retry_policy: RetryPolicy,
    /// The node's own per-attempt timeout.
    pub timeout: Duration,
    /// The run deadline; attempts never run past it.
    pub deadline: Option<Instant>,
    pub cancel: &'a CancellationToken,
    pub log: &'a RunLogWriter,
    pub observer: &'a dyn AttemptObserver,
}

/// A successful tool call.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutcome {
    pub output: JsonValue,
    pub attempts: u32,
}

/// A tool call that failed for good.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolFailure {
    pub error: ToolError,
    pub attempts: u32,
}

/// Calls tools with timeouts, retries, cancellation and logging.
pub struct ToolInvoker {
    service: Arc<dyn ToolExecutionService>,
}

impl ToolInvoker {
    /// Creates an invoker over the given service.
    pub fn new(service: Arc<dyn ToolExecutionService>) -> Self {
        Self { service }
    }

    /// Returns the underlying service.
    #[must_use]
    pub fn service(&self) -> &Arc<dyn ToolExecutionService> {
        &self.service
    }

    /// Runs a tool call to completion.
    ///
    /// # Errors
    ///
    /// Returns the last error once retries are exhausted, immediately for
    /// permanent failures, and `Cancelled` when the token fires.
    pub async fn invoke(&self, call: ToolCall<'_>) -> Result<ToolOutcome, ToolFailure> {
        let ToolCall {
            mut request,
            retry_policy,
            timeout,
            deadline,
            cancel,
            log,
            observer,
        } = call;
        let passthrough = request.tool_code == crate::node::PASSTHROUGH_TYPE_CODE;
        let max_attempts = retry_policy.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            if cancel.is_cancelled() {
                return Err(ToolFailure {
                    error: ToolError::Cancelled,
                    attempts: attempt - 1,
                });
            }

            let budget = match deadline {
                Some(deadline) => timeout.min(deadline.saturating_duration_since(Instant::now())),
                None => timeout,
            };
            request.attempt = attempt;
            request.timeout_seconds = budget.as_secs().max(1);

            log.record(LogEvent::node(&request.node_key, LogStatus::Started, attempt))
                .await;
            let started = Instant::now();

            let result = if passthrough {
                Ok(request.context.clone())
            } else if budget.is_zero() {
                Err(ToolError::Timeout { after: budget })
            } else {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => Err(ToolError::Cancelled),
                    outcome = tokio::time::timeout(budget, self.service.execute(&request, cancel)) => {
                        outcome.unwrap_or(Err(ToolError::Timeout { after: budget }))
                    }
                }
            };
            let latency_ms = i64::try_from(started.elapsed().as_millis()).unwrap_or(i64::MAX);

            let error = match result {
                Ok(output) => {
                    log.record(
                        LogEvent::node(&request.node_key, LogStatus::Succeeded, attempt)
                            .with_latency_ms(latency_ms),
                    )
                    .await;
                    return Ok(ToolOutcome {
                        output,
                        attempts: attempt,
                    });
                }
                Err(error) => error,
            };

            log.record(
                LogEvent::node(&request.node_key, LogStatus::Failed, attempt)
                    .with_latency_ms(latency_ms)
                    .with_message(error.to_string()),
            )
            .await;

            if !error.is_retryable() || attempt >= max_attempts || cancel.is_cancelled() {
                return Err(ToolFailure {
                    error,
                    attempts: attempt,
                });
            }

            let delay = retry_policy.backoff.delay_after(attempt);
            warn!(
                run_id = %request.flow_run_id,
                node_key = %request.node_key,
                attempt,
                max_attempts,
                backoff_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                error = %error,
                "Retrying tool invocation"
            );
            log.record(
                LogEvent::node(&request.node_key, LogStatus::Retrying, attempt)
                    .with_message(format!("retrying in {}ms", delay.as_millis())),
            )
            .await;
            observer.retrying(attempt, delay).await;

            tokio::select! {
                () = cancel.cancelled() => {
                    return Err(ToolFailure {
                        error: ToolError::Cancelled,
                        attempts: attempt,
                    });
                }
                () = tokio::time::sleep(delay) => {}
            }

            attempt += 1;
            observer.resumed(attempt).await;
        }
    }
}
