//! Programmatic API backend.
//!
//! Two modes per node attribute `codergen_mode`: `one_shot` (single request,
//! request/response artifacts) and `agent_loop` (agentic session whose event
//! stream is persisted and projected into the content database by a
//! dedicated reader task).

use std::fs::OpenOptions;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tracing::{debug, warn};

use crate::backoff::{delay_for_attempt, BackoffConfig};
use crate::context::RunContext;
use crate::cxdb::{ContentDb, TYPE_TOOL_CALL, TYPE_TOOL_RESULT};
use crate::exec::StageExecution;
use crate::graph::{parse_int, Node};
use crate::progress::ProgressEvent;

use super::client::{
    LlmClient, LlmError, OneShotRequest, SessionEvent, SessionOptions,
};

/// Request retry policy for API calls. Every sleep surfaces as an
/// `llm_retry` progress event; jitter is keyed so replays are deterministic.
#[derive(Debug, Clone)]
pub struct RequestRetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub jitter: bool,
}

impl Default for RequestRetryPolicy {
    fn default() -> Self {
        RequestRetryPolicy {
            max_retries: 6,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(120),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RequestRetryPolicy {
    fn backoff(&self) -> BackoffConfig {
        BackoffConfig {
            initial_delay: self.base_delay,
            factor: self.multiplier,
            max_delay: self.max_delay,
            jitter: self.jitter,
        }
    }
}

pub struct ApiBackend {
    pub retry: RequestRetryPolicy,
}

impl Default for ApiBackend {
    fn default() -> Self {
        ApiBackend {
            retry: RequestRetryPolicy::default(),
        }
    }
}

impl ApiBackend {
    /// Runs one (provider, model) candidate. Errors bubble to the router,
    /// which owns the failover chain.
    pub async fn run(
        &self,
        client: &Arc<dyn LlmClient>,
        ctx: &RunContext,
        exec: &StageExecution,
        node: &Node,
        provider: &str,
        model: &str,
        prompt: &str,
    ) -> Result<String, LlmError> {
        let mode = node.attr("codergen_mode").unwrap_or("one_shot");
        match mode {
            "agent_loop" => {
                self.run_agent_loop(client, ctx, exec, node, provider, model, prompt)
                    .await
            }
            _ => {
                self.run_one_shot(client, ctx, exec, node, provider, model, prompt)
                    .await
            }
        }
    }

    async fn run_one_shot(
        &self,
        client: &Arc<dyn LlmClient>,
        ctx: &RunContext,
        exec: &StageExecution,
        node: &Node,
        provider: &str,
        model: &str,
        prompt: &str,
    ) -> Result<String, LlmError> {
        let request = OneShotRequest {
            provider: provider.to_string(),
            model: model.to_string(),
            prompt: prompt.to_string(),
            reasoning_effort: node.attr("reasoning_effort").map(str::to_string),
        };
        exec.write_json("api_request.json", &request)
            .map_err(|e| LlmError::Unknown(format!("write api_request.json: {e}")))?;

        let response = self
            .with_retries(ctx, exec, node, provider, model, || client.one_shot(&request))
            .await?;

        exec.write_json("api_response.json", &response.raw)
            .map_err(|e| LlmError::Unknown(format!("write api_response.json: {e}")))?;
        Ok(response.text)
    }

    async fn run_agent_loop(
        &self,
        client: &Arc<dyn LlmClient>,
        ctx: &RunContext,
        exec: &StageExecution,
        node: &Node,
        provider: &str,
        model: &str,
        prompt: &str,
    ) -> Result<String, LlmError> {
        let opts = SessionOptions {
            provider: provider.to_string(),
            model: model.to_string(),
            prompt: prompt.to_string(),
            worktree: exec.worktree.clone(),
            max_turns: match parse_int(node.attr("max_agent_turns"), 0) {
                0 => None,
                n => Some(n as u32),
            },
            reasoning_effort: node.attr("reasoning_effort").map(str::to_string),
            tool_filter: exec
                .hooks
                .clone()
                .map(|hooks| hooks as std::sync::Arc<dyn super::client::ToolCallFilter>),
        };

        let mut session = self
            .with_retries(ctx, exec, node, provider, model, || client.open_session(&opts))
            .await?;

        // Dedicated reader: persists each event to events.ndjson and projects
        // tool events into the content database. The driver waits on it.
        let ndjson_path = exec
            .artifact_path("events.ndjson")
            .map_err(|e| LlmError::Unknown(format!("events.ndjson: {e}")))?;
        let node_id = node.id.clone();
        let content_db = exec.content_db.clone();
        let hooks = exec.hooks.clone();
        let reader = tokio::spawn(async move {
            let mut file = match OpenOptions::new()
                .create(true)
                .append(true)
                .open(&ndjson_path)
            {
                Ok(file) => Some(file),
                Err(err) => {
                    warn!(error = %err, "failed to open events.ndjson");
                    None
                }
            };
            let mut events: Vec<SessionEvent> = Vec::new();
            let mut final_text: Option<String> = None;
            let mut last_assistant = String::new();

            while let Some(event) = session.next_event().await {
                if let Some(file) = file.as_mut() {
                    if let Ok(line) = serde_json::to_string(&event) {
                        let _ = writeln!(file, "{line}");
                    }
                }
                project_tool_event(&content_db, &node_id, &event).await;
                if let SessionEvent::ToolCallEnd {
                    call_id,
                    tool_name,
                    output,
                    is_error,
                } = &event
                {
                    if let Some(hooks) = hooks.as_ref() {
                        hooks.run_post(tool_name, call_id, output, *is_error).await;
                    }
                }
                match &event {
                    SessionEvent::AssistantText { text } => last_assistant = text.clone(),
                    SessionEvent::SessionEnd { final_text: text } => {
                        final_text = text.clone();
                    }
                    _ => {}
                }
                events.push(event);
            }
            (events, final_text, last_assistant)
        });

        let (events, final_text, last_assistant) = reader
            .await
            .map_err(|e| LlmError::Unknown(format!("session reader: {e}")))?;

        exec.write_json("events.json", &events)
            .map_err(|e| LlmError::Unknown(format!("write events.json: {e}")))?;

        if ctx.is_cancelled() {
            return Err(LlmError::Cancelled);
        }
        Ok(final_text.unwrap_or(last_assistant))
    }

    /// Retry wrapper: retries retryable errors under the policy, emitting an
    /// `llm_retry` progress event per sleep, honoring run cancellation.
    async fn with_retries<T, F, Fut>(
        &self,
        ctx: &RunContext,
        exec: &StageExecution,
        node: &Node,
        provider: &str,
        model: &str,
        mut call: F,
    ) -> Result<T, LlmError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, LlmError>>,
    {
        let backoff = self.retry.backoff();
        let mut attempt: u32 = 1;
        loop {
            if ctx.is_cancelled() {
                return Err(LlmError::Cancelled);
            }
            match call().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    if !err.retryable() || attempt > self.retry.max_retries {
                        return Err(err);
                    }
                    let seed = format!("{}:{}:llm:{attempt}", exec.run_id, node.id);
                    let delay = delay_for_attempt(attempt, &backoff, &seed);
                    debug!(
                        node_id = %node.id,
                        provider,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "llm request retry"
                    );
                    exec.progress.emit(&ProgressEvent::LlmRetry {
                        node_id: node.id.clone(),
                        provider: provider.to_string(),
                        model: model.to_string(),
                        attempt,
                        delay_ms: delay.as_millis() as u64,
                    });
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = ctx.cancel_token().cancelled() => return Err(LlmError::Cancelled),
                    }
                    attempt += 1;
                }
            }
        }
    }
}

/// Projects tool-call boundaries into the content database. Failures are
/// warning-only; the run never depends on the store being up.
async fn project_tool_event(content_db: &Arc<dyn ContentDb>, node_id: &str, event: &SessionEvent) {
    let (type_name, payload) = match event {
        SessionEvent::ToolCallStart {
            call_id,
            tool_name,
            arguments_json,
        } => (
            TYPE_TOOL_CALL,
            json!({
                "node_id": node_id,
                "call_id": call_id,
                "tool_name": tool_name,
                "arguments_json": arguments_json,
            }),
        ),
        SessionEvent::ToolCallEnd {
            call_id,
            tool_name,
            output,
            is_error,
        } => (
            TYPE_TOOL_RESULT,
            json!({
                "node_id": node_id,
                "call_id": call_id,
                "tool_name": tool_name,
                "output": output,
                "is_error": is_error,
            }),
        ),
        _ => return,
    };
    if let Err(err) = content_db.append(type_name, 1, &payload).await {
        warn!(node_id, error = %err, "content db append failed");
    }
}
