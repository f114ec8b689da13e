//! LLM client seam: typed error taxonomy, requests, session event stream.
//!
//! Providers themselves live outside the core; the engine talks to whatever
//! implements [`LlmClient`]. The error taxonomy is what the failure
//! classifier pattern-matches against.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Typed API error taxonomy exposed by the LLM client.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("authentication: {0}")]
    Authentication(String),
    #[error("access denied: {0}")]
    AccessDenied(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("context length exceeded: {0}")]
    ContextLength(String),
    #[error("rate limited: {message}")]
    RateLimit {
        message: String,
        retry_after: Option<Duration>,
    },
    #[error("server error: {0}")]
    Server(String),
    #[error("request timeout: {0}")]
    Timeout(String),
    #[error("configuration: {0}")]
    Configuration(String),
    #[error("network: {0}")]
    Network(String),
    #[error("stream: {0}")]
    Stream(String),
    #[error("aborted: {0}")]
    Abort(String),
    #[error("run cancelled")]
    Cancelled,
    #[error("unknown: {0}")]
    Unknown(String),
}

impl LlmError {
    /// Whether the provider failover chain may advance past this error.
    /// Contract-shaped errors would fail identically on every provider.
    pub fn failover_eligible(&self) -> bool {
        !matches!(
            self,
            LlmError::Configuration(_)
                | LlmError::Authentication(_)
                | LlmError::AccessDenied(_)
                | LlmError::InvalidRequest(_)
                | LlmError::ContextLength(_)
                | LlmError::Cancelled
        )
    }

    /// Whether the request retry policy should try again on the same provider.
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            LlmError::RateLimit { .. }
                | LlmError::Server(_)
                | LlmError::Timeout(_)
                | LlmError::Network(_)
                | LlmError::Stream(_)
        )
    }
}

/// Single-request invocation (codergen_mode = one_shot).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OneShotRequest {
    pub provider: String,
    pub model: String,
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_effort: Option<String>,
}

/// Raw response from a one-shot request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse {
    pub text: String,
    #[serde(default)]
    pub raw: Value,
}

/// Blocking filter in the session's tool-call path. Returning `Err(reason)`
/// makes the session skip the call and surface the reason as the tool result.
#[async_trait]
pub trait ToolCallFilter: Send + Sync {
    async fn before_call(
        &self,
        tool_name: &str,
        call_id: &str,
        arguments_json: &str,
    ) -> Result<(), String>;
}

/// Agentic session parameters (codergen_mode = agent_loop).
#[derive(Clone)]
pub struct SessionOptions {
    pub provider: String,
    pub model: String,
    pub prompt: String,
    /// Execution environment root: tool calls run inside this directory.
    pub worktree: PathBuf,
    pub max_turns: Option<u32>,
    pub reasoning_effort: Option<String>,
    /// Pre-hook filter; sessions must consult it before every tool call.
    pub tool_filter: Option<std::sync::Arc<dyn ToolCallFilter>>,
}

impl std::fmt::Debug for SessionOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionOptions")
            .field("provider", &self.provider)
            .field("model", &self.model)
            .field("worktree", &self.worktree)
            .field("max_turns", &self.max_turns)
            .field("reasoning_effort", &self.reasoning_effort)
            .field("tool_filter", &self.tool_filter.is_some())
            .finish()
    }
}

/// One event from an agentic session stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    SessionStart {
        session_id: String,
    },
    AssistantText {
        text: String,
    },
    ToolCallStart {
        call_id: String,
        tool_name: String,
        arguments_json: String,
    },
    ToolCallEnd {
        call_id: String,
        tool_name: String,
        output: String,
        is_error: bool,
    },
    TurnComplete {
        turn: u32,
    },
    SessionEnd {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        final_text: Option<String>,
    },
    Error {
        message: String,
    },
}

/// An open agentic session. Events arrive in order; `None` means the stream
/// closed. Single consumer only.
#[async_trait]
pub trait LlmSession: Send {
    async fn next_event(&mut self) -> Option<SessionEvent>;
}

/// The programmatic API backend's client seam.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Providers this client can serve; failover candidates are restricted
    /// to this set.
    fn provider_names(&self) -> Vec<String>;

    async fn one_shot(&self, req: &OneShotRequest) -> Result<ApiResponse, LlmError>;

    async fn open_session(&self, opts: &SessionOptions) -> Result<Box<dyn LlmSession>, LlmError>;
}
