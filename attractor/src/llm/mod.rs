//! LLM router.
//!
//! Dispatches a codergen node's prompt to the API backend (agentic sessions
//! with tool streams) or the CLI backend (subprocess launch with structured
//! output negotiation), with provider failover for transient API errors.

pub mod api;
pub mod catalog;
pub mod cli;
pub mod client;
pub mod mock;

use std::sync::Arc;

use tokio::sync::OnceCell;
use tracing::warn;

use crate::classify::classify_llm_error;
use crate::config::{BackendKind, RunConfig};
use crate::context::RunContext;
use crate::error::EngineError;
use crate::exec::StageExecution;
use crate::graph::Node;
use crate::outcome::Outcome;
use crate::progress::ProgressEvent;

pub use api::{ApiBackend, RequestRetryPolicy};
pub use catalog::{preferred_model, ModelCatalog};
pub use cli::{CliBackend, CliCapabilities, CliInvocation, CliTiming};
pub use client::{
    ApiResponse, LlmClient, LlmError, LlmSession, OneShotRequest, SessionEvent, SessionOptions,
};

/// What the router hands back to the codergen handler.
#[derive(Debug, Clone)]
pub struct RouterOutput {
    pub text: String,
    /// `None` on success; `Some(fail outcome)` for a recoverable stage
    /// failure the scheduler may retry.
    pub outcome: Option<Outcome>,
    pub provider: String,
    pub model: String,
}

/// Factory for the lazily-initialized API client. Configuration errors are
/// persistent: once the factory fails, every later call sees the same error.
pub type ClientFactory = Box<dyn Fn() -> Result<Arc<dyn LlmClient>, LlmError> + Send + Sync>;

pub struct LlmRouter {
    config: Arc<RunConfig>,
    catalog: ModelCatalog,
    api: ApiBackend,
    cli: CliBackend,
    client: OnceCell<Arc<dyn LlmClient>>,
    client_factory: ClientFactory,
}

impl LlmRouter {
    pub fn new(config: Arc<RunConfig>, catalog: ModelCatalog, client_factory: ClientFactory) -> Self {
        LlmRouter {
            config,
            catalog,
            api: ApiBackend::default(),
            cli: CliBackend::default(),
            client: OnceCell::new(),
            client_factory,
        }
    }

    /// Router with an already-constructed client; used by tests.
    pub fn with_client(config: Arc<RunConfig>, catalog: ModelCatalog, client: Arc<dyn LlmClient>) -> Self {
        let router = LlmRouter::new(config, catalog, Box::new(|| Err(LlmError::Configuration("client injected".into()))));
        router
            .client
            .set(client)
            .unwrap_or_else(|_| unreachable!("fresh OnceCell"));
        router
    }

    pub fn with_cli_capabilities(mut self, cli: CliBackend) -> Self {
        self.cli = cli;
        self
    }

    async fn client(&self) -> Result<&Arc<dyn LlmClient>, LlmError> {
        self.client
            .get_or_try_init(|| async { (self.client_factory)() })
            .await
    }

    /// Routes one codergen stage. Returns a fatal error only for invocation
    /// setup problems; provider failures come back as fail outcomes.
    pub async fn run(
        &self,
        ctx: &RunContext,
        exec: &StageExecution,
        node: &Node,
        prompt: &str,
    ) -> Result<RouterOutput, EngineError> {
        let (provider, model) = self.resolve_identity(exec, node)?;

        match self.config.backend_for(&provider) {
            Some(BackendKind::Cli) => {
                self.cli
                    .run(ctx, exec, node, &self.config, &provider, &model, prompt)
                    .await
            }
            Some(BackendKind::Api) => {
                self.run_api_with_failover(ctx, exec, node, &provider, &model, prompt)
                    .await
            }
            None => Err(EngineError::Llm(LlmError::Configuration(format!(
                "provider {provider} has no backend in run config"
            )))),
        }
    }

    /// Provider and model for this attempt: the escalation chain's override
    /// wins, then `llm_provider` / `llm_model` (falling back to `model`).
    fn resolve_identity(
        &self,
        exec: &StageExecution,
        node: &Node,
    ) -> Result<(String, String), EngineError> {
        if let Some((provider, model)) = &exec.model_override {
            return Ok((normalize_provider(provider), model.clone()));
        }
        let provider = node
            .attr("llm_provider")
            .map(normalize_provider)
            .ok_or_else(|| EngineError::MissingProvider(node.id.clone()))?;
        let model = node
            .attr("llm_model")
            .or_else(|| node.attr("model"))
            .map(str::to_string)
            .or_else(|| preferred_model(&provider, &self.catalog))
            .ok_or_else(|| {
                EngineError::Llm(LlmError::Configuration(format!(
                    "no model for provider {provider} on node {}",
                    node.id
                )))
            })?;
        Ok((provider, model))
    }

    async fn run_api_with_failover(
        &self,
        ctx: &RunContext,
        exec: &StageExecution,
        node: &Node,
        provider: &str,
        model: &str,
        prompt: &str,
    ) -> Result<RouterOutput, EngineError> {
        let client = self.client().await.map_err(EngineError::Llm)?.clone();
        let known = client.provider_names();

        let mut candidates: Vec<(String, String)> = vec![(provider.to_string(), model.to_string())];
        for &fallback in failover_order(provider) {
            if fallback == provider {
                continue;
            }
            let api_backed = self.config.backend_for(fallback) == Some(BackendKind::Api);
            if api_backed && known.iter().any(|name| name == fallback) {
                if let Some(model) = preferred_model(fallback, &self.catalog) {
                    candidates.push((fallback.to_string(), model));
                }
            }
        }

        let total = candidates.len();
        for (index, (candidate_provider, candidate_model)) in candidates.iter().enumerate() {
            match self
                .api
                .run(&client, ctx, exec, node, candidate_provider, candidate_model, prompt)
                .await
            {
                Ok(text) => {
                    let _ = exec.write_json(
                        "provider_used.json",
                        &serde_json::json!({
                            "provider": candidate_provider,
                            "model": candidate_model,
                        }),
                    );
                    return Ok(RouterOutput {
                        text,
                        outcome: None,
                        provider: candidate_provider.clone(),
                        model: candidate_model.clone(),
                    });
                }
                Err(err) => {
                    let last = index + 1 == total;
                    if err.failover_eligible() && !last {
                        let next = &candidates[index + 1];
                        warn!(
                            node_id = %node.id,
                            from = %candidate_provider,
                            to = %next.0,
                            error = %err,
                            "llm provider failover"
                        );
                        exec.progress.emit(&ProgressEvent::LlmFailover {
                            node_id: node.id.clone(),
                            from_provider: candidate_provider.clone(),
                            to_provider: next.0.clone(),
                            to_model: next.1.clone(),
                            reason: err.to_string(),
                        });
                        continue;
                    }
                    let (class, signature) = classify_llm_error(candidate_provider, &err);
                    let outcome = Outcome::classified_fail(
                        format!("{candidate_provider} API call failed: {err}"),
                        class,
                        signature,
                    );
                    return Ok(RouterOutput {
                        text: String::new(),
                        outcome: Some(outcome),
                        provider: candidate_provider.clone(),
                        model: candidate_model.clone(),
                    });
                }
            }
        }
        unreachable!("candidate list is never empty")
    }
}

/// Normalizes a provider key: trim, lowercase, plus the alias table
/// (`gemini` → `google`, `moonshot` → `kimi`).
pub fn normalize_provider(raw: &str) -> String {
    let key = raw.trim().to_lowercase();
    match key.as_str() {
        "gemini" => "google".to_string(),
        "moonshot" => "kimi".to_string(),
        _ => key,
    }
}

/// Failover order per primary provider.
pub fn failover_order(primary: &str) -> &'static [&'static str] {
    match primary {
        "openai" => &["anthropic", "google"],
        "anthropic" => &["openai", "google"],
        "google" => &["openai", "anthropic"],
        _ => &["openai", "anthropic", "google"],
    }
}
