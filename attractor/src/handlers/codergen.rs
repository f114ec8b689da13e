//! Codergen handler: LLM-backed stages.
//!
//! Routes the node's prompt through the [`LlmRouter`] and maps the reply to
//! an outcome. A single-token final line in the reply becomes a custom
//! routing status (e.g. `needs_dod`), which is what conditional edges match.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::classify::FailureClass;
use crate::context::RunContext;
use crate::error::EngineError;
use crate::exec::StageExecution;
use crate::graph::{Graph, Node};
use crate::llm::LlmRouter;
use crate::outcome::Outcome;

use super::{status_from_text, Handler};

pub struct CodergenHandler {
    router: Arc<LlmRouter>,
}

impl CodergenHandler {
    pub fn new(router: Arc<LlmRouter>) -> Self {
        CodergenHandler { router }
    }
}

#[async_trait]
impl Handler for CodergenHandler {
    async fn execute(
        &self,
        ctx: &RunContext,
        exec: &StageExecution,
        _graph: &Graph,
        node: &Node,
    ) -> Result<Outcome, EngineError> {
        let Some(prompt) = node.attr("prompt") else {
            return Ok(Outcome::classified_fail(
                format!("node {} has no prompt", node.id),
                FailureClass::Deterministic,
                "graph_config|codergen|missing-prompt",
            ));
        };

        let output = self.router.run(ctx, exec, node, prompt).await?;
        if let Some(outcome) = output.outcome {
            return Ok(outcome);
        }

        let mut outcome = Outcome::success();
        outcome.status = status_from_text(&output.text);
        outcome.notes = Some(output.text.trim().to_string());
        outcome
            .meta
            .insert("llm_provider".into(), Value::String(output.provider));
        outcome
            .meta
            .insert("llm_model".into(), Value::String(output.model));
        Ok(outcome)
    }
}
