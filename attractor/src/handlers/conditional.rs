//! Conditional (diamond) handler.
//!
//! Diamonds are routing vertices: their outcome is a label, not a verdict,
//! and they never consume retry budget. The label comes from a context key
//! (`switch_on` attribute) or, when the node carries a prompt, from an LLM
//! one-shot whose reply's final token is the label.

use std::sync::Arc;

use async_trait::async_trait;

use crate::context::RunContext;
use crate::error::EngineError;
use crate::exec::StageExecution;
use crate::graph::{Graph, Node};
use crate::llm::LlmRouter;
use crate::outcome::{Outcome, Status};

use super::Handler;

pub struct ConditionalHandler {
    router: Arc<LlmRouter>,
}

impl ConditionalHandler {
    pub fn new(router: Arc<LlmRouter>) -> Self {
        ConditionalHandler { router }
    }
}

#[async_trait]
impl Handler for ConditionalHandler {
    async fn execute(
        &self,
        ctx: &RunContext,
        exec: &StageExecution,
        _graph: &Graph,
        node: &Node,
    ) -> Result<Outcome, EngineError> {
        // Context-keyed routing is the cheap common case.
        if let Some(key) = node.attr("switch_on") {
            let label = ctx.get_string(key).unwrap_or_else(|| "unknown".to_string());
            return Ok(routing_outcome(label));
        }

        if let Some(prompt) = node.attr("prompt") {
            let output = self.router.run(ctx, exec, node, prompt).await?;
            if let Some(outcome) = output.outcome {
                // A provider failure at a diamond still surfaces as a label so
                // the graph's fail edges can route it.
                return Ok(outcome);
            }
            let label = output
                .text
                .lines()
                .rev()
                .map(str::trim)
                .find(|line| !line.is_empty())
                .unwrap_or("unknown")
                .to_string();
            return Ok(routing_outcome(label));
        }

        Ok(routing_outcome("success".to_string()))
    }
}

/// Routing outcomes keep `Status::Success` (a diamond has no verdict of its
/// own); the label travels in `notes`, which is what the resolver reads for
/// diamond nodes.
fn routing_outcome(label: String) -> Outcome {
    Outcome {
        status: Status::Success,
        failure_reason: None,
        notes: Some(label),
        meta: Default::default(),
        context_updates: Default::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RunConfig;
    use crate::cxdb::NullContentDb;
    use crate::llm::mock::MockLlmClient;
    use crate::llm::ModelCatalog;
    use crate::progress::NullProgress;
    use serde_json::json;

    fn handler() -> ConditionalHandler {
        ConditionalHandler::new(Arc::new(LlmRouter::with_client(
            Arc::new(RunConfig::default()),
            ModelCatalog::default(),
            Arc::new(MockLlmClient::new()),
        )))
    }

    fn exec_in(dir: &std::path::Path) -> StageExecution {
        StageExecution {
            run_id: "run-1".into(),
            logs_root: dir.to_path_buf(),
            stage_dir: dir.join("gate"),
            worktree: dir.to_path_buf(),
            stage_timeout: None,
            base_env: vec![],
            progress: Arc::new(NullProgress),
            content_db: Arc::new(NullContentDb),
            model_override: None,
            hooks: None,
            attempt: 1,
        }
    }

    /// **Scenario**: switch_on reads the context key and emits it as the routing label.
    #[tokio::test]
    async fn switch_on_reads_context() {
        let tmp = tempfile::tempdir().unwrap();
        let node = Node::new("gate")
            .with_attr("shape", "diamond")
            .with_attr("switch_on", "phase");
        let mut ctx = RunContext::new();
        ctx.set("phase", json!("deploy"));

        let outcome = handler()
            .execute(&ctx, &exec_in(tmp.path()), &Graph::new(), &node)
            .await
            .unwrap();
        assert_eq!(outcome.notes.as_deref(), Some("deploy"));
        assert_eq!(outcome.status, Status::Success);
    }

    /// **Scenario**: A missing context key routes to the `unknown` label rather than failing.
    #[tokio::test]
    async fn missing_context_key_routes_unknown() {
        let tmp = tempfile::tempdir().unwrap();
        let node = Node::new("gate")
            .with_attr("shape", "diamond")
            .with_attr("switch_on", "absent");
        let outcome = handler()
            .execute(&RunContext::new(), &exec_in(tmp.path()), &Graph::new(), &node)
            .await
            .unwrap();
        assert_eq!(outcome.notes.as_deref(), Some("unknown"));
    }
}
