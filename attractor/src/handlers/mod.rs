//! Stage handlers.
//!
//! One [`Handler`] per node type, resolved through a registry keyed by the
//! type string. Fan-out, fan-in, entry and terminal nodes are structural and
//! handled by the scheduler itself, not through the registry.

pub mod codergen;
pub mod conditional;
pub mod tool;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::context::RunContext;
use crate::error::EngineError;
use crate::exec::StageExecution;
use crate::graph::{Graph, Node, NodeShape};
use crate::llm::LlmRouter;
use crate::outcome::Outcome;

pub use codergen::CodergenHandler;
pub use conditional::ConditionalHandler;
pub use tool::ToolHandler;

/// Executes one attempt of one node.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn execute(
        &self,
        ctx: &RunContext,
        exec: &StageExecution,
        graph: &Graph,
        node: &Node,
    ) -> Result<Outcome, EngineError>;
}

/// Registry mapping node type strings to handlers.
pub struct HandlerRegistry {
    handlers: BTreeMap<String, Arc<dyn Handler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        HandlerRegistry {
            handlers: BTreeMap::new(),
        }
    }

    /// Registry with the built-in handlers bound to the given router.
    pub fn with_defaults(router: Arc<LlmRouter>) -> Self {
        let mut registry = HandlerRegistry::new();
        registry.register("tool", Arc::new(ToolHandler));
        registry.register("codergen", Arc::new(CodergenHandler::new(router.clone())));
        registry.register("conditional", Arc::new(ConditionalHandler::new(router)));
        registry
    }

    pub fn register(&mut self, type_name: impl Into<String>, handler: Arc<dyn Handler>) {
        self.handlers.insert(type_name.into(), handler);
    }

    pub fn get(&self, type_name: &str) -> Option<Arc<dyn Handler>> {
        self.handlers.get(type_name).cloned()
    }

    /// Handler type string for a node shape, or `None` for structural shapes.
    pub fn type_for_shape(shape: NodeShape) -> Option<&'static str> {
        match shape {
            NodeShape::Tool => Some("tool"),
            NodeShape::Codergen => Some("codergen"),
            NodeShape::Conditional => Some("conditional"),
            NodeShape::FanOut
            | NodeShape::FanIn
            | NodeShape::Entry
            | NodeShape::Terminal => None,
        }
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        HandlerRegistry::new()
    }
}

/// Derives a routing status from an LLM reply: a single-token final line
/// becomes the outcome label (custom statuses like `needs_dod`), anything
/// longer is a plain success.
pub(crate) fn status_from_text(text: &str) -> crate::outcome::Status {
    use crate::outcome::Status;

    let Some(last_line) = text.lines().rev().map(str::trim).find(|l| !l.is_empty()) else {
        return Status::Success;
    };
    let is_token = last_line.len() <= 64
        && last_line
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if !is_token {
        return Status::Success;
    }
    Status::parse(last_line)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outcome::Status;

    /// **Scenario**: Shape-to-handler mapping covers executable shapes only.
    #[test]
    fn shape_handler_mapping() {
        assert_eq!(HandlerRegistry::type_for_shape(NodeShape::Tool), Some("tool"));
        assert_eq!(HandlerRegistry::type_for_shape(NodeShape::Codergen), Some("codergen"));
        assert_eq!(
            HandlerRegistry::type_for_shape(NodeShape::Conditional),
            Some("conditional")
        );
        assert_eq!(HandlerRegistry::type_for_shape(NodeShape::FanIn), None);
        assert_eq!(HandlerRegistry::type_for_shape(NodeShape::Terminal), None);
    }

    /// **Scenario**: Single-token replies become routing labels; prose stays success.
    #[test]
    fn status_derivation_from_text() {
        assert_eq!(status_from_text("needs_dod"), Status::Custom("needs_dod".into()));
        assert_eq!(status_from_text("Done. All tests pass.\nhas_dod"), Status::Custom("has_dod".into()));
        assert_eq!(status_from_text("fail"), Status::Fail);
        assert_eq!(status_from_text("I rewrote the parser and tests pass."), Status::Success);
        assert_eq!(status_from_text(""), Status::Success);
    }
}
