//! Retry gate.
//!
//! Wraps every node execution: deterministic and cancelled failures are never
//! retried; transient failures sleep under the deterministic backoff and try
//! again until the budget runs out, swapping in escalation models when the
//! chain is configured.

use tracing::{debug, warn};

use crate::backoff::{backoff_config_for, backoff_seed, delay_for_attempt};
use crate::classify::FailureClass;
use crate::context::RunContext;
use crate::error::EngineError;
use crate::graph::{parse_int, parse_list, Node, NodeShape};
use crate::handlers::HandlerRegistry;
use crate::outcome::{Outcome, Status};
use crate::progress::ProgressEvent;

use super::{Engine, RunState};

/// Outcome of the gate for one node visit.
pub(crate) struct GateResult {
    pub outcome: Outcome,
}

impl Engine {
    /// Runs a node through the retry gate, recording retry counts into the
    /// checkpoint. `status.json` is written by the caller, once, from the
    /// final attempt's outcome.
    pub(crate) async fn run_with_retry_gate(
        &self,
        ctx: &RunContext,
        node: &Node,
        state: &mut RunState,
    ) -> Result<GateResult, EngineError> {
        let graph = self.graph();
        let Some(type_name) = HandlerRegistry::type_for_shape(node.shape()) else {
            return Ok(GateResult {
                outcome: Outcome::success(),
            });
        };
        let handler = self.registry().get(type_name).ok_or_else(|| {
            EngineError::InvalidOptions(format!("no handler registered for {type_name}"))
        })?;

        let max_retries = parse_int(graph.node_or_graph_attr(node, "max_retries"), 0).max(0) as u32;
        let escalation = escalation_chain(node);
        let retries_before_escalation =
            parse_int(graph.attr("retries_before_escalation"), 2).max(1) as u32;

        let mut attempt: u32 = 1;
        loop {
            let model_override =
                escalation_override(&escalation, attempt, retries_before_escalation);
            if let Some((provider, model)) = &model_override {
                warn!(node_id = %node.id, provider = %provider, model = %model, attempt, "escalating model");
            }
            let exec = self.stage_execution(node, attempt, model_override);
            self.progress().emit(&ProgressEvent::StageStart {
                node_id: node.id.clone(),
                attempt,
            });

            let outcome = handler.execute(ctx, &exec, graph, node).await?;
            self.progress().emit(&ProgressEvent::StageFinish {
                node_id: node.id.clone(),
                status: outcome.status.as_str().to_string(),
            });

            // Diamond routing labels are not failures; they never consume
            // retry budget.
            if node.shape() == NodeShape::Conditional {
                return Ok(GateResult { outcome });
            }
            if !outcome.status.is_failure() {
                return Ok(GateResult { outcome });
            }

            // Only a classifier-stamped class blocks the gate. Unstamped
            // failures stay eligible for the budget; the reason-text
            // heuristic feeds routing (fan-in guard), not blocking.
            let stamped = outcome.failure_class();
            if matches!(
                stamped,
                Some(FailureClass::Deterministic) | Some(FailureClass::Cancelled)
            ) {
                let class = stamped.unwrap();
                self.progress().emit(&ProgressEvent::StageRetryBlocked {
                    node_id: node.id.clone(),
                    class: class.as_str().to_string(),
                    signature: outcome.failure_signature().map(str::to_string),
                });
                debug!(node_id = %node.id, %class, "retry blocked");
                return Ok(GateResult { outcome });
            }

            if attempt > max_retries {
                return Ok(GateResult {
                    outcome: promote_partial(graph, node, outcome),
                });
            }

            let cfg = backoff_config_for(graph, node);
            let seed = backoff_seed(&self.run_id, &node.id, attempt);
            let delay = delay_for_attempt(attempt, &cfg, &seed);
            self.progress().emit(&ProgressEvent::StageRetrySleep {
                node_id: node.id.clone(),
                attempt,
                delay_ms: delay.as_millis() as u64,
            });
            debug!(node_id = %node.id, attempt, delay_ms = delay.as_millis() as u64, "stage retry sleep");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = ctx.cancel_token().cancelled() => {
                    return Ok(GateResult {
                        outcome: Outcome::classified_fail(
                            "run cancelled",
                            FailureClass::Cancelled,
                            "cancelled|gate|run",
                        ),
                    });
                }
            }
            attempt += 1;
            state
                .checkpoint
                .node_retries
                .insert(node.id.clone(), attempt - 1);
        }
    }
}

/// Parses `escalation_models="prov1:model1, prov2:model2"`.
fn escalation_chain(node: &Node) -> Vec<(String, String)> {
    parse_list(node.attr("escalation_models"))
        .into_iter()
        .filter_map(|entry| {
            entry
                .split_once(':')
                .map(|(provider, model)| (provider.trim().to_string(), model.trim().to_string()))
        })
        .collect()
}

/// Which escalation entry applies to this attempt, if any. The first
/// `retries_before_escalation` failures stay on the primary model; each
/// further block of failures advances one chain entry.
fn escalation_override(
    chain: &[(String, String)],
    attempt: u32,
    retries_before_escalation: u32,
) -> Option<(String, String)> {
    if chain.is_empty() || attempt == 0 {
        return None;
    }
    let failures_so_far = attempt - 1;
    let block = failures_so_far / retries_before_escalation;
    if block == 0 {
        return None;
    }
    let index = (block - 1).min(chain.len() as u32 - 1) as usize;
    chain.get(index).cloned()
}

/// `allow_partial=true` promotes a post-retry-exhaustion fail to
/// partial_success; the original reason survives in the notes.
fn promote_partial(graph: &crate::graph::Graph, node: &Node, mut outcome: Outcome) -> Outcome {
    if outcome.status == Status::Fail
        && crate::graph::parse_bool(graph.node_or_graph_attr(node, "allow_partial"), false)
    {
        outcome.notes = outcome.failure_reason.take();
        outcome.status = Status::PartialSuccess;
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;

    /// **Scenario**: The escalation chain engages after the configured number
    /// of failures and advances per block.
    #[test]
    fn escalation_schedule() {
        let chain = vec![
            ("anthropic".to_string(), "claude-opus-4-6".to_string()),
            ("google".to_string(), "gemini-2.5-pro".to_string()),
        ];
        assert_eq!(escalation_override(&chain, 1, 2), None);
        assert_eq!(escalation_override(&chain, 2, 2), None);
        assert_eq!(
            escalation_override(&chain, 3, 2).unwrap().0,
            "anthropic",
            "third attempt (two failures) swaps to the first chain entry"
        );
        assert_eq!(escalation_override(&chain, 4, 2).unwrap().0, "anthropic");
        assert_eq!(escalation_override(&chain, 5, 2).unwrap().0, "google");
        // Past the end of the chain, the last entry sticks.
        assert_eq!(escalation_override(&chain, 9, 2).unwrap().0, "google");
    }

    /// **Scenario**: escalation_models parses the comma-separated prov:model list.
    #[test]
    fn escalation_chain_parsing() {
        let node = Node::new("n").with_attr(
            "escalation_models",
            "anthropic:claude-opus-4-6, google:gemini-2.5-pro",
        );
        let chain = escalation_chain(&node);
        assert_eq!(chain.len(), 2);
        assert_eq!(chain[0], ("anthropic".into(), "claude-opus-4-6".into()));
        assert_eq!(chain[1], ("google".into(), "gemini-2.5-pro".into()));
    }

    /// **Scenario**: allow_partial promotes exhausted failures only.
    #[test]
    fn partial_promotion() {
        let mut graph = crate::graph::Graph::new();
        graph
            .add_node(Node::new("t").with_attr("allow_partial", "true"))
            .unwrap();
        let node = graph.node("t").unwrap();

        let promoted = promote_partial(&graph, node, Outcome::fail("boom"));
        assert_eq!(promoted.status, Status::PartialSuccess);
        assert_eq!(promoted.notes.as_deref(), Some("boom"));

        let mut graph2 = crate::graph::Graph::new();
        graph2.add_node(Node::new("t")).unwrap();
        let node2 = graph2.node("t").unwrap();
        let kept = promote_partial(&graph2, node2, Outcome::fail("boom"));
        assert_eq!(kept.status, Status::Fail);
    }
}
