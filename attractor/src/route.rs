//! Next-hop resolver.
//!
//! A single place owns the edge-selection precedence table: matching
//! conditional edges, then unconditional edges, then the retry target, then
//! the fallback fan-out. The fan-in deterministic guard lives here too.

use crate::classify::FailureClass;
use crate::context::RunContext;
use crate::graph::{Condition, Edge, Graph, Node, NodeShape};
use crate::outcome::{Outcome, Status};

/// Where a retry-target directive came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryTargetSource {
    Node,
    Graph,
}

/// Resolver decision for one completed node.
#[derive(Debug, Clone)]
pub enum NextHop {
    /// Edges to follow: one advances, several fan out in parallel.
    /// `fallback` marks the no-matching-condition fan-out path.
    Edges { edges: Vec<Edge>, fallback: bool },
    /// Route to a retry target instead of following an edge.
    RetryTarget {
        node_id: String,
        source: RetryTargetSource,
    },
    /// Hard stop: no edge applies (including the fan-in deterministic guard).
    Stop,
}

/// The outcome label edges match against. Diamond nodes route on their
/// notes-derived custom label; everything else routes on the status string.
pub fn outcome_label(node: &Node, outcome: &Outcome) -> String {
    if node.shape() == NodeShape::Conditional {
        if let Some(notes) = outcome.notes.as_deref() {
            let trimmed = notes.trim();
            if !trimmed.is_empty() {
                return trimmed.to_string();
            }
        }
    }
    outcome.status.as_str().to_string()
}

/// Selects at most one next hop for `node` given its outcome.
///
/// Precedence: conditional matches, unconditional edges, retry target,
/// fallback fan-out. For a failing fan-in node with a deterministic failure
/// class the resolver returns [`NextHop::Stop`]: retrying a deterministic
/// upstream failure cannot change its outcome.
pub fn resolve_next(
    graph: &Graph,
    node: &Node,
    outcome: &Outcome,
    ctx: &RunContext,
    class: Option<FailureClass>,
) -> NextHop {
    let label = outcome_label(node, outcome);
    let outgoing = graph.outgoing(&node.id);

    // 1. Matching conditional edges; two or more matches fan out.
    let mut matching: Vec<Edge> = outgoing
        .iter()
        .filter(|edge| {
            edge.condition
                .as_deref()
                .map(|raw| Condition::parse(raw).matches(&label, ctx))
                .unwrap_or(false)
        })
        .map(|edge| (*edge).clone())
        .collect();
    if !matching.is_empty() {
        sort_edges(&mut matching);
        return NextHop::Edges {
            edges: matching,
            fallback: false,
        };
    }

    // 2. Unconditional edges.
    let mut unconditional: Vec<Edge> = outgoing
        .iter()
        .filter(|edge| edge.condition.is_none())
        .map(|edge| (*edge).clone())
        .collect();
    if !unconditional.is_empty() {
        sort_edges(&mut unconditional);
        return NextHop::Edges {
            edges: unconditional,
            fallback: false,
        };
    }

    // Fan-in deterministic guard: a deterministic upstream failure at a join
    // must not reach the retry target or the fallback fan-out.
    if node.shape() == NodeShape::FanIn
        && outcome.status == Status::Fail
        && class == Some(FailureClass::Deterministic)
    {
        return NextHop::Stop;
    }

    // 3. Retry target (node-first, graph-second) for failing outcomes.
    if outcome.status.is_failure() {
        if let Some(target) = node.attr("retry_target") {
            return NextHop::RetryTarget {
                node_id: target.to_string(),
                source: RetryTargetSource::Node,
            };
        }
        if let Some(target) = graph.attr("retry_target") {
            return NextHop::RetryTarget {
                node_id: target.to_string(),
                source: RetryTargetSource::Graph,
            };
        }
    }

    // 4. Fallback fan-out: a custom outcome on a node with only conditional
    // edges takes every edge rather than dead-ending silently.
    if !outgoing.is_empty() {
        let mut all: Vec<Edge> = outgoing.iter().map(|edge| (*edge).clone()).collect();
        sort_edges(&mut all);
        return NextHop::Edges {
            edges: all,
            fallback: true,
        };
    }

    NextHop::Stop
}

/// Tie-break: weight descending, then destination id ascending.
fn sort_edges(edges: &mut [Edge]) {
    edges.sort_by(|a, b| b.weight.cmp(&a.weight).then_with(|| a.to.cmp(&b.to)));
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn graph() -> Graph {
        let mut g = Graph::new();
        g.add_node(Node::new("start").with_attr("shape", "Mdiamond")).unwrap();
        g.add_node(Node::new("check")).unwrap();
        g.add_node(Node::new("a")).unwrap();
        g.add_node(Node::new("b")).unwrap();
        g.add_node(Node::new("join").with_attr("shape", "tripleoctagon")).unwrap();
        g.add_node(Node::new("recover")).unwrap();
        g.add_node(Node::new("exit").with_attr("shape", "Msquare")).unwrap();
        g.add_edge(Edge::new("start", "check"));
        g.add_edge(Edge::new("a", "exit"));
        g.add_edge(Edge::new("b", "exit"));
        g.add_edge(Edge::new("recover", "exit"));
        g.add_edge(Edge::new("join", "exit").with_condition("outcome=success"));
        g
    }

    /// **Scenario**: A matching conditional edge beats everything else.
    #[test]
    fn conditional_beats_retry_target() {
        let mut g = graph();
        g.set_attr("retry_target", "recover");
        g.add_edge(Edge::new("check", "a").with_condition("outcome=fail"));
        g.add_edge(Edge::new("check", "b"));

        let node = g.node("check").unwrap();
        let outcome = Outcome::fail("boom");
        let hop = resolve_next(&g, node, &outcome, &RunContext::new(), Some(FailureClass::TransientInfra));
        match hop {
            NextHop::Edges { edges, fallback } => {
                assert!(!fallback);
                assert_eq!(edges.len(), 1);
                assert_eq!(edges[0].to, "a");
            }
            other => panic!("expected conditional edge, got {other:?}"),
        }
    }

    /// **Scenario**: Multiple matching conditionals are all taken (implicit fan-out),
    /// ordered by weight desc then destination asc.
    #[test]
    fn multiple_matches_fan_out_ordered() {
        let mut g = graph();
        g.add_edge(Edge::new("check", "b").with_condition("outcome=success"));
        g.add_edge(Edge::new("check", "a").with_condition("outcome=success").with_weight(5));

        let node = g.node("check").unwrap();
        let hop = resolve_next(&g, node, &Outcome::success(), &RunContext::new(), None);
        match hop {
            NextHop::Edges { edges, .. } => {
                assert_eq!(edges.len(), 2);
                assert_eq!(edges[0].to, "a", "higher weight first");
                assert_eq!(edges[1].to, "b");
            }
            other => panic!("expected fan-out, got {other:?}"),
        }
    }

    /// **Scenario**: Context clauses gate conditional matches.
    #[test]
    fn context_clause_gating() {
        let mut g = graph();
        g.add_edge(
            Edge::new("check", "a").with_condition("outcome=success && context.phase=build"),
        );
        g.add_edge(Edge::new("check", "b"));

        let node = g.node("check").unwrap();
        let mut ctx = RunContext::new();
        ctx.set("phase", json!("test"));
        let hop = resolve_next(&g, node, &Outcome::success(), &ctx, None);
        match hop {
            NextHop::Edges { edges, .. } => assert_eq!(edges[0].to, "b"),
            other => panic!("expected unconditional edge, got {other:?}"),
        }

        ctx.set("phase", json!("build"));
        let hop = resolve_next(&g, node, &Outcome::success(), &ctx, None);
        match hop {
            NextHop::Edges { edges, .. } => assert_eq!(edges[0].to, "a"),
            other => panic!("expected conditional edge, got {other:?}"),
        }
    }

    /// **Scenario**: Node-level retry_target wins over the graph-level one.
    #[test]
    fn retry_target_node_before_graph() {
        let mut g = graph();
        g.set_attr("retry_target", "recover");
        g.add_edge(Edge::new("check", "a").with_condition("outcome=success"));

        let node = g.node("check").unwrap();
        let hop = resolve_next(&g, node, &Outcome::fail("x"), &RunContext::new(), Some(FailureClass::TransientInfra));
        match hop {
            NextHop::RetryTarget { node_id, source } => {
                assert_eq!(node_id, "recover");
                assert_eq!(source, RetryTargetSource::Graph);
            }
            other => panic!("expected retry target, got {other:?}"),
        }

        let mut g2 = graph();
        g2.set_attr("retry_target", "recover");
        g2.nodes.get_mut("check").unwrap().attrs.insert("retry_target".into(), "a".into());
        g2.add_edge(Edge::new("check", "b").with_condition("outcome=success"));
        let node = g2.node("check").unwrap();
        let hop = resolve_next(&g2, node, &Outcome::fail("x"), &RunContext::new(), Some(FailureClass::TransientInfra));
        match hop {
            NextHop::RetryTarget { node_id, source } => {
                assert_eq!(node_id, "a");
                assert_eq!(source, RetryTargetSource::Node);
            }
            other => panic!("expected node retry target, got {other:?}"),
        }
    }

    /// **Scenario**: A deterministic failure at a fan-in returns Stop even with a
    /// graph retry_target; a transient failure lifts the guard.
    #[test]
    fn fan_in_deterministic_guard() {
        let mut g = graph();
        g.set_attr("retry_target", "recover");

        let join = g.node("join").unwrap();
        let outcome = Outcome::fail("both branches failed");

        let hop = resolve_next(&g, join, &outcome, &RunContext::new(), Some(FailureClass::Deterministic));
        assert!(matches!(hop, NextHop::Stop), "deterministic guard must stop");

        let hop = resolve_next(&g, join, &outcome, &RunContext::new(), Some(FailureClass::TransientInfra));
        assert!(
            matches!(hop, NextHop::RetryTarget { .. }),
            "transient failure lifts the guard"
        );
    }

    /// **Scenario**: An unmatched custom outcome on a node with only conditional
    /// edges takes all edges (fallback fan-out).
    #[test]
    fn fallback_fan_out_on_unmatched_outcome() {
        let mut g = graph();
        g.add_edge(Edge::new("check", "a").with_condition("outcome=x"));
        g.add_edge(Edge::new("check", "b").with_condition("outcome=y"));

        let node = g.node("check").unwrap();
        let outcome = Outcome {
            status: Status::Custom("surprise".into()),
            failure_reason: None,
            notes: None,
            meta: Default::default(),
            context_updates: Default::default(),
        };
        let hop = resolve_next(&g, node, &outcome, &RunContext::new(), None);
        match hop {
            NextHop::Edges { edges, fallback } => {
                assert!(fallback);
                assert_eq!(edges.len(), 2);
            }
            other => panic!("expected fallback fan-out, got {other:?}"),
        }
    }

    /// **Scenario**: Diamond nodes route on the notes-derived label.
    #[test]
    fn diamond_routes_on_notes() {
        let mut g = graph();
        g.add_node(Node::new("gate").with_attr("shape", "diamond")).unwrap();
        g.add_edge(Edge::new("gate", "a").with_condition("outcome=go_left"));
        g.add_edge(Edge::new("gate", "b").with_condition("outcome=go_right"));

        let gate = g.node("gate").unwrap();
        let outcome = Outcome::success().with_notes("go_right");
        let hop = resolve_next(&g, gate, &outcome, &RunContext::new(), None);
        match hop {
            NextHop::Edges { edges, fallback } => {
                assert!(!fallback);
                assert_eq!(edges[0].to, "b");
            }
            other => panic!("expected notes-routed edge, got {other:?}"),
        }
    }

    /// **Scenario**: A terminal-adjacent node with no edges and no failure stops cleanly.
    #[test]
    fn no_edges_stops() {
        let g = graph();
        let exit = g.node("exit").unwrap();
        let hop = resolve_next(&g, exit, &Outcome::success(), &RunContext::new(), None);
        assert!(matches!(hop, NextHop::Stop));
    }
}
