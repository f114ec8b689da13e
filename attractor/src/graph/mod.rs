//! Graph data model: nodes, edges, attribute bags.
//!
//! The textual DSL parser is an external collaborator; the engine consumes
//! [`Graph`] values (serde-JSON is the interchange form used by the CLI).
//! All node and graph attributes are string-typed; handlers coerce them with
//! the helpers in [`attrs`].

pub mod attrs;
pub mod condition;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use attrs::{parse_bool, parse_duration, parse_int, parse_list};
pub use condition::Condition;

/// Shape tag of a node; determines its handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeShape {
    /// `box`: LLM router stage.
    Codergen,
    /// `parallelogram`: shell command stage.
    Tool,
    /// `component`: parallel branch expansion.
    FanOut,
    /// `tripleoctagon`: parallel branch join.
    FanIn,
    /// `diamond`: routing vertex; never retried.
    Conditional,
    /// `Mdiamond`: run entry.
    Entry,
    /// `Msquare`: run terminal.
    Terminal,
}

impl NodeShape {
    /// Maps a DOT shape attribute to the handler tag. Unknown shapes fall
    /// back to `Codergen` (box is the DOT default).
    pub fn parse(shape: &str) -> NodeShape {
        match shape {
            "parallelogram" => NodeShape::Tool,
            "component" => NodeShape::FanOut,
            "tripleoctagon" => NodeShape::FanIn,
            "diamond" => NodeShape::Conditional,
            "Mdiamond" => NodeShape::Entry,
            "Msquare" => NodeShape::Terminal,
            _ => NodeShape::Codergen,
        }
    }
}

/// One vertex of the stage graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    #[serde(default)]
    pub attrs: BTreeMap<String, String>,
}

impl Node {
    pub fn new(id: impl Into<String>) -> Self {
        Node {
            id: id.into(),
            attrs: BTreeMap::new(),
        }
    }

    /// Builder-style attribute set, used heavily in tests.
    pub fn with_attr(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attrs.insert(key.into(), value.into());
        self
    }

    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attrs.get(key).map(String::as_str)
    }

    pub fn shape(&self) -> NodeShape {
        self.attr("shape").map(NodeShape::parse).unwrap_or(NodeShape::Codergen)
    }
}

/// Directed edge with an optional condition string.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Edge {
    pub from: String,
    pub to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(default)]
    pub loop_restart: bool,
    #[serde(default)]
    pub weight: i64,
}

impl Edge {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Edge {
            from: from.into(),
            to: to.into(),
            condition: None,
            loop_restart: false,
            weight: 0,
        }
    }

    pub fn with_condition(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }

    pub fn with_loop_restart(mut self) -> Self {
        self.loop_restart = true;
        self
    }

    pub fn with_weight(mut self, weight: i64) -> Self {
        self.weight = weight;
        self
    }
}

/// Graph validation error.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum GraphError {
    #[error("duplicate node id {0}")]
    DuplicateNode(String),
    #[error("graph has no entry node (shape=Mdiamond)")]
    NoEntry,
    #[error("graph has multiple entry nodes: {0} and {1}")]
    MultipleEntries(String, String),
    #[error("edge references unknown node {0}")]
    UnknownNode(String),
    #[error("non-terminal node {0} has no outgoing edges")]
    DeadEnd(String),
    #[error("retry_target {target} on {scope} does not resolve to a node")]
    UnknownRetryTarget { scope: String, target: String },
}

/// A set of nodes and edges plus a graph-level attribute bag.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Graph {
    #[serde(default)]
    pub nodes: BTreeMap<String, Node>,
    #[serde(default)]
    pub edges: Vec<Edge>,
    #[serde(default)]
    pub attrs: BTreeMap<String, String>,
}

impl Graph {
    pub fn new() -> Self {
        Graph::default()
    }

    /// Inserts a node; returns an error on duplicate IDs.
    pub fn add_node(&mut self, node: Node) -> Result<&mut Self, GraphError> {
        if self.nodes.contains_key(&node.id) {
            return Err(GraphError::DuplicateNode(node.id));
        }
        self.nodes.insert(node.id.clone(), node);
        Ok(self)
    }

    pub fn add_edge(&mut self, edge: Edge) -> &mut Self {
        self.edges.push(edge);
        self
    }

    pub fn set_attr(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.attrs.insert(key.into(), value.into());
        self
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attrs.get(key).map(String::as_str)
    }

    /// Node attribute with graph-level fallback (the common read pattern for
    /// `retry_target`, `tool_hooks.*`, backoff keys).
    pub fn node_or_graph_attr<'a>(&'a self, node: &'a Node, key: &str) -> Option<&'a str> {
        node.attr(key).or_else(|| self.attr(key))
    }

    pub fn outgoing(&self, from: &str) -> Vec<&Edge> {
        self.edges.iter().filter(|e| e.from == from).collect()
    }

    /// The unique entry node. Validation guarantees exactly one exists.
    pub fn entry_node(&self) -> Result<&Node, GraphError> {
        let mut found: Option<&Node> = None;
        for node in self.nodes.values() {
            if node.shape() == NodeShape::Entry {
                if let Some(first) = found {
                    return Err(GraphError::MultipleEntries(
                        first.id.clone(),
                        node.id.clone(),
                    ));
                }
                found = Some(node);
            }
        }
        found.ok_or(GraphError::NoEntry)
    }

    /// Enforces the structural invariants: exactly one entry, edges resolve,
    /// non-terminal nodes have outgoing edges, retry targets resolve.
    pub fn validate(&self) -> Result<(), GraphError> {
        self.entry_node()?;

        for edge in &self.edges {
            for id in [&edge.from, &edge.to] {
                if !self.nodes.contains_key(id) {
                    return Err(GraphError::UnknownNode(id.clone()));
                }
            }
        }

        for node in self.nodes.values() {
            if node.shape() != NodeShape::Terminal && self.outgoing(&node.id).is_empty() {
                return Err(GraphError::DeadEnd(node.id.clone()));
            }
        }

        if let Some(target) = self.attr("retry_target") {
            if !self.nodes.contains_key(target) {
                return Err(GraphError::UnknownRetryTarget {
                    scope: "graph".into(),
                    target: target.into(),
                });
            }
        }
        for node in self.nodes.values() {
            if let Some(target) = node.attr("retry_target") {
                if !self.nodes.contains_key(target) {
                    return Err(GraphError::UnknownRetryTarget {
                        scope: node.id.clone(),
                        target: target.into(),
                    });
                }
            }
        }
        Ok(())
    }
}
