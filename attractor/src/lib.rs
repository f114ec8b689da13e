//! Attractor: execute a user-authored directed graph of stages against a
//! working copy of a source repository.
//!
//! Each stage is either a deterministic shell command or a call to an LLM
//! backend. The engine traverses the graph, runs each stage, captures
//! artifacts, classifies failures, retries or escalates, checkpoints
//! progress, and produces a terminal verdict.

pub mod backoff;
pub mod checkpoint;
pub mod classify;
pub mod config;
pub mod context;
pub mod cxdb;
pub mod engine;
pub mod envbuild;
pub mod error;
pub mod exec;
pub mod graph;
pub mod handlers;
pub mod hooks;
pub mod llm;
pub mod outcome;
pub mod progress;
pub mod route;
pub mod vcs;

pub use checkpoint::{Checkpoint, Manifest};
pub use classify::FailureClass;
pub use config::RunConfig;
pub use context::RunContext;
pub use engine::{Engine, EngineBuilder, RunOptions, RunResult};
pub use error::EngineError;
pub use graph::{Edge, Graph, GraphError, Node, NodeShape};
pub use outcome::{FinalOutcome, FinalStatus, Outcome, Status};
