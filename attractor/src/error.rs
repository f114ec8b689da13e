//! Engine error types.
//!
//! Recoverable stage failures never appear here: they travel as
//! [`Outcome`](crate::outcome::Outcome) values with `Status::Fail` and are
//! routed by the scheduler. `EngineError` is reserved for fatal conditions
//! that abort the run (invalid graph, unusable configuration, checkpoint I/O).

use thiserror::Error;

use crate::config::ConfigError;
use crate::graph::GraphError;
use crate::llm::LlmError;

/// Fatal engine error. Aborting with one of these still writes `final.json`
/// with `status=fail` before the error is returned to the caller.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("graph: {0}")]
    Graph(#[from] GraphError),

    #[error("config: {0}")]
    Config(#[from] ConfigError),

    #[error("node {0} has no llm_provider attribute")]
    MissingProvider(String),

    #[error("no executable mapping for provider {0}")]
    MissingExecutable(String),

    #[error("llm: {0}")]
    Llm(#[from] LlmError),

    #[error("checkpoint: {0}")]
    Checkpoint(String),

    #[error("vcs: {0}")]
    Vcs(String),

    #[error("setup: {0}")]
    Setup(String),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("run cancelled")]
    Cancelled,

    #[error("invalid run options: {0}")]
    InvalidOptions(String),
}
