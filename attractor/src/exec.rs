//! Per-attempt stage execution context.
//!
//! Built by the scheduler for every node attempt and handed to handlers and
//! the LLM router. Carries the artifact paths, the composed base
//! environment, and the collaborator handles a stage may touch.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::cxdb::ContentDb;
use crate::hooks::ToolHooks;
use crate::progress::ProgressSink;

/// Everything a handler needs to run one attempt of one node.
#[derive(Clone)]
pub struct StageExecution {
    pub run_id: String,
    pub logs_root: PathBuf,
    /// `<logs_root>/<node_id>`; owned by the stage that produced it.
    pub stage_dir: PathBuf,
    pub worktree: PathBuf,
    /// Stage-wide ceiling; handlers take `min(node.timeout, stage_timeout)`.
    pub stage_timeout: Option<Duration>,
    /// Composed base environment (ordered; see `envbuild`).
    pub base_env: Vec<(String, String)>,
    pub progress: Arc<dyn ProgressSink>,
    pub content_db: Arc<dyn ContentDb>,
    /// `(provider, model)` swap installed by the escalation chain.
    pub model_override: Option<(String, String)>,
    /// Resolved tool-call hooks for this stage, if any are configured.
    pub hooks: Option<Arc<ToolHooks>>,
    /// 1-indexed attempt number within the retry gate.
    pub attempt: u32,
}

impl StageExecution {
    /// Effective timeout for a handler: `min(node.timeout, stage_timeout)`.
    pub fn effective_timeout(&self, node: &crate::graph::Node) -> Option<Duration> {
        let node_timeout = node
            .attr("timeout")
            .map(|raw| crate::graph::parse_duration(Some(raw), Duration::from_secs(3600)));
        match (node_timeout, self.stage_timeout) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (Some(a), None) => Some(a),
            (None, Some(b)) => Some(b),
            (None, None) => None,
        }
    }

    /// Ensures the stage directory exists and returns a path inside it.
    pub fn artifact_path(&self, name: &str) -> std::io::Result<PathBuf> {
        std::fs::create_dir_all(&self.stage_dir)?;
        Ok(self.stage_dir.join(name))
    }

    /// Writes a JSON artifact into the stage directory.
    pub fn write_json<T: serde::Serialize>(&self, name: &str, value: &T) -> std::io::Result<()> {
        let path = self.artifact_path(name)?;
        let body = serde_json::to_string_pretty(value)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, body)
    }
}
