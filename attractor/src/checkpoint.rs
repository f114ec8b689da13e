//! Checkpoint and manifest stores.
//!
//! `checkpoint.json` is rewritten atomically (write-temp-then-rename) after
//! each node completion. It carries just enough to continue a run without
//! replaying completed nodes; per-node outcomes live in `status.json` files.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::EngineError;

pub const CHECKPOINT_FILE: &str = "checkpoint.json";
pub const MANIFEST_FILE: &str = "manifest.json";

/// Resumable engine state.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Checkpoint {
    #[serde(default)]
    pub current_node: Option<String>,
    #[serde(default)]
    pub completed_nodes: Vec<String>,
    #[serde(default)]
    pub node_retries: BTreeMap<String, u32>,
    #[serde(default)]
    pub git_commit_sha: Option<String>,
    #[serde(default)]
    pub loop_failure_signatures: BTreeMap<String, u32>,
    #[serde(default)]
    pub extra: BTreeMap<String, Value>,
}

impl Checkpoint {
    /// Saves atomically under the logs root, mirroring the loop-failure
    /// signatures into `extra` for older readers.
    pub fn save(&self, logs_root: &Path) -> Result<(), EngineError> {
        let mut doc = self.clone();
        doc.extra.insert(
            "loop_failure_signatures".to_string(),
            serde_json::to_value(&self.loop_failure_signatures)?,
        );
        let body = serde_json::to_string_pretty(&doc)?;
        let path = logs_root.join(CHECKPOINT_FILE);
        let tmp = logs_root.join(format!("{CHECKPOINT_FILE}.tmp"));
        std::fs::write(&tmp, body)
            .and_then(|_| std::fs::rename(&tmp, &path))
            .map_err(|e| EngineError::Checkpoint(format!("write {}: {e}", path.display())))
    }

    /// Loads a checkpoint, reconstructing counters from `extra` when present.
    /// JSON numbers are tolerated as floats; empty keys are discarded.
    pub fn load(logs_root: &Path) -> Result<Checkpoint, EngineError> {
        let path = logs_root.join(CHECKPOINT_FILE);
        let raw = std::fs::read_to_string(&path)
            .map_err(|e| EngineError::Checkpoint(format!("read {}: {e}", path.display())))?;
        let mut checkpoint: Checkpoint = serde_json::from_str(&raw)
            .map_err(|e| EngineError::Checkpoint(format!("parse {}: {e}", path.display())))?;

        if let Some(Value::Object(map)) = checkpoint.extra.get("loop_failure_signatures") {
            for (key, value) in map {
                if key.is_empty() {
                    continue;
                }
                let count = match value {
                    Value::Number(n) => n.as_f64().map(|f| f as u32),
                    _ => None,
                };
                if let Some(count) = count {
                    checkpoint
                        .loop_failure_signatures
                        .entry(key.clone())
                        .or_insert(count);
                }
            }
        }
        checkpoint.loop_failure_signatures.retain(|k, _| !k.is_empty());
        checkpoint.node_retries.retain(|k, _| !k.is_empty());
        Ok(checkpoint)
    }
}

/// Run manifest, written once at run start. Paths are stored absolute so a
/// resume from another working directory still finds everything.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub run_id: String,
    pub logs_root: PathBuf,
    pub worktree: PathBuf,
    pub run_branch_prefix: String,
}

impl Manifest {
    pub fn save(&self, logs_root: &Path) -> Result<(), EngineError> {
        let body = serde_json::to_string_pretty(self)?;
        std::fs::write(logs_root.join(MANIFEST_FILE), body).map_err(EngineError::Io)
    }

    pub fn load(logs_root: &Path) -> Result<Manifest, EngineError> {
        let path = logs_root.join(MANIFEST_FILE);
        let raw = std::fs::read_to_string(&path)
            .map_err(|e| EngineError::Checkpoint(format!("read {}: {e}", path.display())))?;
        serde_json::from_str(&raw)
            .map_err(|e| EngineError::Checkpoint(format!("parse {}: {e}", path.display())))
    }

    /// The run branch this manifest's run commits to.
    pub fn run_branch(&self) -> String {
        format!("{}/{}", self.run_branch_prefix, self.run_id)
    }
}
