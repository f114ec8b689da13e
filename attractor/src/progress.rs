//! Progress events.
//!
//! One JSON object per line in `<logs_root>/progress.ndjson`, appended in the
//! order the driver observes them. The terminal UI subscribes through
//! [`ProgressSink`]; the engine ships the ndjson file sink.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

use serde::Serialize;
use tracing::warn;

/// A structured progress event.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProgressEvent {
    StageStart {
        node_id: String,
        attempt: u32,
    },
    StageFinish {
        node_id: String,
        status: String,
    },
    StageRetrySleep {
        node_id: String,
        attempt: u32,
        delay_ms: u64,
    },
    /// A deterministic or cancelled failure stopped the retry gate early.
    StageRetryBlocked {
        node_id: String,
        class: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
    },
    LlmRetry {
        node_id: String,
        provider: String,
        model: String,
        attempt: u32,
        delay_ms: u64,
    },
    LlmFailover {
        node_id: String,
        from_provider: String,
        to_provider: String,
        to_model: String,
        reason: String,
    },
    ToolHookPreSkip {
        node_id: String,
        tool_name: String,
        exit_code: i32,
    },
    /// A failing outcome matched no condition; all outgoing edges were taken.
    NoMatchingFailEdgeFallback {
        node_id: String,
        status: String,
    },
    LoopRestart {
        node_id: String,
        signature: String,
        count: u32,
    },
    GoalGateRetry {
        node_id: String,
        retry_target: String,
    },
}

/// Sink for progress events. Emission must never fail the run.
pub trait ProgressSink: Send + Sync {
    fn emit(&self, event: &ProgressEvent);
}

/// Appends events to `progress.ndjson`, one compact JSON object per line.
pub struct NdjsonProgress {
    file: Mutex<File>,
}

impl NdjsonProgress {
    pub fn create(logs_root: &Path) -> std::io::Result<NdjsonProgress> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(logs_root.join("progress.ndjson"))?;
        Ok(NdjsonProgress {
            file: Mutex::new(file),
        })
    }
}

impl ProgressSink for NdjsonProgress {
    fn emit(&self, event: &ProgressEvent) {
        let line = match serde_json::to_string(event) {
            Ok(line) => line,
            Err(err) => {
                warn!(error = %err, "failed to encode progress event");
                return;
            }
        };
        let mut file = match self.file.lock() {
            Ok(file) => file,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Err(err) = writeln!(file, "{line}") {
            warn!(error = %err, "failed to append progress event");
        }
    }
}

/// Discards all events; useful in unit tests.
pub struct NullProgress;

impl ProgressSink for NullProgress {
    fn emit(&self, _event: &ProgressEvent) {}
}
