//! Tool-call hooks.
//!
//! `tool_hooks.pre` and `tool_hooks.post` are optional shell snippets
//! resolved node-first, graph-second. The pre-hook is a blocking filter in
//! the agent session's tool-call path; the post-hook observes results and is
//! warning-only. Both receive a JSON payload on stdin and have a 30 second
//! timeout.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::io::AsyncWriteExt;
use tracing::warn;

use crate::graph::{Graph, Node};
use crate::llm::client::ToolCallFilter;
use crate::progress::{ProgressEvent, ProgressSink};

const HOOK_TIMEOUT: Duration = Duration::from_secs(30);
/// Post-hook payloads truncate tool output to this many characters.
const POST_OUTPUT_LIMIT: usize = 8000;

/// Resolved hook commands for one stage.
pub struct ToolHooks {
    pre: Option<String>,
    post: Option<String>,
    node_id: String,
    worktree: PathBuf,
    progress: Arc<dyn ProgressSink>,
}

impl ToolHooks {
    /// Resolves hooks for a node (node attrs first, graph attrs second).
    /// Returns `None` when neither hook is configured.
    pub fn resolve(
        graph: &Graph,
        node: &Node,
        worktree: PathBuf,
        progress: Arc<dyn ProgressSink>,
    ) -> Option<ToolHooks> {
        let pre = graph.node_or_graph_attr(node, "tool_hooks.pre").map(str::to_string);
        let post = graph.node_or_graph_attr(node, "tool_hooks.post").map(str::to_string);
        if pre.is_none() && post.is_none() {
            return None;
        }
        Some(ToolHooks {
            pre,
            post,
            node_id: node.id.clone(),
            worktree,
            progress,
        })
    }

    async fn run_hook(
        &self,
        command: &str,
        tool_name: &str,
        call_id: &str,
        payload: &serde_json::Value,
    ) -> std::io::Result<Option<i32>> {
        let mut cmd = tokio::process::Command::new("bash");
        cmd.arg("-c")
            .arg(command)
            .current_dir(&self.worktree)
            .env("KILROY_NODE_ID", &self.node_id)
            .env("KILROY_TOOL_NAME", tool_name)
            .env("KILROY_CALL_ID", call_id)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let mut child = cmd.spawn()?;
        if let Some(mut stdin) = child.stdin.take() {
            let body = serde_json::to_vec(payload).unwrap_or_default();
            let _ = stdin.write_all(&body).await;
            let _ = stdin.shutdown().await;
        }
        match tokio::time::timeout(HOOK_TIMEOUT, child.wait()).await {
            Ok(status) => Ok(status?.code()),
            Err(_) => {
                let _ = child.start_kill();
                Err(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "hook timed out",
                ))
            }
        }
    }

    /// Runs the post-hook after a tool call ends. Never blocks the run.
    pub async fn run_post(&self, tool_name: &str, call_id: &str, output: &str, is_error: bool) {
        let Some(command) = self.post.as_deref() else {
            return;
        };
        let mut truncated = output;
        if truncated.len() > POST_OUTPUT_LIMIT {
            let mut end = POST_OUTPUT_LIMIT;
            while !truncated.is_char_boundary(end) {
                end -= 1;
            }
            truncated = &truncated[..end];
        }
        let payload = json!({
            "hook_type": "post",
            "tool_name": tool_name,
            "call_id": call_id,
            "output": truncated,
            "is_error": is_error,
        });
        match self.run_hook(command, tool_name, call_id, &payload).await {
            Ok(Some(0)) | Ok(None) => {}
            Ok(Some(code)) => {
                warn!(node_id = %self.node_id, tool_name, code, "post-hook exited non-zero");
            }
            Err(err) => {
                warn!(node_id = %self.node_id, tool_name, error = %err, "post-hook failed");
            }
        }
    }
}

#[async_trait]
impl ToolCallFilter for ToolHooks {
    /// Pre-hook: a non-zero exit skips the tool call with the documented
    /// reason. Hook spawn failures are blocking too, since the filter could
    /// not approve the call.
    async fn before_call(
        &self,
        tool_name: &str,
        call_id: &str,
        arguments_json: &str,
    ) -> Result<(), String> {
        let Some(command) = self.pre.as_deref() else {
            return Ok(());
        };
        let payload = json!({
            "hook_type": "pre",
            "tool_name": tool_name,
            "call_id": call_id,
            "arguments_json": arguments_json,
        });
        match self.run_hook(command, tool_name, call_id, &payload).await {
            Ok(Some(0)) | Ok(None) => Ok(()),
            Ok(Some(code)) => {
                self.progress.emit(&ProgressEvent::ToolHookPreSkip {
                    node_id: self.node_id.clone(),
                    tool_name: tool_name.to_string(),
                    exit_code: code,
                });
                Err(format!("Tool call skipped by pre-hook (exit {code})"))
            }
            Err(err) => Err(format!("Tool call skipped by pre-hook ({err})")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::NullProgress;

    fn hooks(pre: Option<&str>, post: Option<&str>, worktree: PathBuf) -> ToolHooks {
        ToolHooks {
            pre: pre.map(str::to_string),
            post: post.map(str::to_string),
            node_id: "n".into(),
            worktree,
            progress: Arc::new(NullProgress),
        }
    }

    /// **Scenario**: A pre-hook exiting 0 approves the call; exit 3 skips it
    /// with the documented reason.
    #[tokio::test]
    async fn pre_hook_approval_and_skip() {
        let tmp = tempfile::tempdir().unwrap();
        let ok = hooks(Some("exit 0"), None, tmp.path().to_path_buf());
        ok.before_call("bash", "c1", "{}").await.unwrap();

        let deny = hooks(Some("exit 3"), None, tmp.path().to_path_buf());
        let reason = deny.before_call("bash", "c1", "{}").await.unwrap_err();
        assert_eq!(reason, "Tool call skipped by pre-hook (exit 3)");
    }

    /// **Scenario**: The pre-hook payload arrives on stdin with the hook env vars set.
    #[tokio::test]
    async fn pre_hook_payload_and_env() {
        let tmp = tempfile::tempdir().unwrap();
        let capture = tmp.path().join("capture.json");
        let command = format!(
            "cat > {} && test \"$KILROY_TOOL_NAME\" = bash && test \"$KILROY_NODE_ID\" = n",
            capture.display()
        );
        let hook = hooks(Some(&command), None, tmp.path().to_path_buf());
        hook.before_call("bash", "call-7", "{\"command\":\"ls\"}").await.unwrap();

        let payload: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&capture).unwrap()).unwrap();
        assert_eq!(payload["hook_type"], "pre");
        assert_eq!(payload["call_id"], "call-7");
        assert_eq!(payload["arguments_json"], "{\"command\":\"ls\"}");
    }

    /// **Scenario**: A failing post-hook is warning-only.
    #[tokio::test]
    async fn post_hook_is_warning_only() {
        let tmp = tempfile::tempdir().unwrap();
        let hook = hooks(None, Some("exit 1"), tmp.path().to_path_buf());
        // Must not panic or error.
        hook.run_post("bash", "c1", "output", false).await;
    }
}
