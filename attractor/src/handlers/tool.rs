//! Tool handler: shell-command stages.
//!
//! Runs `bash -c <tool_command>` in the worktree under the composed base
//! environment, bounded by `min(node.timeout, stage_timeout)`. Timeouts
//! harvest a partial-status artifact so later stages can inspect what the
//! command left behind.

use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use crate::classify::FailureClass;
use crate::context::RunContext;
use crate::error::EngineError;
use crate::exec::StageExecution;
use crate::graph::{Graph, Node};
use crate::outcome::{Outcome, META_TIMEOUT};

use super::Handler;

pub struct ToolHandler;

#[async_trait]
impl Handler for ToolHandler {
    async fn execute(
        &self,
        ctx: &RunContext,
        exec: &StageExecution,
        _graph: &Graph,
        node: &Node,
    ) -> Result<Outcome, EngineError> {
        let Some(command) = node.attr("tool_command") else {
            return Ok(Outcome::classified_fail(
                format!("node {} has no tool_command", node.id),
                FailureClass::Deterministic,
                "graph_config|tool|missing-command",
            ));
        };

        let timeout = exec.effective_timeout(node);
        let stdout_path = exec.artifact_path("stdout.log")?;
        let stderr_path = exec.artifact_path("stderr.log")?;

        let mut cmd = tokio::process::Command::new("bash");
        cmd.arg("-c")
            .arg(command)
            .current_dir(&exec.worktree)
            .stdin(Stdio::null())
            .stdout(Stdio::from(std::fs::File::create(&stdout_path)?))
            .stderr(Stdio::from(std::fs::File::create(&stderr_path)?))
            .kill_on_drop(true);
        cmd.env_clear();
        for (key, value) in &exec.base_env {
            cmd.env(key, value);
        }

        debug!(node_id = %node.id, command, "running tool stage");
        let started = Instant::now();
        let mut child = cmd.spawn()?;

        let status = tokio::select! {
            status = child.wait() => Some(status?),
            _ = ctx.cancel_token().cancelled() => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                return Ok(Outcome::classified_fail(
                    "run cancelled",
                    FailureClass::Cancelled,
                    "cancelled|tool|run",
                ));
            }
            _ = sleep_until_limit(timeout) => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                None
            }
        };
        let elapsed = started.elapsed();

        match status {
            Some(status) if status.success() => {
                debug!(node_id = %node.id, elapsed_ms = elapsed.as_millis() as u64, "tool stage succeeded");
                Ok(Outcome::success())
            }
            Some(status) => {
                let code = status.code().unwrap_or(-1);
                let stderr = std::fs::read_to_string(&stderr_path).unwrap_or_default();
                let reason = first_nonempty_line(&stderr)
                    .unwrap_or_else(|| format!("<exit {code}>"));
                // Plain command failures carry no failure_class: they stay
                // eligible for the retry budget, and the routing heuristic
                // classifies them from the reason text.
                Ok(Outcome::fail(reason))
            }
            None => {
                // Timeout: record what the command managed to produce.
                let limit = timeout.unwrap_or_default();
                exec.write_json(
                    "partial_status.json",
                    &json!({ "harvested": true, "timeout": format!("{}ms", limit.as_millis()) }),
                )?;
                let mut outcome = Outcome::classified_fail(
                    format!("tool timed out after {}ms", limit.as_millis()),
                    FailureClass::TransientInfra,
                    "tool_timeout|tool|stage",
                );
                outcome.meta.insert(META_TIMEOUT.into(), Value::Bool(true));
                Ok(outcome)
            }
        }
    }
}

/// Pending future that resolves at the timeout, or never when unbounded.
async fn sleep_until_limit(timeout: Option<Duration>) {
    match timeout {
        Some(limit) => tokio::time::sleep(limit).await,
        None => std::future::pending().await,
    }
}

fn first_nonempty_line(text: &str) -> Option<String> {
    text.lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cxdb::NullContentDb;
    use crate::outcome::Status;
    use crate::progress::NullProgress;
    use std::sync::Arc;

    fn exec_in(dir: &std::path::Path, stage_timeout: Option<Duration>) -> StageExecution {
        StageExecution {
            run_id: "run-1".into(),
            logs_root: dir.to_path_buf(),
            stage_dir: dir.join("t"),
            worktree: dir.to_path_buf(),
            stage_timeout,
            base_env: std::env::vars().collect(),
            progress: Arc::new(NullProgress),
            content_db: Arc::new(NullContentDb),
            model_override: None,
            hooks: None,
            attempt: 1,
        }
    }

    /// **Scenario**: Exit 0 maps to success and stdout is captured.
    #[tokio::test]
    async fn success_captures_stdout() {
        let tmp = tempfile::tempdir().unwrap();
        let exec = exec_in(tmp.path(), None);
        let graph = Graph::new();
        let node = Node::new("t").with_attr("tool_command", "echo hello");

        let outcome = ToolHandler.execute(&RunContext::new(), &exec, &graph, &node).await.unwrap();
        assert_eq!(outcome.status, Status::Success);
        let stdout = std::fs::read_to_string(exec.stage_dir.join("stdout.log")).unwrap();
        assert!(stdout.contains("hello"));
    }

    /// **Scenario**: Non-zero exit fails with the first non-empty stderr line.
    #[tokio::test]
    async fn failure_uses_first_stderr_line() {
        let tmp = tempfile::tempdir().unwrap();
        let exec = exec_in(tmp.path(), None);
        let graph = Graph::new();
        let node = Node::new("t").with_attr("tool_command", "echo nope >&2; exit 3");

        let outcome = ToolHandler.execute(&RunContext::new(), &exec, &graph, &node).await.unwrap();
        assert_eq!(outcome.status, Status::Fail);
        assert_eq!(outcome.failure_reason.as_deref(), Some("nope"));
    }

    /// **Scenario**: Silent non-zero exit falls back to `<exit N>`.
    #[tokio::test]
    async fn silent_failure_reports_exit_code() {
        let tmp = tempfile::tempdir().unwrap();
        let exec = exec_in(tmp.path(), None);
        let graph = Graph::new();
        let node = Node::new("t").with_attr("tool_command", "exit 7");

        let outcome = ToolHandler.execute(&RunContext::new(), &exec, &graph, &node).await.unwrap();
        assert_eq!(outcome.failure_reason.as_deref(), Some("<exit 7>"));
    }

    /// **Scenario**: Timeout kills the command, stamps meta.timeout and harvests
    /// partial_status.json.
    #[tokio::test]
    async fn timeout_harvests_partial_status() {
        let tmp = tempfile::tempdir().unwrap();
        let exec = exec_in(tmp.path(), Some(Duration::from_millis(100)));
        let graph = Graph::new();
        let node = Node::new("t").with_attr("tool_command", "sleep 5");

        let outcome = ToolHandler.execute(&RunContext::new(), &exec, &graph, &node).await.unwrap();
        assert_eq!(outcome.status, Status::Fail);
        assert_eq!(outcome.meta.get(META_TIMEOUT), Some(&Value::Bool(true)));

        let partial: Value = serde_json::from_str(
            &std::fs::read_to_string(exec.stage_dir.join("partial_status.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(partial["harvested"], true);
    }

    /// **Scenario**: Node timeout is capped by the stage-wide timeout.
    #[tokio::test]
    async fn node_timeout_capped_by_stage_timeout() {
        let tmp = tempfile::tempdir().unwrap();
        let exec = exec_in(tmp.path(), Some(Duration::from_millis(100)));
        let graph = Graph::new();
        // Node asks for 60s; the stage limit of 100ms must win.
        let node = Node::new("t")
            .with_attr("tool_command", "sleep 5")
            .with_attr("timeout", "60s");

        let started = Instant::now();
        let outcome = ToolHandler.execute(&RunContext::new(), &exec, &graph, &node).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(4));
        assert_eq!(outcome.status, Status::Fail);
    }

    /// **Scenario**: A missing tool_command is a deterministic config failure.
    #[tokio::test]
    async fn missing_command_is_deterministic() {
        let tmp = tempfile::tempdir().unwrap();
        let exec = exec_in(tmp.path(), None);
        let graph = Graph::new();
        let node = Node::new("t");

        let outcome = ToolHandler.execute(&RunContext::new(), &exec, &graph, &node).await.unwrap();
        assert_eq!(outcome.failure_class(), Some(FailureClass::Deterministic));
    }
}
