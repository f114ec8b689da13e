//! CLI backend scenarios driven through shell shims standing in for the
//! provider executables (config `cli_profile = test_shim`).

#![cfg(unix)]

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use attractor::config::{BackendKind, CliProfile, ProviderConfig, RunConfig};
use attractor::llm::CliInvocation;
use attractor::{Edge, EngineBuilder, FinalStatus, Graph, Node, RunOptions};

/// Serializes tests that mutate process-global environment variables.
static ENV_LOCK: Mutex<()> = Mutex::new(());

fn write_shim(dir: &Path, name: &str, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;
    let path = dir.join(name);
    std::fs::write(&path, body).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn shim_config(executable: &Path) -> RunConfig {
    let mut config = RunConfig::default();
    config.llm.cli_profile = CliProfile::TestShim;
    config.llm.providers.insert(
        "openai".to_string(),
        ProviderConfig {
            backend: BackendKind::Cli,
            executable: Some(executable.to_string_lossy().into_owned()),
        },
    );
    config
}

fn codergen_graph() -> Graph {
    let mut graph = Graph::new();
    graph
        .add_node(Node::new("start").with_attr("shape", "Mdiamond"))
        .unwrap();
    graph
        .add_node(
            Node::new("gen")
                .with_attr("llm_provider", "openai")
                .with_attr("llm_model", "gpt-5.2-codex")
                .with_attr("prompt", "make it so"),
        )
        .unwrap();
    graph
        .add_node(Node::new("exit").with_attr("shape", "Msquare"))
        .unwrap();
    graph.add_edge(Edge::new("start", "gen"));
    graph.add_edge(Edge::new("gen", "exit"));
    graph
}

fn invocation(logs_root: &Path) -> CliInvocation {
    serde_json::from_str(
        &std::fs::read_to_string(logs_root.join("gen/cli_invocation.json")).unwrap(),
    )
    .unwrap()
}

/// **Scenario**: CLI schema fallback: the shim rejects `--output-schema`
/// with `invalid_json_schema` and succeeds without it. Expect
/// `schema_fallback_retry=true`, preserved schema-failure logs, and a
/// successful run.
#[tokio::test]
async fn schema_fallback_retry() {
    let _guard = ENV_LOCK.lock().unwrap_or_else(|p| p.into_inner());
    let tmp = tempfile::tempdir().unwrap();
    let logs_root = tmp.path().join("logs");
    let worktree = tmp.path().join("wt");
    std::fs::create_dir_all(&worktree).unwrap();

    let shim = write_shim(
        tmp.path(),
        "codex-shim",
        r#"#!/bin/bash
for arg in "$@"; do
  if [ "$arg" = "--output-schema" ]; then
    echo "invalid_json_schema: schema rejected by provider" >&2
    exit 1
  fi
done
cat > /dev/null
echo '{"type":"result","result":"done"}'
"#,
    );

    let mut options = RunOptions::new(&logs_root, &worktree);
    options.run_id = Some("run-schema-fallback".into());
    options.allow_test_shim = true;
    let engine = EngineBuilder::new(codergen_graph(), options)
        .config(shim_config(&shim))
        .build()
        .unwrap();
    let result = engine.run().await.unwrap();

    assert_eq!(result.outcome.status, FinalStatus::Success);

    let record = invocation(&logs_root);
    assert!(record.schema_fallback_retry);
    assert_eq!(record.schema_fallback_reason.as_deref(), Some("schema_validation_failure"));
    assert!(logs_root.join("gen/stdout.schema_failure.log").is_file());
    assert!(logs_root.join("gen/stderr.schema_failure.log").is_file());
    let preserved =
        std::fs::read_to_string(logs_root.join("gen/stderr.schema_failure.log")).unwrap();
    assert!(preserved.contains("invalid_json_schema"));
}

/// **Scenario**: Total timeout then success: attempt 1 sleeps past
/// `KILROY_CODEX_TOTAL_TIMEOUT=1s` and is killed; attempt 2 produces output.
/// Expect two attempts, preserved `stdout.timeout_failure_1.log`,
/// `timeout_fallback_retry=true`, and a successful run.
#[tokio::test]
async fn total_timeout_then_success() {
    let _guard = ENV_LOCK.lock().unwrap_or_else(|p| p.into_inner());
    std::env::set_var("KILROY_CODEX_TOTAL_TIMEOUT", "1s");
    std::env::set_var("KILROY_CODEX_TIMEOUT_MAX_RETRIES", "1");

    let tmp = tempfile::tempdir().unwrap();
    let logs_root = tmp.path().join("logs");
    let worktree = tmp.path().join("wt");
    std::fs::create_dir_all(&worktree).unwrap();

    // The marker lives in the worktree (the shim's cwd), so the second
    // attempt takes the fast path.
    let shim = write_shim(
        tmp.path(),
        "codex-shim",
        r#"#!/bin/bash
out=""
prev=""
for arg in "$@"; do
  if [ "$prev" = "-o" ]; then out="$arg"; fi
  prev="$arg"
done
if [ ! -f attempt_marker ]; then
  touch attempt_marker
  sleep 30
  exit 1
fi
cat > /dev/null
if [ -n "$out" ]; then printf '{"final":"ok","summary":"done"}' > "$out"; fi
echo '{"type":"result","result":"ok"}'
"#,
    );

    let mut options = RunOptions::new(&logs_root, &worktree);
    options.run_id = Some("run-timeout-retry".into());
    options.allow_test_shim = true;
    let engine = EngineBuilder::new(codergen_graph(), options)
        .config(shim_config(&shim))
        .build()
        .unwrap();
    let result = engine.run().await;

    std::env::remove_var("KILROY_CODEX_TOTAL_TIMEOUT");
    std::env::remove_var("KILROY_CODEX_TIMEOUT_MAX_RETRIES");

    let result = result.unwrap();
    assert_eq!(result.outcome.status, FinalStatus::Success);
    assert!(
        logs_root.join("gen/stdout.timeout_failure_1.log").is_file(),
        "first attempt's logs are preserved"
    );
    let record = invocation(&logs_root);
    assert!(record.timeout_fallback_retry);
    assert!(worktree.join("attempt_marker").is_file());
}

/// **Scenario**: A failing CLI maps to a classified fail outcome carrying the
/// provider-prefixed reason from the last stderr line, and the run routes it
/// (here: no fail edge, single unconditional edge to exit, so the verdict is
/// a fail).
#[tokio::test]
async fn cli_failure_maps_to_outcome() {
    let _guard = ENV_LOCK.lock().unwrap_or_else(|p| p.into_inner());
    let tmp = tempfile::tempdir().unwrap();
    let logs_root = tmp.path().join("logs");
    let worktree = tmp.path().join("wt");
    std::fs::create_dir_all(&worktree).unwrap();

    let shim = write_shim(
        tmp.path(),
        "codex-shim",
        r#"#!/bin/bash
cat > /dev/null
echo "model not found: gpt-nonsense" >&2
exit 2
"#,
    );

    let mut options = RunOptions::new(&logs_root, &worktree);
    options.run_id = Some("run-cli-failure".into());
    options.allow_test_shim = true;
    let engine = EngineBuilder::new(codergen_graph(), options)
        .config(shim_config(&shim))
        .build()
        .unwrap();
    let result = engine.run().await.unwrap();

    assert_eq!(result.outcome.status, FinalStatus::Fail);

    let status: attractor::Outcome = serde_json::from_str(
        &std::fs::read_to_string(logs_root.join("gen/status.json")).unwrap(),
    )
    .unwrap();
    assert_eq!(
        status.failure_class(),
        Some(attractor::FailureClass::Deterministic)
    );
    let reason = status.failure_reason.unwrap();
    assert!(reason.starts_with("openai CLI failed:"), "{reason}");
    assert!(reason.contains("model not found"));
    assert!(logs_root.join("gen/stdout.log").is_file());
    assert!(logs_root.join("gen/stderr.log").is_file());
    assert!(logs_root.join("gen/cli_timing.json").is_file());

    // One attempt only: deterministic failures are blocked by the gate.
    let events: Vec<serde_json::Value> =
        std::fs::read_to_string(logs_root.join("progress.ndjson"))
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
    assert!(events.iter().any(|e| e["event"] == "stage_retry_blocked"));
    assert!(!events.iter().any(|e| e["event"] == "stage_retry_sleep"));
}
