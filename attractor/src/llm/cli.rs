//! Subprocess CLI backend.
//!
//! Launches provider CLIs (`codex`, `claude`, `gemini`) with per-provider
//! argv tables, captures stdout/stderr to stage artifacts, and for
//! Codex-like launches adds an isolated home, structured-output negotiation
//! and an idle watchdog that kills the whole process group.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::classify::{classify_cli_failure, FailureClass};
use crate::config::RunConfig;
use crate::context::RunContext;
use crate::envbuild::{absolutize_state_vars, IsolatedHome};
use crate::error::EngineError;
use crate::exec::StageExecution;
use crate::graph::{parse_duration, parse_int, Node};
use crate::outcome::{Outcome, META_TIMEOUT};

use super::RouterOutput;

/// Per-provider CLI capability flags, set once at router construction.
#[derive(Debug, Clone, Default)]
pub struct CliCapabilities {
    pub supports_verbose: bool,
}

/// How the prompt reaches the subprocess.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptMode {
    Stdin,
    Arg,
}

/// Invocation record, rewritten on every retry so fallback flags accumulate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CliInvocation {
    pub provider: String,
    pub model: String,
    pub executable: String,
    /// Argv with the literal `<prompt>` placeholder substituted for the prompt bytes.
    pub argv: Vec<String>,
    pub working_dir: String,
    pub prompt_mode: PromptMode,
    pub prompt_bytes: usize,
    pub env_mode: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env_path_overrides: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_schema_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub structured_output_path: Option<String>,
    #[serde(default)]
    pub schema_fallback_retry: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_fallback_reason: Option<String>,
    #[serde(default)]
    pub argv_schema_retry: bool,
    #[serde(default)]
    pub state_db_fallback_retry: bool,
    #[serde(default)]
    pub timeout_fallback_retry: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CliTiming {
    pub duration_ms: u64,
    pub exit_code: Option<i32>,
}

/// Why the watchdog killed the subprocess, if it did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KillReason {
    Idle(Duration),
    Total(Duration),
    StageTimeout(Duration),
    Cancelled,
}

struct AttemptResult {
    exit_code: Option<i32>,
    kill: Option<KillReason>,
    stderr_tail: String,
}

/// Negotiation state threaded through the retry-adjustment loop.
struct AttemptPlan {
    use_schema: bool,
    home_name: String,
    schema_fallback_retry: bool,
    schema_fallback_reason: Option<String>,
    argv_schema_retry: bool,
    state_db_fallback_retry: bool,
    timeout_fallback_retry: bool,
    timeout_retries_used: u32,
}

pub struct CliBackend {
    capabilities: BTreeMap<String, CliCapabilities>,
}

impl Default for CliBackend {
    fn default() -> Self {
        let mut capabilities = BTreeMap::new();
        capabilities.insert(
            "anthropic".to_string(),
            CliCapabilities {
                supports_verbose: true,
            },
        );
        CliBackend { capabilities }
    }
}

impl CliBackend {
    pub fn with_capabilities(capabilities: BTreeMap<String, CliCapabilities>) -> Self {
        CliBackend { capabilities }
    }

    /// Runs the CLI for one stage. Recoverable failures come back as a fail
    /// outcome inside [`RouterOutput`]; only setup errors are `Err`.
    pub async fn run(
        &self,
        ctx: &RunContext,
        exec: &StageExecution,
        node: &Node,
        config: &RunConfig,
        provider: &str,
        model: &str,
        prompt: &str,
    ) -> Result<RouterOutput, EngineError> {
        let executable = executable_for(config, provider)?;
        let codex_like = is_codex_like(provider, &executable);
        let (base_argv, prompt_mode) =
            default_argv(provider, model, &exec.worktree, self.capabilities.get(provider));

        let mut plan = AttemptPlan {
            use_schema: codex_like,
            home_name: "codex-home".to_string(),
            schema_fallback_retry: false,
            schema_fallback_reason: None,
            argv_schema_retry: false,
            state_db_fallback_retry: false,
            timeout_fallback_retry: false,
            timeout_retries_used: 0,
        };
        let timeout_max_retries =
            parse_int(std::env::var("KILROY_CODEX_TIMEOUT_MAX_RETRIES").ok().as_deref(), 1) as u32;

        loop {
            let result = self
                .launch_attempt(
                    ctx, exec, node, provider, model, prompt, &executable, &base_argv,
                    prompt_mode, codex_like, &plan,
                )
                .await?;

            let stderr_lower = result.stderr_tail.to_lowercase();

            // Schema negotiation: drop --output-schema after a schema rejection.
            if codex_like
                && plan.use_schema
                && !plan.schema_fallback_retry
                && (stderr_lower.contains("invalid_json_schema")
                    || stderr_lower.contains("invalid schema"))
            {
                preserve_logs(&exec.stage_dir, "schema_failure");
                plan.use_schema = false;
                plan.schema_fallback_retry = true;
                plan.schema_fallback_reason = Some("schema_validation_failure".to_string());
                warn!(node_id = %node.id, "output schema rejected; retrying without --output-schema");
                continue;
            }

            // State-db discrepancy: rebuild the isolated home under a new suffix.
            if codex_like
                && !plan.state_db_fallback_retry
                && (stderr_lower.contains("state db missing rollout path")
                    || stderr_lower.contains("record_discrepancy"))
            {
                preserve_logs(&exec.stage_dir, "state_db_failure");
                plan.home_name = "codex-home-retry1".to_string();
                plan.state_db_fallback_retry = true;
                warn!(node_id = %node.id, "codex state db discrepancy; rebuilding isolated home");
                continue;
            }

            // Total-timeout kill: preserve numbered logs and retry within budget.
            if let Some(KillReason::Total(_)) = result.kill {
                if plan.timeout_retries_used < timeout_max_retries {
                    plan.timeout_retries_used += 1;
                    plan.timeout_fallback_retry = true;
                    preserve_logs(
                        &exec.stage_dir,
                        &format!("timeout_failure_{}", plan.timeout_retries_used),
                    );
                    warn!(node_id = %node.id, retry = plan.timeout_retries_used, "codex total timeout; retrying");
                    continue;
                }
            }

            // Success path, with unknown-keys structured-output negotiation.
            if result.exit_code == Some(0) && result.kill.is_none() {
                let text = if codex_like && plan.use_schema {
                    match validate_structured(&exec.stage_dir.join("output.json")) {
                        StructuredVerdict::Ok(final_text) => final_text,
                        StructuredVerdict::UnknownKeys(payload) => {
                            if !plan.argv_schema_retry {
                                warn!(
                                    node_id = %node.id,
                                    "structured output carried unknown keys; retrying without --output-schema"
                                );
                                let _ = exec
                                    .write_json("structured_output_unknown_keys.json", &payload);
                                plan.use_schema = false;
                                plan.argv_schema_retry = true;
                                continue;
                            }
                            extract_text(&read_stage_file(&exec.stage_dir, "stdout.log"))
                        }
                        StructuredVerdict::Invalid(reason) => {
                            let (class, signature) = (
                                FailureClass::Deterministic,
                                format!("schema_validation|{provider}|structured-output"),
                            );
                            let outcome = Outcome::classified_fail(
                                format!("{provider} CLI failed: {reason}"),
                                class,
                                signature,
                            );
                            return Ok(RouterOutput {
                                text: String::new(),
                                outcome: Some(outcome),
                                provider: provider.to_string(),
                                model: model.to_string(),
                            });
                        }
                    }
                } else {
                    extract_text(&read_stage_file(&exec.stage_dir, "stdout.log"))
                };
                return Ok(RouterOutput {
                    text,
                    outcome: None,
                    provider: provider.to_string(),
                    model: model.to_string(),
                });
            }

            // Failure path: classify and map to a recoverable outcome.
            let run_error = match result.kill {
                Some(KillReason::Idle(idle)) => Some(format!(
                    "codex idle timeout after {} with no output",
                    format_duration(idle)
                )),
                Some(KillReason::Total(total)) => Some(format!(
                    "codex total timeout after {}",
                    format_duration(total)
                )),
                Some(KillReason::StageTimeout(limit)) => Some(format!(
                    "{provider} CLI timed out after {}",
                    format_duration(limit)
                )),
                Some(KillReason::Cancelled) => Some("run cancelled".to_string()),
                None => None,
            };

            let (class, signature) = if matches!(result.kill, Some(KillReason::Cancelled)) {
                (
                    FailureClass::Cancelled,
                    format!("cancelled|{provider}|run"),
                )
            } else {
                classify_cli_failure(
                    provider,
                    &result.stderr_tail,
                    run_error.as_deref(),
                    result.exit_code,
                )
            };

            let reason = match last_stderr_line(&result.stderr_tail) {
                Some(line) => format!("{provider} CLI failed: {line}"),
                None => run_error.clone().unwrap_or_else(|| match result.exit_code {
                    Some(code) => format!("{provider} CLI failed: <exit {code}>"),
                    None => format!("{provider} CLI failed: killed"),
                }),
            };

            let mut outcome = Outcome::classified_fail(reason, class, signature);
            if matches!(
                result.kill,
                Some(KillReason::Idle(_) | KillReason::Total(_) | KillReason::StageTimeout(_))
            ) {
                outcome.meta.insert(META_TIMEOUT.into(), Value::Bool(true));
            }
            return Ok(RouterOutput {
                text: String::new(),
                outcome: Some(outcome),
                provider: provider.to_string(),
                model: model.to_string(),
            });
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn launch_attempt(
        &self,
        ctx: &RunContext,
        exec: &StageExecution,
        node: &Node,
        provider: &str,
        model: &str,
        prompt: &str,
        executable: &str,
        base_argv: &[String],
        prompt_mode: PromptMode,
        codex_like: bool,
        plan: &AttemptPlan,
    ) -> Result<AttemptResult, EngineError> {
        let stage_dir = &exec.stage_dir;
        std::fs::create_dir_all(stage_dir)?;
        let stdout_path = stage_dir.join("stdout.log");
        let stderr_path = stage_dir.join("stderr.log");
        let schema_path = stage_dir.join("output_schema.json");
        let output_path = stage_dir.join("output.json");

        let mut argv: Vec<String> = base_argv.to_vec();
        let mut output_schema_path = None;
        let mut structured_output_path = None;
        if codex_like && plan.use_schema {
            std::fs::write(&schema_path, serde_json::to_string_pretty(&default_schema())?)?;
            argv.push("--output-schema".to_string());
            argv.push(schema_path.to_string_lossy().into_owned());
            argv.push("-o".to_string());
            argv.push(output_path.to_string_lossy().into_owned());
            output_schema_path = Some(schema_path.to_string_lossy().into_owned());
            structured_output_path = Some(output_path.to_string_lossy().into_owned());
        }

        // Record argv keeps the literal placeholder; the real argv carries bytes.
        let record_argv = argv.clone();
        let real_argv = match prompt_mode {
            PromptMode::Stdin => argv,
            PromptMode::Arg => insert_prompt(argv, prompt),
        };

        let env_path_overrides = absolutize_state_vars(&exec.worktree);
        let mut env = exec.base_env.clone();
        for (key, value) in &env_path_overrides {
            if let Some(slot) = env.iter_mut().find(|(k, _)| k == key) {
                slot.1 = value.clone();
            } else {
                env.push((key.clone(), value.clone()));
            }
        }
        let env_mode = if codex_like {
            let state_base = std::env::var("KILROY_CODEX_STATE_BASE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| exec.logs_root.join(".cli-state"));
            let home = IsolatedHome::build(&state_base, stage_dir, &plan.home_name)?;
            for (key, value) in home.env_overrides() {
                if let Some(slot) = env.iter_mut().find(|(k, _)| *k == key) {
                    slot.1 = value;
                } else {
                    env.push((key, value));
                }
            }
            "isolated"
        } else {
            "inherit"
        };

        let invocation = CliInvocation {
            provider: provider.to_string(),
            model: model.to_string(),
            executable: executable.to_string(),
            argv: record_argv,
            working_dir: exec.worktree.to_string_lossy().into_owned(),
            prompt_mode,
            prompt_bytes: prompt.len(),
            env_mode: env_mode.to_string(),
            env_path_overrides,
            output_schema_path,
            structured_output_path,
            schema_fallback_retry: plan.schema_fallback_retry,
            schema_fallback_reason: plan.schema_fallback_reason.clone(),
            argv_schema_retry: plan.argv_schema_retry,
            state_db_fallback_retry: plan.state_db_fallback_retry,
            timeout_fallback_retry: plan.timeout_fallback_retry,
        };
        exec.write_json("cli_invocation.json", &invocation)?;

        let stdout_file = std::fs::File::create(&stdout_path)?;
        let stderr_file = std::fs::File::create(&stderr_path)?;

        let mut cmd = tokio::process::Command::new(executable);
        cmd.args(&real_argv)
            .current_dir(&exec.worktree)
            .stdout(Stdio::from(stdout_file))
            .stderr(Stdio::from(stderr_file))
            .kill_on_drop(true);
        cmd.env_clear();
        for (key, value) in &env {
            cmd.env(key, value);
        }
        if prompt_mode == PromptMode::Stdin {
            cmd.stdin(Stdio::piped());
        } else {
            cmd.stdin(Stdio::null());
        }
        #[cfg(unix)]
        if codex_like {
            cmd.process_group(0);
        }

        debug!(node_id = %node.id, executable, provider, "launching CLI stage");
        let started = Instant::now();
        let mut child = cmd.spawn().map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                EngineError::MissingExecutable(provider.to_string())
            } else {
                EngineError::Io(err)
            }
        })?;

        if prompt_mode == PromptMode::Stdin {
            if let Some(mut stdin) = child.stdin.take() {
                // A fast-failing CLI may exit before reading the prompt;
                // a broken pipe here is part of the failure being captured.
                if let Err(err) = stdin.write_all(prompt.as_bytes()).await {
                    debug!(error = %err, "prompt write failed");
                }
                let _ = stdin.shutdown().await;
            }
        }

        let (status, kill) = self
            .supervise(ctx, exec, node, codex_like, &mut child, &stdout_path, &stderr_path)
            .await?;
        let duration = started.elapsed();

        exec.write_json(
            "cli_timing.json",
            &CliTiming {
                duration_ms: duration.as_millis() as u64,
                exit_code: status.code(),
            },
        )?;

        postprocess_stdout(stage_dir);

        Ok(AttemptResult {
            exit_code: status.code(),
            kill,
            stderr_tail: read_tail(&stderr_path, 4096),
        })
    }

    /// Waits for the child, racing the idle watchdog (Codex-like only), the
    /// total/stage timeout and run cancellation. Exactly one `wait()`
    /// completion is consumed; kills are delivered by pid so the wait stays
    /// authoritative.
    async fn supervise(
        &self,
        ctx: &RunContext,
        exec: &StageExecution,
        node: &Node,
        codex_like: bool,
        child: &mut tokio::process::Child,
        stdout_path: &Path,
        stderr_path: &Path,
    ) -> std::io::Result<(std::process::ExitStatus, Option<KillReason>)> {
        let pid = child.id();
        let idle_timeout = parse_duration(
            std::env::var("KILROY_CODEX_IDLE_TIMEOUT").ok().as_deref(),
            Duration::from_secs(120),
        );
        let kill_grace = parse_duration(
            std::env::var("KILROY_CODEX_KILL_GRACE").ok().as_deref(),
            Duration::from_secs(2),
        );
        let total_timeout = std::env::var("KILROY_CODEX_TOTAL_TIMEOUT")
            .ok()
            .map(|raw| parse_duration(Some(&raw), Duration::from_secs(3600)));
        let stage_limit = exec.effective_timeout(node);

        let started = Instant::now();
        let mut last_sizes = (0u64, 0u64);
        let mut last_growth = Instant::now();
        let mut kill: Option<KillReason> = None;
        let mut poll = tokio::time::interval(Duration::from_millis(250));
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let status = loop {
            tokio::select! {
                status = child.wait() => break status?,
                _ = ctx.cancel_token().cancelled(), if kill.is_none() => {
                    kill = Some(KillReason::Cancelled);
                    initiate_kill(child, pid, codex_like, kill_grace);
                }
                _ = poll.tick(), if kill.is_none() => {
                    if codex_like {
                        let sizes = (file_len(stdout_path), file_len(stderr_path));
                        if sizes != last_sizes {
                            last_sizes = sizes;
                            last_growth = Instant::now();
                        } else if last_growth.elapsed() >= idle_timeout {
                            kill = Some(KillReason::Idle(idle_timeout));
                            initiate_kill(child, pid, codex_like, kill_grace);
                        }
                        if kill.is_none() {
                            if let Some(total) = total_timeout {
                                if started.elapsed() >= total {
                                    kill = Some(KillReason::Total(total));
                                    initiate_kill(child, pid, codex_like, kill_grace);
                                }
                            }
                        }
                    }
                    if kill.is_none() {
                        if let Some(limit) = stage_limit {
                            if started.elapsed() >= limit {
                                kill = Some(KillReason::StageTimeout(limit));
                                initiate_kill(child, pid, codex_like, kill_grace);
                            }
                        }
                    }
                }
            }
        };
        Ok((status, kill))
    }
}

/// SIGTERM the process group now; escalate to SIGKILL after the grace period
/// from a detached task. Non-group launches fall back to the direct child.
fn initiate_kill(
    child: &mut tokio::process::Child,
    pid: Option<u32>,
    process_group: bool,
    grace: Duration,
) {
    #[cfg(unix)]
    if process_group {
        if let Some(pid) = pid {
            signal_group(pid, libc::SIGTERM);
            tokio::spawn(async move {
                tokio::time::sleep(grace).await;
                signal_group(pid, libc::SIGKILL);
            });
            return;
        }
    }
    let _ = (pid, grace);
    let _ = child.start_kill();
}

#[cfg(unix)]
fn signal_group(pid: u32, signal: i32) {
    // SAFETY: signals the process group created at spawn; a stale pid is a
    // no-op error from kill(2).
    unsafe {
        libc::kill(-(pid as i32), signal);
    }
}

fn executable_for(config: &RunConfig, provider: &str) -> Result<String, EngineError> {
    if let Some(provider_cfg) = config.llm.providers.get(provider) {
        if let Some(executable) = &provider_cfg.executable {
            return Ok(executable.clone());
        }
    }
    let (env_var, default) = match provider {
        "openai" => ("KILROY_CODEX_PATH", "codex"),
        "anthropic" => ("KILROY_CLAUDE_PATH", "claude"),
        "google" => ("KILROY_GEMINI_PATH", "gemini"),
        other => return Err(EngineError::MissingExecutable(other.to_string())),
    };
    Ok(std::env::var(env_var).unwrap_or_else(|_| default.to_string()))
}

fn is_codex_like(provider: &str, executable: &str) -> bool {
    if provider == "openai" {
        return true;
    }
    Path::new(executable)
        .file_name()
        .and_then(|name| name.to_str())
        .map(|name| name.starts_with("codex"))
        .unwrap_or(false)
}

/// Per-provider default argv (with the prompt still absent) and prompt mode.
fn default_argv(
    provider: &str,
    model: &str,
    worktree: &Path,
    capabilities: Option<&CliCapabilities>,
) -> (Vec<String>, PromptMode) {
    match provider {
        "anthropic" => {
            let mut argv = vec![
                "-p".to_string(),
                "--output-format".to_string(),
                "stream-json".to_string(),
                "--model".to_string(),
                model.to_string(),
            ];
            if capabilities.map(|c| c.supports_verbose).unwrap_or(false) {
                argv.push("--verbose".to_string());
            }
            (argv, PromptMode::Arg)
        }
        "google" => (
            vec![
                "-p".to_string(),
                "--output-format".to_string(),
                "stream-json".to_string(),
                "--yolo".to_string(),
                "--model".to_string(),
                model.to_string(),
            ],
            PromptMode::Arg,
        ),
        // openai / codex-like default
        _ => (
            vec![
                "exec".to_string(),
                "--json".to_string(),
                "--sandbox".to_string(),
                "workspace-write".to_string(),
                "-m".to_string(),
                model.to_string(),
                "-C".to_string(),
                worktree.to_string_lossy().into_owned(),
            ],
            PromptMode::Stdin,
        ),
    }
}

/// Inserts the prompt immediately after `-p` / `--print` / `--prompt`, or
/// appends it when no such flag is present.
fn insert_prompt(mut argv: Vec<String>, prompt: &str) -> Vec<String> {
    let position = argv
        .iter()
        .position(|arg| arg == "-p" || arg == "--print" || arg == "--prompt");
    match position {
        Some(index) => argv.insert(index + 1, prompt.to_string()),
        None => argv.push(prompt.to_string()),
    }
    argv
}

/// Default output schema requiring `final` and `summary` string fields.
fn default_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "final": { "type": "string" },
            "summary": { "type": "string" }
        },
        "required": ["final", "summary"],
        "additionalProperties": false
    })
}

enum StructuredVerdict {
    Ok(String),
    UnknownKeys(Value),
    Invalid(String),
}

/// The parsed payload must be an object with exactly `final` and `summary`
/// as strings; extra keys trigger the no-schema retry, missing or non-string
/// required keys are a classified failure.
fn validate_structured(path: &Path) -> StructuredVerdict {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) => return StructuredVerdict::Invalid(format!("structured output missing: {err}")),
    };
    let value: Value = match serde_json::from_str(&raw) {
        Ok(value) => value,
        Err(err) => return StructuredVerdict::Invalid(format!("structured output not JSON: {err}")),
    };
    let Some(object) = value.as_object() else {
        return StructuredVerdict::Invalid("structured output is not an object".to_string());
    };
    for key in ["final", "summary"] {
        match object.get(key) {
            Some(Value::String(_)) => {}
            Some(_) => {
                return StructuredVerdict::Invalid(format!(
                    "structured output key {key} is not a string"
                ))
            }
            None => {
                return StructuredVerdict::Invalid(format!("structured output missing key {key}"))
            }
        }
    }
    if object.keys().any(|key| key != "final" && key != "summary") {
        return StructuredVerdict::UnknownKeys(value.clone());
    }
    match object.get("final") {
        Some(Value::String(text)) => StructuredVerdict::Ok(text.clone()),
        _ => StructuredVerdict::Invalid("structured output missing key final".to_string()),
    }
}

/// Best-effort stdout post-processing: verbatim copy to `events.ndjson`,
/// plus `events.json` when every non-blank line parses as JSON.
fn postprocess_stdout(stage_dir: &Path) {
    let stdout_path = stage_dir.join("stdout.log");
    let Ok(raw) = std::fs::read_to_string(&stdout_path) else {
        return;
    };
    if let Err(err) = std::fs::write(stage_dir.join("events.ndjson"), &raw) {
        warn!(error = %err, "failed to write events.ndjson");
        return;
    }
    let mut events = Vec::new();
    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<Value>(line) {
            Ok(value) => events.push(value),
            Err(_) => return,
        }
    }
    if let Ok(body) = serde_json::to_string_pretty(&events) {
        let _ = std::fs::write(stage_dir.join("events.json"), body);
    }
}

/// Extracts the reply text from a stream-json stdout: last JSON line with a
/// `final` / `result` / `text` string field wins, else the raw stdout.
fn extract_text(stdout: &str) -> String {
    for line in stdout.lines().rev() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Ok(value) = serde_json::from_str::<Value>(line) {
            for key in ["final", "result", "text"] {
                if let Some(text) = value.get(key).and_then(Value::as_str) {
                    return text.to_string();
                }
            }
        }
    }
    stdout.trim().to_string()
}

/// Most-recent non-empty stderr line, trimmed and truncated to 300 chars.
fn last_stderr_line(stderr_tail: &str) -> Option<String> {
    stderr_tail
        .lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(|line| {
            if line.len() > 300 {
                let mut end = 300;
                while !line.is_char_boundary(end) {
                    end -= 1;
                }
                line[..end].to_string()
            } else {
                line.to_string()
            }
        })
}

fn file_len(path: &Path) -> u64 {
    std::fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}

fn read_tail(path: &Path, max_bytes: usize) -> String {
    let Ok(raw) = std::fs::read(path) else {
        return String::new();
    };
    let start = raw.len().saturating_sub(max_bytes);
    String::from_utf8_lossy(&raw[start..]).into_owned()
}

fn read_stage_file(stage_dir: &Path, name: &str) -> String {
    std::fs::read_to_string(stage_dir.join(name)).unwrap_or_default()
}

/// Copies the current stdout/stderr logs aside before a negotiation retry
/// overwrites them.
fn preserve_logs(stage_dir: &Path, suffix: &str) {
    for stream in ["stdout", "stderr"] {
        let src = stage_dir.join(format!("{stream}.log"));
        let dst = stage_dir.join(format!("{stream}.{suffix}.log"));
        if src.exists() {
            if let Err(err) = std::fs::copy(&src, &dst) {
                warn!(error = %err, "failed to preserve {stream} log");
            }
        }
    }
}

fn format_duration(d: Duration) -> String {
    if d.as_secs() >= 1 && d.subsec_millis() == 0 {
        format!("{}s", d.as_secs())
    } else {
        format!("{}ms", d.as_millis())
    }
}
