//! Scheduler / engine.
//!
//! The outer traversal loop: picks the next executable node, runs it through
//! the retry gate, routes via the next-hop resolver, commits worktree state,
//! writes checkpoints, and produces the terminal verdict. The driver is
//! single-threaded and deterministic; concurrency appears only at fan-out.

mod gate;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use futures::future::BoxFuture;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::checkpoint::{Checkpoint, Manifest};
use crate::classify::FailureClass;
use crate::config::RunConfig;
use crate::context::{RunContext, KEY_FAN_IN_BEST_ID};
use crate::cxdb::{ContentDb, NullContentDb};
use crate::envbuild::base_env;
use crate::error::EngineError;
use crate::exec::StageExecution;
use crate::graph::{parse_int, Edge, Graph, Node, NodeShape};
use crate::handlers::HandlerRegistry;
use crate::hooks::ToolHooks;
use crate::llm::{LlmClient, LlmError, LlmRouter, ModelCatalog};
use crate::outcome::{FinalOutcome, Outcome, Status};
use crate::progress::{NdjsonProgress, ProgressEvent, ProgressSink};
use crate::route::{resolve_next, NextHop};
use crate::vcs::{NullVcs, Vcs};

/// Default directory under a repository where run logs are located by
/// [`Engine::locate_run`].
pub const DEFAULT_LOGS_BASE: &str = ".attractor/logs";

/// Options for one run.
#[derive(Clone)]
pub struct RunOptions {
    pub run_id: Option<String>,
    pub logs_root: PathBuf,
    pub worktree: PathBuf,
    pub stage_timeout: Option<Duration>,
    pub max_parallel_branches: usize,
    pub allow_test_shim: bool,
    pub cancel: CancellationToken,
}

impl RunOptions {
    pub fn new(logs_root: impl Into<PathBuf>, worktree: impl Into<PathBuf>) -> Self {
        RunOptions {
            run_id: None,
            logs_root: logs_root.into(),
            worktree: worktree.into(),
            stage_timeout: None,
            max_parallel_branches: 4,
            allow_test_shim: false,
            cancel: CancellationToken::new(),
        }
    }
}

/// Result of a completed (or aborted) run.
#[derive(Debug, Clone)]
pub struct RunResult {
    pub outcome: FinalOutcome,
    pub logs_root: PathBuf,
    pub run_branch: String,
}

pub struct EngineBuilder {
    graph: Graph,
    options: RunOptions,
    config: RunConfig,
    catalog: ModelCatalog,
    vcs: Arc<dyn Vcs>,
    content_db: Arc<dyn ContentDb>,
    client: Option<Arc<dyn LlmClient>>,
}

impl EngineBuilder {
    pub fn new(graph: Graph, options: RunOptions) -> Self {
        EngineBuilder {
            graph,
            options,
            config: RunConfig::default(),
            catalog: ModelCatalog::default(),
            vcs: Arc::new(NullVcs::new()),
            content_db: Arc::new(NullContentDb),
            client: None,
        }
    }

    pub fn config(mut self, config: RunConfig) -> Self {
        self.config = config;
        self
    }

    pub fn catalog(mut self, catalog: ModelCatalog) -> Self {
        self.catalog = catalog;
        self
    }

    pub fn vcs(mut self, vcs: Arc<dyn Vcs>) -> Self {
        self.vcs = vcs;
        self
    }

    pub fn content_db(mut self, content_db: Arc<dyn ContentDb>) -> Self {
        self.content_db = content_db;
        self
    }

    pub fn llm_client(mut self, client: Arc<dyn LlmClient>) -> Self {
        self.client = Some(client);
        self
    }

    pub fn build(self) -> Result<Engine, EngineError> {
        self.graph.validate()?;
        self.config.validate(self.options.allow_test_shim)?;
        std::fs::create_dir_all(&self.options.logs_root)?;

        let config = Arc::new(self.config);
        let router = match self.client {
            Some(client) => LlmRouter::with_client(config.clone(), self.catalog, client),
            None => LlmRouter::new(
                config.clone(),
                self.catalog,
                Box::new(|| {
                    Err(LlmError::Configuration(
                        "no API client configured for this run".into(),
                    ))
                }),
            ),
        };
        let registry = HandlerRegistry::with_defaults(Arc::new(router));

        let run_id = self.options.run_id.clone().unwrap_or_else(generate_run_id);
        let progress: Arc<dyn ProgressSink> =
            Arc::new(NdjsonProgress::create(&self.options.logs_root)?);
        let composed_env = base_env(Some(&self.options.worktree), &BTreeMap::new());
        let branch_permits = Arc::new(tokio::sync::Semaphore::new(
            self.options.max_parallel_branches.max(1),
        ));

        Ok(Engine {
            graph: self.graph,
            config,
            options: self.options,
            registry,
            vcs: self.vcs,
            content_db: self.content_db,
            progress,
            run_id,
            composed_env,
            branch_permits,
        })
    }
}

pub struct Engine {
    graph: Graph,
    config: Arc<RunConfig>,
    options: RunOptions,
    registry: HandlerRegistry,
    vcs: Arc<dyn Vcs>,
    content_db: Arc<dyn ContentDb>,
    progress: Arc<dyn ProgressSink>,
    run_id: String,
    composed_env: Vec<(String, String)>,
    branch_permits: Arc<tokio::sync::Semaphore>,
}

/// Driver-owned mutable state for the main traversal.
#[derive(Default)]
struct RunState {
    checkpoint: Checkpoint,
    outcomes: BTreeMap<String, Outcome>,
    /// Nodes whose failures were subsumed by a successful fan-in election;
    /// they no longer count against the terminal verdict.
    handled_failures: std::collections::BTreeSet<String>,
    restarts_total: u32,
    goal_gate_retries: BTreeMap<String, u32>,
}

/// How a parallel branch finished.
enum BranchEnd {
    FanIn(String),
    Terminal(String),
    Stopped,
}

/// Result of one parallel branch's traversal.
struct BranchOutcome {
    branch_id: String,
    end: BranchEnd,
    last_node: String,
    last: Outcome,
    last_class: Option<FailureClass>,
    sha: Option<String>,
    updates: BTreeMap<String, Value>,
    retries: BTreeMap<String, u32>,
    outcomes: BTreeMap<String, Outcome>,
    loop_signatures: BTreeMap<String, u32>,
}

impl Engine {
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Runs the graph from its entry node to a terminal verdict.
    pub async fn run(&self) -> Result<RunResult, EngineError> {
        let run_branch = self
            .vcs
            .init_run_branch(&self.config.git.run_branch_prefix, &self.run_id)
            .await?;
        let manifest = Manifest {
            run_id: self.run_id.clone(),
            logs_root: absolute(&self.options.logs_root),
            worktree: absolute(&self.options.worktree),
            run_branch_prefix: self.config.git.run_branch_prefix.clone(),
        };
        manifest.save(&self.options.logs_root)?;

        let mut state = RunState::default();
        state.checkpoint.extra.insert(
            "base_logs_root".into(),
            Value::String(manifest.logs_root.to_string_lossy().into_owned()),
        );
        let mut ctx = RunContext::with_cancel(self.options.cancel.clone());

        if let Err(err) = self.run_setup_commands().await {
            let _ = self.write_final(&FinalOutcome::fail(err.to_string()));
            return Err(err);
        }

        let entry = self.graph.entry_node()?.id.clone();
        let outcome = self
            .finalize(self.drive_to_verdict(&mut ctx, &mut state, entry).await)?;
        Ok(RunResult {
            outcome,
            logs_root: self.options.logs_root.clone(),
            run_branch,
        })
    }

    /// Resumes a run from its checkpoint. A run that already completed
    /// successfully is a no-op that re-emits the stored verdict.
    pub async fn resume(&self) -> Result<RunResult, EngineError> {
        let logs_root = &self.options.logs_root;
        let manifest = Manifest::load(logs_root)?;
        let run_branch = manifest.run_branch();

        let final_path = logs_root.join("final.json");
        if final_path.is_file() {
            let stored: FinalOutcome = serde_json::from_str(&std::fs::read_to_string(&final_path)?)?;
            if stored.status != crate::outcome::FinalStatus::Fail {
                info!(run_id = %manifest.run_id, "run already complete; resume is a no-op");
                self.write_final(&stored)?;
                return Ok(RunResult {
                    outcome: stored,
                    logs_root: logs_root.clone(),
                    run_branch,
                });
            }
        }

        let checkpoint = Checkpoint::load(logs_root)?;
        if let Some(sha) = &checkpoint.git_commit_sha {
            self.vcs.rewind_to(sha).await?;
        }

        let mut state = RunState {
            checkpoint,
            ..Default::default()
        };
        let mut ctx = RunContext::with_cancel(self.options.cancel.clone());
        let start = match state.checkpoint.current_node.clone() {
            Some(node_id) if self.graph.node(&node_id).is_some() => node_id,
            _ => self.graph.entry_node()?.id.clone(),
        };

        let outcome = self
            .finalize(self.drive_to_verdict(&mut ctx, &mut state, start).await)?;
        Ok(RunResult {
            outcome,
            logs_root: logs_root.clone(),
            run_branch,
        })
    }

    /// Writes `final.json` on every terminal path, including fatal aborts.
    fn finalize(
        &self,
        result: Result<FinalOutcome, EngineError>,
    ) -> Result<FinalOutcome, EngineError> {
        match result {
            Ok(outcome) => {
                self.write_final(&outcome)?;
                Ok(outcome)
            }
            Err(err) => {
                let _ = self.write_final(&FinalOutcome::fail(err.to_string()));
                Err(err)
            }
        }
    }

    /// Runs the config's setup commands in the worktree before traversal.
    /// A non-zero exit is fatal: the graph never starts on a broken setup.
    async fn run_setup_commands(&self) -> Result<(), EngineError> {
        let setup = &self.config.setup;
        let timeout = setup.timeout_ms.map(Duration::from_millis);
        for command in &setup.commands {
            debug!(command, "running setup command");
            let mut cmd = tokio::process::Command::new("bash");
            cmd.arg("-c")
                .arg(command)
                .current_dir(&self.options.worktree)
                .kill_on_drop(true);
            cmd.env_clear();
            for (key, value) in &self.composed_env {
                cmd.env(key, value);
            }
            let status = match timeout {
                Some(limit) => tokio::time::timeout(limit, cmd.status())
                    .await
                    .map_err(|_| EngineError::Setup(format!("command timed out: {command}")))??,
                None => cmd.status().await?,
            };
            if !status.success() {
                return Err(EngineError::Setup(format!(
                    "command failed ({status}): {command}"
                )));
            }
        }
        Ok(())
    }

    /// Locates the logs root of the run that committed to `branch` by
    /// scanning the repository's known state directory.
    pub fn locate_run(repo: &Path, branch: &str) -> Option<PathBuf> {
        let base = repo.join(DEFAULT_LOGS_BASE);
        let entries = std::fs::read_dir(&base).ok()?;
        for entry in entries.flatten() {
            let candidate = entry.path();
            if let Ok(manifest) = Manifest::load(&candidate) {
                if manifest.run_branch() == branch {
                    return Some(candidate);
                }
            }
        }
        None
    }

    /// Main traversal loop. Returns the final verdict; fatal errors bubble
    /// up after the caller writes `final.json`.
    async fn drive_to_verdict(
        &self,
        ctx: &mut RunContext,
        state: &mut RunState,
        start: String,
    ) -> Result<FinalOutcome, EngineError> {
        let mut current = start;
        loop {
            if ctx.is_cancelled() {
                return Ok(FinalOutcome::fail("run cancelled"));
            }
            let node = self
                .graph
                .node(&current)
                .ok_or_else(|| EngineError::Checkpoint(format!("unknown node {current}")))?
                .clone();

            if node.shape() == NodeShape::Terminal {
                if let Some(target) = self.unsatisfied_goal_gate(state)? {
                    match target {
                        Some((gated, retry_target)) => {
                            self.progress.emit(&ProgressEvent::GoalGateRetry {
                                node_id: gated.clone(),
                                retry_target: retry_target.clone(),
                            });
                            warn!(node_id = %gated, retry_target = %retry_target, "goal gate unsatisfied; routing to retry target");
                            current = retry_target;
                            continue;
                        }
                        None => return Ok(FinalOutcome::fail("goal gate unsatisfied")),
                    }
                }
                return Ok(self.terminal_verdict(state));
            }

            let (outcome, class) = match node.shape() {
                NodeShape::Entry | NodeShape::FanOut => (Outcome::success(), None),
                _ => {
                    let gate = self.run_with_retry_gate(ctx, &node, state).await?;
                    let class = gate
                        .outcome
                        .failure_class()
                        .or_else(|| self.heuristic_for(&gate.outcome));
                    (gate.outcome, class)
                }
            };

            self.write_status(&node.id, &outcome)?;
            state.outcomes.insert(node.id.clone(), outcome.clone());

            if ctx.is_cancelled() || class == Some(FailureClass::Cancelled) {
                return Ok(FinalOutcome::fail("run cancelled"));
            }

            let sha = self.vcs.commit_stage(&node.id, 1).await?;
            state.checkpoint.git_commit_sha = Some(sha);

            let hop = resolve_next(&self.graph, &node, &outcome, ctx, class);
            ctx.merge(&outcome.context_updates);

            let next = match hop {
                NextHop::Stop => {
                    let reason = outcome
                        .failure_reason
                        .clone()
                        .unwrap_or_else(|| format!("no outgoing edge from {}", node.id));
                    self.finish_node(state, &node.id, None)?;
                    return Ok(FinalOutcome::fail(reason));
                }
                NextHop::RetryTarget { node_id, source } => {
                    debug!(from = %node.id, to = %node_id, ?source, "routing to retry target");
                    node_id
                }
                NextHop::Edges { edges, fallback } => {
                    if fallback && outcome.status.is_failure() {
                        self.progress.emit(&ProgressEvent::NoMatchingFailEdgeFallback {
                            node_id: node.id.clone(),
                            status: outcome.status.as_str().to_string(),
                        });
                    }
                    if edges.len() == 1 {
                        let edge = edges.into_iter().next().unwrap();
                        if edge.loop_restart {
                            if let Some(reason) =
                                self.record_loop_restart(state, &node.id, &outcome)
                            {
                                self.finish_node(state, &node.id, Some(edge.to))?;
                                return Ok(FinalOutcome::fail(reason));
                            }
                        }
                        edge.to
                    } else {
                        match self.run_fan_out(ctx, state, &node, edges).await? {
                            FanOutResolution::Continue(next) => next,
                            FanOutResolution::Verdict(outcome) => return Ok(outcome),
                        }
                    }
                }
            };

            self.finish_node(state, &node.id, Some(next.clone()))?;
            current = next;
        }
    }

    /// Executes a fan-out edge set: one branch per destination, bounded by
    /// `max_parallel_branches`, joined at the fan-in node.
    async fn run_fan_out(
        &self,
        ctx: &mut RunContext,
        state: &mut RunState,
        from: &Node,
        edges: Vec<Edge>,
    ) -> Result<FanOutResolution, EngineError> {
        debug!(from = %from.id, branches = edges.len(), "fan-out");
        let futures: Vec<_> = edges
            .iter()
            .map(|edge| self.drive_branch(edge.to.clone(), ctx.snapshot()))
            .collect();
        let results = futures::future::join_all(futures).await;

        let mut branches = Vec::with_capacity(results.len());
        for result in results {
            branches.push(result?);
        }
        branches.sort_by(|a, b| a.branch_id.cmp(&b.branch_id));

        // Merge branch-local bookkeeping into the driver's state.
        for branch in &branches {
            for (key, value) in &branch.retries {
                let slot = state.checkpoint.node_retries.entry(key.clone()).or_insert(0);
                *slot = (*slot).max(*value);
            }
            for (key, value) in &branch.outcomes {
                state.outcomes.insert(key.clone(), value.clone());
            }
            for (sig, count) in &branch.loop_signatures {
                *state
                    .checkpoint
                    .loop_failure_signatures
                    .entry(sig.clone())
                    .or_insert(0) += count;
            }
        }

        // Winner: success beats failure; ties go to the lowest branch id.
        let winner_index = branches
            .iter()
            .enumerate()
            .filter(|(_, b)| !b.last.status.is_failure())
            .map(|(i, _)| i)
            .next()
            .unwrap_or(0);

        let join_id = branches
            .iter()
            .find_map(|branch| match &branch.end {
                BranchEnd::FanIn(id) => Some(id.clone()),
                _ => None,
            });

        let Some(join_id) = join_id else {
            // No join node: if a branch ran to a terminal, finish there.
            if let Some(terminal) = branches.iter().find_map(|branch| match &branch.end {
                BranchEnd::Terminal(id) => Some(id.clone()),
                _ => None,
            }) {
                return Ok(FanOutResolution::Continue(terminal));
            }
            let winner = &branches[winner_index];
            let reason = winner
                .last
                .failure_reason
                .clone()
                .unwrap_or_else(|| "all parallel branches stopped".to_string());
            return Ok(FanOutResolution::Verdict(FinalOutcome::fail(reason)));
        };

        // Merge context updates, winner last so its writes win collisions.
        for (index, branch) in branches.iter().enumerate() {
            if index != winner_index {
                ctx.merge(&branch.updates);
            }
        }
        ctx.merge(&branches[winner_index].updates);
        let winner = &branches[winner_index];
        ctx.set(KEY_FAN_IN_BEST_ID, Value::String(winner.branch_id.clone()));

        if let Some(sha) = &winner.sha {
            self.vcs.fast_forward_to(sha).await?;
            state.checkpoint.git_commit_sha = Some(sha.clone());
        }

        let results_doc: Vec<Value> = branches
            .iter()
            .map(|branch| {
                json!({
                    "branch": branch.branch_id,
                    "node": branch.last_node,
                    "status": branch.last.status.as_str(),
                    "failure_reason": branch.last.failure_reason,
                    "sha": branch.sha,
                })
            })
            .collect();
        let join_dir = self.options.logs_root.join(&join_id);
        std::fs::create_dir_all(&join_dir)?;
        std::fs::write(
            join_dir.join("parallel_results.json"),
            serde_json::to_string_pretty(&results_doc)?,
        )?;

        // Synthesize the join outcome and route from the fan-in node.
        let join_node = self
            .graph
            .node(&join_id)
            .ok_or_else(|| EngineError::Checkpoint(format!("unknown fan-in node {join_id}")))?
            .clone();

        if !winner.last.status.is_failure() {
            // A successful election subsumes the losing branches' failures.
            for branch in &branches {
                for (node_id, outcome) in &branch.outcomes {
                    if outcome.status.is_failure() {
                        state.handled_failures.insert(node_id.clone());
                    }
                }
            }
        }

        let (join_outcome, join_class) = if winner.last.status.is_failure() {
            let all_deterministic = branches
                .iter()
                .filter(|b| b.last.status.is_failure())
                .all(|b| b.last_class == Some(FailureClass::Deterministic));
            let class = if all_deterministic {
                FailureClass::Deterministic
            } else {
                FailureClass::TransientInfra
            };
            let reason = format!(
                "all {} parallel branches failed: {}",
                branches.len(),
                winner.last.failure_reason.as_deref().unwrap_or("unknown")
            );
            (
                Outcome::classified_fail(reason, class, format!("fan_in|{join_id}|all-branches")),
                Some(class),
            )
        } else {
            (Outcome::success(), None)
        };

        self.write_status(&join_id, &join_outcome)?;
        state.outcomes.insert(join_id.clone(), join_outcome.clone());

        let hop = resolve_next(&self.graph, &join_node, &join_outcome, ctx, join_class);
        ctx.merge(&join_outcome.context_updates);
        self.finish_node(state, &join_id, None)?;

        match hop {
            NextHop::Stop => {
                let reason = join_outcome
                    .failure_reason
                    .unwrap_or_else(|| format!("no outgoing edge from {join_id}"));
                Ok(FanOutResolution::Verdict(FinalOutcome::fail(reason)))
            }
            NextHop::RetryTarget { node_id, .. } => Ok(FanOutResolution::Continue(node_id)),
            NextHop::Edges { edges, .. } => {
                // A join normally has a single continuation edge.
                Ok(FanOutResolution::Continue(edges[0].to.clone()))
            }
        }
    }

    /// Traverses one parallel branch until a fan-in, a terminal, or a stop.
    fn drive_branch(
        &self,
        start: String,
        ctx: RunContext,
    ) -> BoxFuture<'_, Result<BranchOutcome, EngineError>> {
        Box::pin(async move {
            let mut permit = Some(
                self.branch_permits
                    .clone()
                    .acquire_owned()
                    .await
                    .map_err(|_| EngineError::Cancelled)?,
            );

            let branch_id = start.clone();
            let mut ctx = ctx;
            let mut state = RunState::default();
            let mut current = start;
            let mut last = Outcome::success();
            let mut last_class = None;
            let mut last_node = branch_id.clone();
            let mut updates: BTreeMap<String, Value> = BTreeMap::new();
            let mut sha = None;

            let end = loop {
                if ctx.is_cancelled() {
                    break BranchEnd::Stopped;
                }
                let node = match self.graph.node(&current) {
                    Some(node) => node.clone(),
                    None => break BranchEnd::Stopped,
                };
                match node.shape() {
                    NodeShape::FanIn => break BranchEnd::FanIn(node.id.clone()),
                    NodeShape::Terminal => break BranchEnd::Terminal(node.id.clone()),
                    _ => {}
                }

                let (outcome, class) = match node.shape() {
                    NodeShape::Entry | NodeShape::FanOut => (Outcome::success(), None),
                    _ => {
                        let gate = self.run_with_retry_gate(&ctx, &node, &mut state).await?;
                        let class = gate
                            .outcome
                            .failure_class()
                            .or_else(|| self.heuristic_for(&gate.outcome));
                        (gate.outcome, class)
                    }
                };
                self.write_status(&node.id, &outcome)?;
                state.outcomes.insert(node.id.clone(), outcome.clone());

                sha = Some(self.vcs.commit_stage(&node.id, 1).await?);

                let hop = resolve_next(&self.graph, &node, &outcome, &ctx, class);
                ctx.merge(&outcome.context_updates);
                for (key, value) in &outcome.context_updates {
                    updates.insert(key.clone(), value.clone());
                }
                last_node = node.id.clone();
                last = outcome;
                last_class = class;

                match hop {
                    NextHop::Stop => break BranchEnd::Stopped,
                    NextHop::RetryTarget { node_id, .. } => current = node_id,
                    NextHop::Edges { edges, fallback } => {
                        if fallback && last.status.is_failure() {
                            self.progress.emit(&ProgressEvent::NoMatchingFailEdgeFallback {
                                node_id: last_node.clone(),
                                status: last.status.as_str().to_string(),
                            });
                        }
                        if edges.len() == 1 {
                            let edge = edges.into_iter().next().unwrap();
                            if edge.loop_restart {
                                if self.record_loop_restart(&mut state, &last_node, &last).is_some()
                                {
                                    break BranchEnd::Stopped;
                                }
                            }
                            current = edge.to;
                        } else {
                            // Nested fan-out inside a branch. Release this
                            // branch's permit while the children run so the
                            // parallelism bound cannot deadlock on itself.
                            permit.take();
                            let nested: Vec<_> = edges
                                .iter()
                                .map(|edge| self.drive_branch(edge.to.clone(), ctx.snapshot()))
                                .collect();
                            let mut results = Vec::new();
                            for result in futures::future::join_all(nested).await {
                                results.push(result?);
                            }
                            permit = Some(
                                self.branch_permits
                                    .clone()
                                    .acquire_owned()
                                    .await
                                    .map_err(|_| EngineError::Cancelled)?,
                            );
                            results.sort_by(|a, b| a.branch_id.cmp(&b.branch_id));
                            let winner = results
                                .iter()
                                .position(|b| !b.last.status.is_failure())
                                .unwrap_or(0);
                            for branch in &results {
                                for (key, value) in &branch.updates {
                                    ctx.set(key.clone(), value.clone());
                                    updates.insert(key.clone(), value.clone());
                                }
                            }
                            last = results[winner].last.clone();
                            last_class = results[winner].last_class;
                            last_node = results[winner].last_node.clone();
                            match results[winner].end_node() {
                                Some(next) => current = next,
                                None => break BranchEnd::Stopped,
                            }
                        }
                    }
                }
            };
            drop(permit);

            Ok(BranchOutcome {
                branch_id,
                end,
                last_node,
                last,
                last_class,
                sha,
                updates,
                retries: state.checkpoint.node_retries,
                outcomes: state.outcomes,
                loop_signatures: state.checkpoint.loop_failure_signatures,
            })
        })
    }

    /// Records a loop-restart traversal; returns a failure reason when the
    /// circuit breaker trips.
    fn record_loop_restart(
        &self,
        state: &mut RunState,
        node_id: &str,
        outcome: &Outcome,
    ) -> Option<String> {
        let signature = failure_signature(node_id, &outcome.status, outcome.failure_reason.as_deref());
        let count = {
            let slot = state
                .checkpoint
                .loop_failure_signatures
                .entry(signature.clone())
                .or_insert(0);
            *slot += 1;
            *slot
        };
        state.restarts_total += 1;
        self.progress.emit(&ProgressEvent::LoopRestart {
            node_id: node_id.to_string(),
            signature: signature.clone(),
            count,
        });

        let signature_limit =
            parse_int(self.graph.attr("restart_signature_limit"), 2).max(1) as u32;
        let max_restarts = parse_int(self.graph.attr("max_restarts"), 20).max(1) as u32;

        if count >= signature_limit {
            return Some(format!(
                "loop restart circuit breaker tripped: failure_signature={signature} count={count}"
            ));
        }
        if state.restarts_total > max_restarts {
            return Some(format!(
                "loop restart budget exhausted after {} restarts (failure_signature={signature} count={count})",
                state.restarts_total
            ));
        }
        None
    }

    /// Goal gating at the terminal node. `Ok(None)` means all gates satisfied;
    /// `Ok(Some(Some((node, target))))` routes to a retry target; the inner
    /// `None` means a gate failed with no target left.
    #[allow(clippy::type_complexity)]
    fn unsatisfied_goal_gate(
        &self,
        state: &mut RunState,
    ) -> Result<Option<Option<(String, String)>>, EngineError> {
        let mut unsatisfied: Option<(String, Option<String>)> = None;
        for (node_id, outcome) in &state.outcomes {
            let Some(node) = self.graph.node(node_id) else {
                continue;
            };
            if !crate::graph::parse_bool(node.attr("goal_gate"), false) {
                continue;
            }
            if outcome.status == Status::Success {
                continue;
            }
            let target = self
                .graph
                .node_or_graph_attr(node, "retry_target")
                .map(str::to_string);
            unsatisfied = Some((node_id.clone(), target));
            break;
        }

        let Some((node_id, target)) = unsatisfied else {
            return Ok(None);
        };
        let attempts = state.goal_gate_retries.entry(node_id.clone()).or_insert(0);
        match target {
            Some(target) if *attempts == 0 => {
                *attempts += 1;
                Ok(Some(Some((node_id, target))))
            }
            _ => Ok(Some(None)),
        }
    }

    /// Verdict when a terminal node is reached with all gates satisfied.
    fn terminal_verdict(&self, state: &RunState) -> FinalOutcome {
        let mut partial = false;
        for (node_id, outcome) in &state.outcomes {
            if state.handled_failures.contains(node_id) {
                continue;
            }
            match outcome.status {
                Status::Fail => {
                    return FinalOutcome::fail(
                        outcome
                            .failure_reason
                            .clone()
                            .unwrap_or_else(|| "a stage failed".to_string()),
                    )
                }
                Status::PartialSuccess => partial = true,
                _ => {}
            }
        }
        if partial {
            FinalOutcome::partial()
        } else {
            FinalOutcome::success()
        }
    }

    fn heuristic_for(&self, outcome: &Outcome) -> Option<FailureClass> {
        if !outcome.status.is_failure() {
            return None;
        }
        Some(crate::classify::heuristic_class(
            outcome.failure_reason.as_deref().unwrap_or(""),
        ))
    }

    /// Per-attempt execution context for a node.
    pub(crate) fn stage_execution(
        &self,
        node: &Node,
        attempt: u32,
        model_override: Option<(String, String)>,
    ) -> StageExecution {
        let hooks = ToolHooks::resolve(
            &self.graph,
            node,
            self.options.worktree.clone(),
            self.progress.clone(),
        )
        .map(Arc::new);
        StageExecution {
            run_id: self.run_id.clone(),
            logs_root: self.options.logs_root.clone(),
            stage_dir: self.options.logs_root.join(&node.id),
            worktree: self.options.worktree.clone(),
            stage_timeout: self.options.stage_timeout,
            base_env: self.composed_env.clone(),
            progress: self.progress.clone(),
            content_db: self.content_db.clone(),
            model_override,
            hooks,
            attempt,
        }
    }

    pub(crate) fn graph(&self) -> &Graph {
        &self.graph
    }

    pub(crate) fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    pub(crate) fn progress(&self) -> &Arc<dyn ProgressSink> {
        &self.progress
    }

    fn write_status(&self, node_id: &str, outcome: &Outcome) -> Result<(), EngineError> {
        let dir = self.options.logs_root.join(node_id);
        std::fs::create_dir_all(&dir)?;
        std::fs::write(
            dir.join("status.json"),
            serde_json::to_string_pretty(outcome)?,
        )?;
        Ok(())
    }

    /// Marks a node complete in the checkpoint and persists it.
    fn finish_node(
        &self,
        state: &mut RunState,
        node_id: &str,
        next: Option<String>,
    ) -> Result<(), EngineError> {
        if !state.checkpoint.completed_nodes.iter().any(|n| n == node_id) {
            state.checkpoint.completed_nodes.push(node_id.to_string());
        }
        state.checkpoint.current_node = next;
        state.checkpoint.save(&self.options.logs_root)
    }

    fn write_final(&self, outcome: &FinalOutcome) -> Result<(), EngineError> {
        std::fs::write(
            self.options.logs_root.join("final.json"),
            serde_json::to_string_pretty(outcome)?,
        )?;
        Ok(())
    }
}

enum FanOutResolution {
    Continue(String),
    Verdict(FinalOutcome),
}

impl BranchOutcome {
    fn end_node(&self) -> Option<String> {
        match &self.end {
            BranchEnd::FanIn(id) | BranchEnd::Terminal(id) => Some(id.clone()),
            BranchEnd::Stopped => None,
        }
    }
}

/// Stable short signature for the loop-restart circuit breaker.
fn failure_signature(node_id: &str, status: &Status, reason: Option<&str>) -> String {
    let mut short_reason = reason.unwrap_or("").trim().to_string();
    if short_reason.len() > 80 {
        let mut end = 80;
        while !short_reason.is_char_boundary(end) {
            end -= 1;
        }
        short_reason.truncate(end);
    }
    let digest = Sha256::digest(format!("{node_id}|{status}|{short_reason}").as_bytes());
    let mut hash = String::with_capacity(12);
    for byte in digest.iter().take(6) {
        hash.push_str(&format!("{byte:02x}"));
    }
    hash
}

fn generate_run_id() -> String {
    let millis = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    format!("run-{millis}-{}", std::process::id())
}

fn absolute(path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    }
}
