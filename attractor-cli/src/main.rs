//! Attractor CLI: run and resume stage-graph pipelines.
//!
//! The graph parser is an external collaborator; this binary consumes the
//! serde-JSON graph interchange form (`nodes`, `edges`, `attrs`).

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing::warn;
use tracing_subscriber::EnvFilter;

use attractor::config::CatalogUpdatePolicy;
use attractor::engine::DEFAULT_LOGS_BASE;
use attractor::graph::parse_duration;
use attractor::llm::ModelCatalog;
use attractor::{Engine, EngineBuilder, FinalStatus, Graph, RunConfig, RunOptions};

#[derive(Parser, Debug)]
#[command(name = "attractor")]
#[command(about = "Attractor: run a directed graph of LLM and shell stages")]
struct Args {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a pipeline graph from its entry node.
    Run {
        /// Graph document (JSON interchange form)
        #[arg(short, long, value_name = "FILE")]
        graph: PathBuf,

        /// Run configuration file (JSON or YAML)
        #[arg(short, long, value_name = "FILE")]
        config: Option<PathBuf>,

        /// Logs root directory (default: <worktree>/.attractor/logs/<run_id>)
        #[arg(long, value_name = "DIR")]
        logs_root: Option<PathBuf>,

        /// Worktree the stages mutate (default: current directory)
        #[arg(short, long, value_name = "DIR")]
        worktree: Option<PathBuf>,

        /// Run identifier (default: generated)
        #[arg(long, value_name = "ID")]
        run_id: Option<String>,

        /// Stage-wide timeout, e.g. "300s" or "5m"
        #[arg(long, value_name = "DURATION")]
        stage_timeout: Option<String>,

        /// Maximum parallel fan-out branches
        #[arg(long, default_value_t = 4)]
        max_parallel_branches: usize,

        /// Allow test-shim executable overrides from the config file
        #[arg(long)]
        allow_test_shim: bool,
    },
    /// Resume a checkpointed run from its logs root.
    Resume {
        /// Graph document (must match the original run)
        #[arg(short, long, value_name = "FILE")]
        graph: PathBuf,

        /// Logs root of the run to resume
        #[arg(long, value_name = "DIR", conflicts_with = "branch")]
        logs_root: Option<PathBuf>,

        /// Locate the run by its VCS branch instead of a logs root
        #[arg(long, value_name = "BRANCH", requires = "repo")]
        branch: Option<String>,

        /// Repository root used with --branch
        #[arg(long, value_name = "DIR")]
        repo: Option<PathBuf>,

        /// Run configuration file (JSON or YAML)
        #[arg(short, long, value_name = "FILE")]
        config: Option<PathBuf>,

        /// Allow test-shim executable overrides from the config file
        #[arg(long)]
        allow_test_shim: bool,
    },
    /// Validate a graph document and print a summary.
    Graph {
        /// Graph document (JSON interchange form)
        #[arg(short, long, value_name = "FILE")]
        graph: PathBuf,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    match run(Args::parse()).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<ExitCode, Box<dyn std::error::Error>> {
    match args.cmd {
        Command::Run {
            graph,
            config,
            logs_root,
            worktree,
            run_id,
            stage_timeout,
            max_parallel_branches,
            allow_test_shim,
        } => {
            let graph = load_graph(&graph)?;
            let config = load_config(config.as_deref())?;
            let catalog = load_catalog(&config);

            let worktree = worktree
                .map(Ok)
                .unwrap_or_else(std::env::current_dir)?;
            let run_id = run_id.unwrap_or_else(default_run_id);
            let logs_root = logs_root
                .unwrap_or_else(|| worktree.join(DEFAULT_LOGS_BASE).join(&run_id));

            let mut options = RunOptions::new(logs_root, worktree);
            options.run_id = Some(run_id);
            options.stage_timeout = stage_timeout
                .map(|raw| parse_duration(Some(&raw), std::time::Duration::from_secs(3600)));
            options.max_parallel_branches = max_parallel_branches;
            options.allow_test_shim = allow_test_shim;

            let engine = EngineBuilder::new(graph, options)
                .config(config)
                .catalog(catalog)
                .build()?;
            let result = engine.run().await?;
            print_result(&result)
        }
        Command::Resume {
            graph,
            logs_root,
            branch,
            repo,
            config,
            allow_test_shim,
        } => {
            let graph = load_graph(&graph)?;
            let config = load_config(config.as_deref())?;
            let catalog = load_catalog(&config);

            let logs_root = match (logs_root, branch) {
                (Some(root), _) => root,
                (None, Some(branch)) => {
                    let repo = repo.expect("clap enforces --repo with --branch");
                    Engine::locate_run(&repo, &branch)
                        .ok_or_else(|| format!("no run found for branch {branch}"))?
                }
                (None, None) => return Err("either --logs-root or --branch is required".into()),
            };
            let manifest = attractor::Manifest::load(&logs_root)?;

            let mut options = RunOptions::new(logs_root, manifest.worktree.clone());
            options.run_id = Some(manifest.run_id.clone());
            options.allow_test_shim = allow_test_shim;

            let engine = EngineBuilder::new(graph, options)
                .config(config)
                .catalog(catalog)
                .build()?;
            let result = engine.resume().await?;
            print_result(&result)
        }
        Command::Graph { graph } => {
            let graph = load_graph(&graph)?;
            graph.validate()?;
            println!(
                "graph ok: {} nodes, {} edges, entry {}",
                graph.nodes.len(),
                graph.edges.len(),
                graph.entry_node()?.id
            );
            for node in graph.nodes.values() {
                println!("  {:<24} {:?}", node.id, node.shape());
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn load_graph(path: &std::path::Path) -> Result<Graph, Box<dyn std::error::Error>> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| format!("read graph {}: {e}", path.display()))?;
    let graph: Graph = serde_json::from_str(&raw)
        .map_err(|e| format!("parse graph {}: {e}", path.display()))?;
    Ok(graph)
}

fn load_config(path: Option<&std::path::Path>) -> Result<RunConfig, Box<dyn std::error::Error>> {
    match path {
        Some(path) => Ok(RunConfig::load(path)?),
        None => Ok(RunConfig::default()),
    }
}

/// The pinned model-info document; only used for failover model selection.
fn load_catalog(config: &RunConfig) -> ModelCatalog {
    let Some(path) = config.modeldb.openrouter_model_info_path.as_deref() else {
        return ModelCatalog::default();
    };
    if config.modeldb.openrouter_model_info_update_policy == CatalogUpdatePolicy::Fetch {
        warn!("modeldb update policy 'fetch' is handled outside the engine; using the pinned file");
    }
    match ModelCatalog::load(path) {
        Ok(catalog) => catalog,
        Err(err) => {
            warn!(path = %path.display(), error = %err, "failed to load model catalog");
            ModelCatalog::default()
        }
    }
}

fn default_run_id() -> String {
    let millis = std::time::SystemTime::now()
        .duration_since(std::time::SystemTime::UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    format!("run-{millis}")
}

fn print_result(result: &attractor::RunResult) -> Result<ExitCode, Box<dyn std::error::Error>> {
    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "status": result.outcome.status,
            "failure_reason": result.outcome.failure_reason,
            "logs_root": result.logs_root,
            "run_branch": result.run_branch,
        }))?
    );
    Ok(match result.outcome.status {
        FinalStatus::Fail => ExitCode::FAILURE,
        _ => ExitCode::SUCCESS,
    })
}
