use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use alto_core::paths;
use alto_core::reporter::{ConsoleReporter, SharedReporter};
use alto_core::settings::{self, Plugin};
use alto_core::store::LocalObjectStore;
use alto_core::task::builtin::BuiltinTasks;
use alto_core::task::{BinaryResolver, Engine, EngineContext, RunOutcome, TaskContributor};

#[derive(Parser, Debug)]
#[command(name = "alto", version)]
#[command(about = "Build-graph-driven orchestrator for Singer-style extract/load pipelines")]
struct Cli {
    /// Project root containing alto.{toml,yaml,yml,json}
    #[arg(long, default_value = ".")]
    project_root: PathBuf,

    /// Environment layer to select (default: ALTO_ENV or "dev")
    #[arg(long)]
    env: Option<String>,

    /// Max tasks to run concurrently within a dependency level.
    #[arg(long, default_value_t = 4)]
    max_concurrent: usize,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run every generated task.
    Run,
    /// Run one named task (and its transitive dependencies).
    Task {
        /// Task identity, e.g. "build:tap-csv" or "tap-csv:target-jsonl"
        identity: String,
    },
    /// Print every generated task identity in dependency order.
    List,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let env = cli
        .env
        .or_else(|| std::env::var("ALTO_ENV").ok())
        .unwrap_or_else(|| settings::DEFAULT_ENVIRONMENT.to_string());

    let project_root = cli
        .project_root
        .canonicalize()
        .with_context(|| format!("project root {} does not exist", cli.project_root.display()))?;

    let settings = settings::load_from_workspace(&project_root, &env)
        .with_context(|| format!("loading alto settings from {}", project_root.display()))?;

    let reporter = SharedReporter::new(ConsoleReporter);
    let store = Arc::new(LocalObjectStore::new(project_root.join(paths::ALTO_ROOT).join("store")));

    let ctx = EngineContext {
        project_root: project_root.clone(),
        env,
        settings,
        store,
        resolver: Arc::new(PathBinaryResolver),
        reporter,
        base_env: std::env::vars().collect(),
        console_mutex: Arc::new(Mutex::new(())),
        max_concurrent: cli.max_concurrent.max(1),
    };

    let contributors: Vec<Box<dyn TaskContributor>> = vec![Box::new(BuiltinTasks)];
    let engine = Engine::new(ctx, &contributors).context("building task graph")?;

    match cli.cmd {
        Commands::Run => {
            let outcome = engine.run_all().context("running task graph")?;
            print_outcome(&outcome);
        }
        Commands::Task { identity } => {
            let outcome = engine.run_task(&identity).context("running task")?;
            print_outcome(&outcome);
        }
        Commands::List => {
            for identity in engine.graph().topo_order().context("ordering task graph")? {
                println!("{identity}");
            }
        }
    }

    Ok(())
}

fn print_outcome(outcome: &RunOutcome) {
    for identity in &outcome.ran {
        println!("ran: {identity}");
    }
    for identity in &outcome.skipped_up_to_date {
        println!("skipped (up to date): {identity}");
    }
    for (identity, message) in &outcome.failed {
        eprintln!("failed: {identity}: {message}");
    }
    if !outcome.failed.is_empty() {
        std::process::exit(1);
    }
}

/// Resolves a plugin binary by scanning `$PATH` for an executable named
/// after the plugin's `entrypoint` (falling back to its name). Alto does
/// not install plugins itself — installing a tap/target into the
/// environment alto is invoked from is left to the operator, same as any
/// other CLI-discovered tool.
struct PathBinaryResolver;

impl BinaryResolver for PathBinaryResolver {
    fn executable_path(&self, plugin: &Plugin, _cache_key: &str) -> Result<PathBuf, alto_core::error::AltoError> {
        let exe_name = plugin.entrypoint.clone().unwrap_or_else(|| plugin.name.clone());
        find_on_path(&exe_name).ok_or_else(|| alto_core::error::AltoError::Binary {
            plugin: plugin.name.clone(),
            message: format!("no executable named {exe_name} found on PATH"),
        })
    }
}

fn find_on_path(name: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var)
        .map(|dir| dir.join(name))
        .find(|candidate| is_executable_file(candidate))
}

fn is_executable_file(path: &Path) -> bool {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::metadata(path)
            .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
            .unwrap_or(false)
    }
    #[cfg(not(unix))]
    {
        path.is_file()
    }
}
