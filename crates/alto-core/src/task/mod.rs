//! Task engine entry point.
//!
//! `Engine` wires a generated [`TaskGraph`] to the [`scheduler`] and the
//! persistent [`BuildDb`]. The graph itself is assembled from one or more
//! [`TaskContributor`]s rather than hardcoded — [`builtin`] supplies the
//! Singer task set spec.md describes, but a caller can add its own
//! contributors alongside it. There is no dynamic loading of contributors:
//! the set is fixed at [`Engine::new`].

pub mod builtin;
pub mod db;
pub mod graph;
pub mod scheduler;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

pub use db::BuildDb;
pub use graph::{Action, Task, TaskBuilder, TaskContext, TaskGraph, UpToDate};
pub use scheduler::RunOutcome;

use crate::error::AltoError;
use crate::reporter::SharedReporter;
use crate::settings::{Plugin, Settings};
use crate::store::ObjectStore;

/// Resolves a plugin spec to a runnable binary path, keyed by
/// [`crate::paths::binary_cache_key`]. Plugin *installation* (building a
/// pex/wheel, managing a venv) is explicitly out of scope for the engine;
/// a resolver implementation owns that and the engine only consumes its
/// result and the cache key it invalidates against.
pub trait BinaryResolver: Send + Sync {
    fn executable_path(&self, plugin: &Plugin, cache_key: &str) -> Result<PathBuf, AltoError>;
}

/// A source of generated tasks.
pub trait TaskContributor {
    fn tasks(&self, ctx: &EngineContext) -> Result<Vec<Task>, AltoError>;
}

/// Everything a [`TaskContributor`] needs to generate its task set, and
/// everything a running task's actions need to do real work.
pub struct EngineContext {
    pub project_root: PathBuf,
    pub env: String,
    pub settings: Settings,
    pub store: Arc<dyn ObjectStore>,
    pub resolver: Arc<dyn BinaryResolver>,
    pub reporter: SharedReporter,
    pub base_env: HashMap<String, String>,
    pub console_mutex: Arc<Mutex<()>>,
    pub max_concurrent: usize,
}

/// Ties a generated [`TaskGraph`] to the scheduler and the build-state DB.
pub struct Engine {
    ctx: EngineContext,
    graph: Arc<TaskGraph>,
}

impl Engine {
    pub fn new(ctx: EngineContext, contributors: &[Box<dyn TaskContributor>]) -> Result<Self, AltoError> {
        let mut tasks = Vec::new();
        for contributor in contributors {
            tasks.extend(contributor.tasks(&ctx)?);
        }
        let graph = Arc::new(TaskGraph::new(tasks)?);
        Ok(Self { ctx, graph })
    }

    pub fn graph(&self) -> &TaskGraph {
        &self.graph
    }

    /// Runs every task in the graph.
    pub fn run_all(&self) -> Result<RunOutcome, AltoError> {
        let mut db = BuildDb::load(&self.ctx.project_root)?;
        let task_ctx = Arc::new(TaskContext { reporter: self.ctx.reporter.clone() });
        let outcome = scheduler::run(&self.graph, &mut db, task_ctx, self.ctx.max_concurrent);
        db.save()?;
        Ok(outcome)
    }

    /// Runs one named task and its transitive dependencies, leaving
    /// unrelated tasks untouched.
    pub fn run_task(&self, identity: &str) -> Result<RunOutcome, AltoError> {
        if self.graph.get(identity).is_none() {
            return Err(AltoError::config(format!("unknown task {identity}")));
        }
        let mut db = BuildDb::load(&self.ctx.project_root)?;
        let task_ctx = Arc::new(TaskContext { reporter: self.ctx.reporter.clone() });
        let outcome = scheduler::run_only(
            &self.graph,
            &[identity.to_string()],
            &mut db,
            task_ctx,
            self.ctx.max_concurrent,
        );
        db.save()?;
        Ok(outcome)
    }
}
