//! Task records and the dependency graph they form.

use std::collections::{HashMap, HashSet};

use serde_json::Value;

use crate::error::AltoError;
use crate::reporter::SharedReporter;

/// An up-to-date predicate: either an arbitrary check, or a sentinel that
/// compares a JSON blob against the signature DB (`config_changed`).
pub enum UpToDate {
    Check(Box<dyn Fn() -> bool + Send + Sync>),
    ConfigChanged(Value),
    /// Always not up to date — used by `config:*` tasks (spec.md §4.K).
    Never,
}

impl UpToDate {
    fn is_satisfied(&self, recorded: Option<&Value>) -> bool {
        match self {
            UpToDate::Never => false,
            UpToDate::Check(f) => f(),
            UpToDate::ConfigChanged(blob) => recorded == Some(blob),
        }
    }
}

pub type Action = Box<dyn Fn(&TaskContext) -> Result<(), AltoError> + Send + Sync>;

/// Everything an action needs at run time.
pub struct TaskContext {
    pub reporter: SharedReporter,
}

/// A declared unit of work: identity is `basename:name`.
pub struct Task {
    pub basename: String,
    pub name: String,
    pub actions: Vec<Action>,
    pub file_dep: Vec<String>,
    pub task_dep: Vec<String>,
    pub setup: Vec<String>,
    pub teardown: Vec<Action>,
    pub clean: Vec<Action>,
    pub uptodate: Vec<UpToDate>,
    pub verbosity: u8,
    pub doc: Option<String>,
}

impl Task {
    pub fn identity(&self) -> String {
        format!("{}:{}", self.basename, self.name)
    }
}

/// Builder mirroring the fluent `set_*` style of a `doit`-like task model.
pub struct TaskBuilder {
    task: Task,
}

impl TaskBuilder {
    pub fn new(basename: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            task: Task {
                basename: basename.into(),
                name: name.into(),
                actions: Vec::new(),
                file_dep: Vec::new(),
                task_dep: Vec::new(),
                setup: Vec::new(),
                teardown: Vec::new(),
                clean: Vec::new(),
                uptodate: Vec::new(),
                verbosity: 1,
                doc: None,
            },
        }
    }

    pub fn set_actions(mut self, actions: Vec<Action>) -> Self {
        self.task.actions = actions;
        self
    }

    pub fn set_file_dep(mut self, file_dep: Vec<String>) -> Self {
        self.task.file_dep = file_dep;
        self
    }

    pub fn set_task_dep(mut self, task_dep: Vec<String>) -> Self {
        self.task.task_dep = task_dep;
        self
    }

    pub fn set_setup(mut self, setup: Vec<String>) -> Self {
        self.task.setup = setup;
        self
    }

    pub fn set_teardown(mut self, teardown: Vec<Action>) -> Self {
        self.task.teardown = teardown;
        self
    }

    pub fn set_clean(mut self, clean: Vec<Action>) -> Self {
        self.task.clean = clean;
        self
    }

    pub fn set_uptodate(mut self, uptodate: Vec<UpToDate>) -> Self {
        self.task.uptodate = uptodate;
        self
    }

    pub fn set_verbosity(mut self, verbosity: u8) -> Self {
        self.task.verbosity = verbosity;
        self
    }

    pub fn set_doc(mut self, doc: impl Into<String>) -> Self {
        self.task.doc = Some(doc.into());
        self
    }

    pub fn build(self) -> Task {
        self.task
    }
}

/// The DAG over a set of tasks, keyed by task identity.
pub struct TaskGraph {
    pub tasks: HashMap<String, Task>,
}

impl TaskGraph {
    pub fn new(tasks: Vec<Task>) -> Result<Self, AltoError> {
        let mut map = HashMap::new();
        for task in tasks {
            map.insert(task.identity(), task);
        }
        let graph = Self { tasks: map };
        graph.topo_order()?;
        Ok(graph)
    }

    pub fn get(&self, identity: &str) -> Option<&Task> {
        self.tasks.get(identity)
    }

    /// Up-to-date evaluation for one task: the conjunction of every
    /// predicate, looked up against the signature DB's recorded blob for
    /// `config_changed` sentinels.
    pub fn is_up_to_date(&self, identity: &str, recorded: Option<&Value>) -> bool {
        match self.tasks.get(identity) {
            Some(task) if !task.uptodate.is_empty() => {
                task.uptodate.iter().all(|u| u.is_satisfied(recorded))
            }
            _ => false,
        }
    }

    /// Every task transitively required by `roots`, `roots` included.
    pub fn dependency_closure(&self, roots: &[String]) -> HashSet<String> {
        let mut closure = HashSet::new();
        let mut stack: Vec<String> = roots.to_vec();
        while let Some(identity) = stack.pop() {
            if !closure.insert(identity.clone()) {
                continue;
            }
            if let Some(task) = self.tasks.get(&identity) {
                for dep in task.task_dep.iter().chain(task.setup.iter()) {
                    stack.push(dep.clone());
                }
            }
        }
        closure
    }

    /// Topological order over every declared task. Fails fast on a cycle
    /// or an unknown dependency — cycles are a load-time error, not a
    /// runtime one (spec.md §3 invariant).
    pub fn topo_order(&self) -> Result<Vec<String>, AltoError> {
        let mut order = Vec::with_capacity(self.tasks.len());
        let mut visited: HashSet<String> = HashSet::new();
        let mut visiting: HashSet<String> = HashSet::new();

        for identity in self.tasks.keys() {
            self.visit(identity, &mut visited, &mut visiting, &mut order)?;
        }
        Ok(order)
    }

    fn visit(
        &self,
        identity: &str,
        visited: &mut HashSet<String>,
        visiting: &mut HashSet<String>,
        order: &mut Vec<String>,
    ) -> Result<(), AltoError> {
        if visited.contains(identity) {
            return Ok(());
        }
        if visiting.contains(identity) {
            return Err(AltoError::config(format!("cycle detected in task graph at {identity}")));
        }
        let Some(task) = self.tasks.get(identity) else {
            return Err(AltoError::config(format!("task dependency {identity} does not exist")));
        };
        visiting.insert(identity.to_string());
        for dep in task.task_dep.iter().chain(task.setup.iter()) {
            self.visit(dep, visited, visiting, order)?;
        }
        visiting.remove(identity);
        visited.insert(identity.to_string());
        order.push(identity.to_string());
        Ok(())
    }
}
