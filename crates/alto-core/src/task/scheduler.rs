//! Level-by-level, chunked thread-pool task runner.
//!
//! Tasks are grouped into dependency levels (everything in level N depends
//! only on tasks in levels `< N`); each level runs in `max_concurrent`-
//! sized chunks, spawning one OS thread per task in the chunk and joining
//! the chunk before starting the next. A task is skipped (counted as
//! failed, not run) if any of its dependencies failed; failures in
//! unrelated subtrees never cancel each other.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::thread;

use crate::error::AltoError;
use crate::task::db::BuildDb;
use crate::task::graph::{Task, TaskContext, TaskGraph, UpToDate};

pub struct RunOutcome {
    pub ran: Vec<String>,
    pub skipped_up_to_date: Vec<String>,
    pub failed: HashMap<String, String>,
}

/// Computes dependency levels via repeated Kahn-style peeling: level 0 is
/// every task with no outstanding dependency, level N+1 is every
/// remaining task whose dependencies are all in levels `<= N`.
fn compute_levels(graph: &TaskGraph) -> Vec<Vec<String>> {
    let mut remaining: HashSet<String> = graph.tasks.keys().cloned().collect();
    let mut done: HashSet<String> = HashSet::new();
    let mut levels = Vec::new();

    while !remaining.is_empty() {
        let mut level: Vec<String> = Vec::new();
        for identity in &remaining {
            let task = &graph.tasks[identity];
            let deps_done = task
                .task_dep
                .iter()
                .chain(task.setup.iter())
                .all(|d| done.contains(d));
            if deps_done {
                level.push(identity.clone());
            }
        }
        if level.is_empty() {
            // Would indicate a cycle; TaskGraph::new already rejects those,
            // so this is unreachable in practice. Break to avoid looping.
            break;
        }
        for identity in &level {
            remaining.remove(identity);
            done.insert(identity.clone());
        }
        level.sort();
        levels.push(level);
    }
    levels
}

/// Runs the entire graph, `max_concurrent` at a time within a level.
pub fn run(
    graph: &Arc<TaskGraph>,
    db: &mut BuildDb,
    ctx: Arc<TaskContext>,
    max_concurrent: usize,
) -> RunOutcome {
    run_filtered(graph, db, ctx, max_concurrent, None)
}

/// Runs only `roots` and whatever they transitively depend on; every
/// other task is left untouched (not even marked skipped).
pub fn run_only(
    graph: &Arc<TaskGraph>,
    roots: &[String],
    db: &mut BuildDb,
    ctx: Arc<TaskContext>,
    max_concurrent: usize,
) -> RunOutcome {
    let closure = graph.dependency_closure(roots);
    run_filtered(graph, db, ctx, max_concurrent, Some(&closure))
}

fn run_filtered(
    graph: &Arc<TaskGraph>,
    db: &mut BuildDb,
    ctx: Arc<TaskContext>,
    max_concurrent: usize,
    allowed: Option<&HashSet<String>>,
) -> RunOutcome {
    let levels = compute_levels(graph);
    let max_concurrent = max_concurrent.max(1);

    let mut ran = Vec::new();
    let mut skipped_up_to_date = Vec::new();
    let mut failed: HashMap<String, String> = HashMap::new();

    for level in levels {
        let runnable: Vec<String> = level
            .into_iter()
            .filter(|identity| match allowed {
                Some(set) => set.contains(identity),
                None => true,
            })
            .filter(|identity| {
                let task = &graph.tasks[identity];
                let dep_failed = task
                    .task_dep
                    .iter()
                    .chain(task.setup.iter())
                    .any(|d| failed.contains_key(d));
                if dep_failed {
                    failed.insert(
                        identity.clone(),
                        "skipped: a dependency failed".to_string(),
                    );
                    return false;
                }
                true
            })
            .collect();

        for chunk in runnable.chunks(max_concurrent) {
            let mut handles = Vec::new();
            for identity in chunk {
                let identity = identity.clone();
                let recorded = db.get(&identity).cloned();
                if graph.is_up_to_date(&identity, recorded.as_ref()) {
                    skipped_up_to_date.push(identity);
                    continue;
                }

                let graph = Arc::clone(graph);
                let ctx = Arc::clone(&ctx);
                handles.push((
                    identity.clone(),
                    thread::spawn(move || run_one(&graph, &identity, &ctx)),
                ));
            }

            for (identity, handle) in handles {
                match handle.join() {
                    Ok(Ok(signature)) => {
                        if let Some(sig) = signature {
                            db.set(&identity, sig);
                        }
                        ran.push(identity);
                    }
                    Ok(Err(e)) => {
                        failed.insert(identity, e.to_string());
                    }
                    Err(_) => {
                        failed.insert(identity, "task panicked".to_string());
                    }
                }
            }
        }
    }

    RunOutcome { ran, skipped_up_to_date, failed }
}

fn run_one(
    graph: &TaskGraph,
    identity: &str,
    ctx: &TaskContext,
) -> Result<Option<serde_json::Value>, AltoError> {
    let task = graph
        .get(identity)
        .ok_or_else(|| AltoError::config(format!("unknown task {identity}")))?;

    let action_result = (|| -> Result<(), AltoError> {
        for action in &task.actions {
            action(ctx)?;
        }
        Ok(())
    })();

    for teardown in &task.teardown {
        let _ = teardown(ctx);
    }

    action_result?;

    Ok(config_changed_signature(task))
}

fn config_changed_signature(task: &Task) -> Option<serde_json::Value> {
    task.uptodate.iter().find_map(|u| match u {
        UpToDate::ConfigChanged(blob) => Some(blob.clone()),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reporter::{RecordingReporter, SharedReporter};
    use crate::task::graph::TaskBuilder;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn ctx() -> Arc<TaskContext> {
        Arc::new(TaskContext { reporter: SharedReporter::new(RecordingReporter::default()) })
    }

    #[test]
    fn independent_tasks_all_run() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mk = |name: &str| {
            let counter = Arc::clone(&counter);
            TaskBuilder::new("build", name)
                .set_actions(vec![Box::new(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })])
                .build()
        };
        let graph = Arc::new(TaskGraph::new(vec![mk("a"), mk("b"), mk("c")]).unwrap());
        let mut db = BuildDb::load(tempfile::tempdir().unwrap().path()).unwrap();
        let outcome = run(&graph, &mut db, ctx(), 2);
        assert_eq!(outcome.ran.len(), 3);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn a_failed_dependency_skips_its_dependents() {
        let failing = TaskBuilder::new("build", "tap")
            .set_actions(vec![Box::new(|_| Err(AltoError::config("boom")))])
            .build();
        let dependent = TaskBuilder::new("catalog", "tap")
            .set_task_dep(vec!["build:tap".to_string()])
            .build();
        let graph = Arc::new(TaskGraph::new(vec![failing, dependent]).unwrap());
        let mut db = BuildDb::load(tempfile::tempdir().unwrap().path()).unwrap();
        let outcome = run(&graph, &mut db, ctx(), 2);
        assert!(outcome.failed.contains_key("build:tap"));
        assert!(outcome.failed.contains_key("catalog:tap"));
        assert!(outcome.ran.is_empty());
    }

    #[test]
    fn up_to_date_tasks_are_skipped_without_running_actions() {
        let ran = Arc::new(AtomicUsize::new(0));
        let ran_clone = Arc::clone(&ran);
        let task = TaskBuilder::new("config", "tap")
            .set_uptodate(vec![UpToDate::Check(Box::new(|| true))])
            .set_actions(vec![Box::new(move |_| {
                ran_clone.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })])
            .build();
        let graph = Arc::new(TaskGraph::new(vec![task]).unwrap());
        let mut db = BuildDb::load(tempfile::tempdir().unwrap().path()).unwrap();
        let outcome = run(&graph, &mut db, ctx(), 2);
        assert_eq!(outcome.skipped_up_to_date, vec!["config:tap".to_string()]);
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn run_only_leaves_unrelated_tasks_untouched() {
        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = Arc::clone(&counter);
        let wanted = TaskBuilder::new("build", "tap-csv")
            .set_actions(vec![Box::new(move |_| {
                counter_clone.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })])
            .build();
        let unrelated_counter = Arc::clone(&counter);
        let unrelated = TaskBuilder::new("build", "target-csv")
            .set_actions(vec![Box::new(move |_| {
                unrelated_counter.fetch_add(100, Ordering::SeqCst);
                Ok(())
            })])
            .build();
        let graph = Arc::new(TaskGraph::new(vec![wanted, unrelated]).unwrap());
        let mut db = BuildDb::load(tempfile::tempdir().unwrap().path()).unwrap();
        let outcome = run_only(&graph, &["build:tap-csv".to_string()], &mut db, ctx(), 2);
        assert_eq!(outcome.ran, vec!["build:tap-csv".to_string()]);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn teardown_runs_even_when_the_action_fails() {
        let teardown_ran = Arc::new(AtomicUsize::new(0));
        let teardown_clone = Arc::clone(&teardown_ran);
        let task = TaskBuilder::new("build", "tap")
            .set_actions(vec![Box::new(|_| Err(AltoError::config("boom")))])
            .set_teardown(vec![Box::new(move |_| {
                teardown_clone.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })])
            .build();
        let graph = Arc::new(TaskGraph::new(vec![task]).unwrap());
        let mut db = BuildDb::load(tempfile::tempdir().unwrap().path()).unwrap();
        let outcome = run(&graph, &mut db, ctx(), 2);
        assert!(outcome.failed.contains_key("build:tap"));
        assert_eq!(teardown_ran.load(Ordering::SeqCst), 1);
    }
}
