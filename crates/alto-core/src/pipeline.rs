//! Tap/target subprocess pair orchestration.
//!
//! Command assembly, stderr draining to both a log file and a
//! console-mutex-serialized terminal, an optional in-process stream-map
//! splice between the two subprocesses, and post-run state teardown.

use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::{BufRead, BufReader, Read, Write};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex};
use std::thread;

use serde_json::Value;

use crate::error::AltoError;
use crate::reporter::SharedReporter;
use crate::settings::Capability;
use crate::state;
use crate::streammap::MapChain;

#[derive(Debug, Clone)]
pub struct PipelinePlugin {
    pub name: String,
    pub capabilities: HashSet<Capability>,
    pub entrypoint: Option<String>,
    pub binary: PathBuf,
    pub config_path: PathBuf,
}

/// `PEX_MODULE=<entrypoint>` for `module:function`-style entrypoints,
/// `PEX_SCRIPT=<entrypoint>` otherwise, plus `ALTO_PLUGIN=<name>`.
pub fn plugin_env(base: &HashMap<String, String>, plugin: &PipelinePlugin) -> HashMap<String, String> {
    let mut env = base.clone();
    env.insert("ALTO_PLUGIN".to_string(), plugin.name.clone());
    if let Some(entrypoint) = &plugin.entrypoint {
        let key = if entrypoint.contains(':') {
            "PEX_MODULE"
        } else {
            "PEX_SCRIPT"
        };
        env.insert(key.to_string(), entrypoint.clone());
    }
    env
}

pub fn assemble_tap_args(
    tap: &PipelinePlugin,
    state_path: Option<&PathBuf>,
    catalog_path: Option<&PathBuf>,
    properties_path: Option<&PathBuf>,
) -> Vec<String> {
    let mut args = vec!["--config".to_string(), tap.config_path.display().to_string()];
    if tap.capabilities.contains(&Capability::State) {
        if let Some(state_path) = state_path {
            if state_path.exists() {
                args.push("--state".to_string());
                args.push(state_path.display().to_string());
            }
        }
    }
    if tap.capabilities.contains(&Capability::Catalog) {
        if let Some(p) = catalog_path {
            args.push("--catalog".to_string());
            args.push(p.display().to_string());
        }
    } else if tap.capabilities.contains(&Capability::Properties) {
        if let Some(p) = properties_path {
            args.push("--properties".to_string());
            args.push(p.display().to_string());
        }
    }
    args
}

pub fn assemble_target_args(target: &PipelinePlugin) -> Vec<String> {
    vec!["--config".to_string(), target.config_path.display().to_string()]
}

pub struct PipelineRequest {
    pub pipeline_id: String,
    pub tap: PipelinePlugin,
    pub target: PipelinePlugin,
    pub state_path: Option<PathBuf>,
    pub catalog_path: Option<PathBuf>,
    pub properties_path: Option<PathBuf>,
    pub map_chain: MapChain,
    pub base_env: HashMap<String, String>,
    pub log_dir: PathBuf,
    pub reporter: SharedReporter,
    pub console_mutex: Arc<Mutex<()>>,
}

pub struct PipelineReport {
    pub tap_log_path: PathBuf,
    pub target_log_path: PathBuf,
    pub state_log_path: Option<PathBuf>,
}

/// Runs `tap -> [map splice] -> target` to completion. On success,
/// `state_log_path` points at the captured target stdout for the caller
/// to merge via [`crate::state`] when the tap supports `state`.
pub fn run_pipeline(req: PipelineRequest) -> Result<PipelineReport, AltoError> {
    std::fs::create_dir_all(&req.log_dir)
        .map_err(|e| AltoError::Pipeline { pipeline_id: req.pipeline_id.clone(), message: e.to_string() })?;

    let tap_args = assemble_tap_args(
        &req.tap,
        req.state_path.as_ref(),
        req.catalog_path.as_ref(),
        req.properties_path.as_ref(),
    );
    let target_args = assemble_target_args(&req.target);

    let tap_env = plugin_env(&req.base_env, &req.tap);
    let target_env = plugin_env(&req.base_env, &req.target);

    let mut tap_child = Command::new(&req.tap.binary)
        .args(&tap_args)
        .envs(&tap_env)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| pipeline_err(&req.pipeline_id, format!("failed to start tap: {e}")))?;

    let state_log_path = req.log_dir.join(format!("state-{}.log", req.pipeline_id));
    let state_log_file = File::create(&state_log_path)
        .map_err(|e| pipeline_err(&req.pipeline_id, format!("failed to create state log: {e}")))?;

    let mut target_child = Command::new(&req.target.binary)
        .args(&target_args)
        .envs(&target_env)
        .stdin(Stdio::piped())
        .stdout(state_log_file)
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| pipeline_err(&req.pipeline_id, format!("failed to start target: {e}")))?;

    let tap_log_path = req.log_dir.join(format!("tap-{}.log", req.pipeline_id));
    let target_log_path = req.log_dir.join(format!("target-{}.log", req.pipeline_id));

    let tap_stderr = tap_child.stderr.take().expect("tap stderr piped");
    let target_stderr = target_child.stderr.take().expect("target stderr piped");

    let tap_logger = spawn_stderr_logger(
        tap_stderr,
        tap_log_path.clone(),
        "tap".to_string(),
        req.reporter.clone(),
        req.console_mutex.clone(),
    );
    let target_logger = spawn_stderr_logger(
        target_stderr,
        target_log_path.clone(),
        "target".to_string(),
        req.reporter.clone(),
        req.console_mutex.clone(),
    );

    let tap_stdout = tap_child.stdout.take().expect("tap stdout piped");
    let target_stdin = target_child.stdin.take().expect("target stdin piped");
    let splice = spawn_splice(tap_stdout, target_stdin, req.map_chain);

    let tap_status = wait_child(&mut tap_child, "tap", &req.pipeline_id)?;
    splice.join().expect("splice thread panicked")?;
    let target_status = wait_child(&mut target_child, "target", &req.pipeline_id)?;

    tap_logger.join().expect("tap logger panicked");
    target_logger.join().expect("target logger panicked");

    if !tap_status.success() {
        return Err(pipeline_err(&req.pipeline_id, "tap exited with a non-zero status".to_string()));
    }
    if !target_status.success() {
        return Err(pipeline_err(&req.pipeline_id, "target exited with a non-zero status".to_string()));
    }

    let state_log_path = if req.tap.capabilities.contains(&Capability::State) {
        Some(state_log_path)
    } else {
        None
    };

    Ok(PipelineReport {
        tap_log_path,
        target_log_path,
        state_log_path,
    })
}

fn wait_child(child: &mut Child, name: &str, pipeline_id: &str) -> Result<std::process::ExitStatus, AltoError> {
    child
        .wait()
        .map_err(|e| pipeline_err(pipeline_id, format!("failed to wait on {name}: {e}")))
}

fn pipeline_err(pipeline_id: &str, message: String) -> AltoError {
    AltoError::Pipeline {
        pipeline_id: pipeline_id.to_string(),
        message,
    }
}

fn spawn_stderr_logger(
    pipe: impl Read + Send + 'static,
    log_path: PathBuf,
    label: String,
    reporter: SharedReporter,
    console_mutex: Arc<Mutex<()>>,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let mut log_file = File::create(&log_path).ok();
        let reader = BufReader::new(pipe);
        for line in reader.lines().map_while(Result::ok) {
            if let Some(f) = log_file.as_mut() {
                let _ = writeln!(f, "{line}");
            }
            let _guard = console_mutex.lock().unwrap_or_else(|e| e.into_inner());
            reporter.info(&format!("[{label}] {line}"));
        }
    })
}

/// Splices tap stdout into target stdin, routing SCHEMA/RECORD messages
/// through the map chain when it is non-empty; any other line (or any
/// line at all, when the chain is empty) passes through unchanged.
fn spawn_splice(
    tap_stdout: impl Read + Send + 'static,
    mut target_stdin: impl Write + Send + 'static,
    map_chain: MapChain,
) -> thread::JoinHandle<Result<(), AltoError>> {
    thread::spawn(move || -> Result<(), AltoError> {
        let reader = BufReader::new(tap_stdout);
        for line in reader.lines() {
            let line = line.map_err(|e| AltoError::Decode(e.to_string()))?;
            if line.is_empty() {
                continue;
            }
            let out_line = if map_chain.is_empty() {
                line
            } else {
                transform_line(&map_chain, &line)
            };
            writeln!(target_stdin, "{out_line}").map_err(|e| AltoError::Decode(e.to_string()))?;
        }
        Ok(())
    })
}

fn transform_line(map_chain: &MapChain, line: &str) -> String {
    let Ok(message) = serde_json::from_str::<Value>(line) else {
        return line.to_string();
    };
    let msg_type = message.get("type").and_then(Value::as_str).unwrap_or("");
    let transformed = match msg_type {
        "SCHEMA" => map_chain.transform_schema(message),
        "RECORD" => map_chain.transform_record(message),
        _ => message,
    };
    serde_json::to_string(&transformed).unwrap_or_else(|_| line.to_string())
}

/// Merges a captured state log into the persisted state document,
/// returning the merged document. Callers persist the mutable copy and
/// a timestamped immutable copy (see [`crate::state::immutable_copy_path`]).
pub fn fold_state_log(existing: Value, log_text: &str) -> Value {
    let lines = state::parse_state_lines(log_text);
    let values: Vec<Value> = lines
        .into_iter()
        .filter_map(|v| v.get("value").cloned())
        .collect();
    values.into_iter().fold(existing, |acc, v| state::merge(&acc, &v))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn plugin(name: &str, caps: &[Capability]) -> PipelinePlugin {
        PipelinePlugin {
            name: name.to_string(),
            capabilities: caps.iter().copied().collect::<HashSet<_>>(),
            entrypoint: None,
            binary: PathBuf::from(name),
            config_path: PathBuf::from(format!("{name}.json")),
        }
    }

    #[test]
    fn assemble_tap_args_includes_catalog_when_capable() {
        let tap = plugin("tap-csv", &[Capability::Catalog]);
        let args = assemble_tap_args(&tap, None, Some(&PathBuf::from("catalogs/tap-csv.json")), None);
        assert_eq!(
            args,
            vec![
                "--config".to_string(),
                "tap-csv.json".to_string(),
                "--catalog".to_string(),
                "catalogs/tap-csv.json".to_string()
            ]
        );
    }

    #[test]
    fn assemble_tap_args_prefers_properties_when_only_capable_of_that() {
        let tap = plugin("tap-csv", &[Capability::Properties]);
        let args = assemble_tap_args(&tap, None, None, Some(&PathBuf::from("props.json")));
        assert!(args.contains(&"--properties".to_string()));
        assert!(!args.contains(&"--catalog".to_string()));
    }

    #[test]
    fn assemble_tap_args_omits_state_flag_when_state_file_absent() {
        let tap = plugin("tap-csv", &[Capability::State]);
        let args = assemble_tap_args(&tap, Some(&PathBuf::from("/nonexistent/state.json")), None, None);
        assert!(!args.contains(&"--state".to_string()));
    }

    #[test]
    fn plugin_env_picks_module_vs_script_by_colon() {
        let mut tap = plugin("tap-csv", &[]);
        tap.entrypoint = Some("tap_csv.main:cli".to_string());
        let env = plugin_env(&HashMap::new(), &tap);
        assert_eq!(env.get("PEX_MODULE").unwrap(), "tap_csv.main:cli");
        assert_eq!(env.get("ALTO_PLUGIN").unwrap(), "tap-csv");

        let mut util = plugin("util-script", &[]);
        util.entrypoint = Some("/opt/bin/run.sh".to_string());
        let env = plugin_env(&HashMap::new(), &util);
        assert_eq!(env.get("PEX_SCRIPT").unwrap(), "/opt/bin/run.sh");
    }

    #[test]
    fn fold_state_log_merges_value_payloads_in_order() {
        let existing = serde_json::json!({"bookmarks": {"orders": {"id": 1}}});
        let log = "{\"type\":\"STATE\",\"value\":{\"bookmarks\":{\"orders\":{\"id\":2}}}}\n";
        let merged = fold_state_log(existing, log);
        assert_eq!(merged["bookmarks"]["orders"]["id"], serde_json::json!(2));
    }

    #[test]
    fn end_to_end_pipeline_with_real_subprocesses() {
        let tmp = tempfile::tempdir().unwrap();
        let tap = PipelinePlugin {
            name: "tap-echo".to_string(),
            capabilities: HashSet::new(),
            entrypoint: None,
            binary: PathBuf::from("printf"),
            config_path: tmp.path().join("tap.json"),
        };
        let target = PipelinePlugin {
            name: "target-cat".to_string(),
            capabilities: HashSet::new(),
            entrypoint: None,
            binary: PathBuf::from("cat"),
            config_path: tmp.path().join("target.json"),
        };
        let req = PipelineRequest {
            pipeline_id: "test-1".to_string(),
            tap,
            target,
            state_path: None,
            catalog_path: None,
            properties_path: None,
            map_chain: MapChain::new(vec![]),
            base_env: HashMap::new(),
            log_dir: tmp.path().join("logs"),
            reporter: SharedReporter::new(crate::reporter::ConsoleReporter),
            console_mutex: Arc::new(Mutex::new(())),
        };
        // `printf` ignores the assembled `--config ...` args and exits 0,
        // which is enough to exercise spawn/splice/wait wiring.
        let report = run_pipeline(req).unwrap();
        assert!(report.tap_log_path.exists());
        assert!(report.target_log_path.exists());
    }
}
