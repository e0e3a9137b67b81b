//! The generated Singer task set: `build`, `config`, `catalog`, `apply`,
//! `about`, `test`, the tap/target pipeline, and the reservoir
//! ingest/emit pair, wired with the dependency edges spec.md §4.K names:
//! pipeline depends on build of both sides and apply of the tap; apply
//! depends on catalog; catalog depends on build; config tasks are never
//! up to date.

use std::collections::HashMap;
use std::fs;
use std::io::BufReader;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex};

use serde_json::{json, Map, Value};

use crate::catalog::{apply_metadata, apply_selected, SingerCatalog, Strategy};
use crate::error::AltoError;
use crate::paths::{self, ALTO_ROOT, CONFIG_DIR};
use crate::pipeline::{assemble_tap_args, assemble_target_args, plugin_env, run_pipeline, PipelinePlugin, PipelineRequest};
use crate::settings::{Capability, Plugin, PluginKind};
use crate::streammap::{MapChain, PiiHashMap};

use super::graph::{Task, TaskBuilder, UpToDate};
use super::{EngineContext, TaskContributor};

/// Binary paths resolved by `build:<plugin>` tasks, shared with every
/// downstream task that needs to invoke that plugin.
type BinaryRegistry = Arc<Mutex<HashMap<String, PathBuf>>>;

/// One tap paired with one target, read from the workspace config's
/// `pipelines` array (`[{"tap": "tap-csv", "target": "target-postgres"}]`).
struct PipelinePair {
    tap: String,
    target: String,
}

/// Builds the stream-map chain for a tap from its `select` list: entries
/// prefixed `~` mark a field for PII hashing (the prefix is not a
/// selection operator and is stripped before matching).
fn map_chain_for(select: &[String]) -> MapChain {
    let pii_patterns: Vec<String> = select
        .iter()
        .filter_map(|p| p.strip_prefix('~').map(str::to_string))
        .collect();
    if pii_patterns.is_empty() {
        MapChain::new(Vec::new())
    } else {
        MapChain::new(vec![Box::new(PiiHashMap::new(pii_patterns))])
    }
}

/// Generates the builtin Singer task set described by spec.md.
pub struct BuiltinTasks;

impl TaskContributor for BuiltinTasks {
    fn tasks(&self, ctx: &EngineContext) -> Result<Vec<Task>, AltoError> {
        generate(ctx)
    }
}

fn generate(ctx: &EngineContext) -> Result<Vec<Task>, AltoError> {
    let raw_plugins = ctx.settings.plugins();
    let mut names: Vec<String> = raw_plugins.keys().cloned().collect();
    names.sort();

    let plugins: HashMap<String, Plugin> = names
        .iter()
        .map(|name| ctx.settings.resolve_plugin(name).map(|p| (name.clone(), p)))
        .collect::<Result<_, AltoError>>()?;

    let registry: BinaryRegistry = Arc::new(Mutex::new(HashMap::new()));
    let pairs = pipeline_pairs(ctx);

    let mut tasks = Vec::new();
    for name in &names {
        let plugin = &plugins[name];
        tasks.push(build_task(ctx, plugin, Arc::clone(&registry)));
        tasks.push(config_task(ctx, plugin));
        if plugin.kind == PluginKind::Tap {
            tasks.push(catalog_task(ctx, plugin, Arc::clone(&registry)));
            tasks.push(apply_task(ctx, plugin));
            tasks.push(about_task(ctx, plugin, Arc::clone(&registry)));
            tasks.push(test_task(ctx, plugin, Arc::clone(&registry)));
        }
    }

    for pair in &pairs {
        tasks.push(pipeline_task(ctx, pair, &plugins, Arc::clone(&registry))?);
        tasks.push(ingest_task(ctx, pair, &plugins, Arc::clone(&registry))?);
        tasks.push(emit_task(ctx, pair, &plugins, Arc::clone(&registry))?);
    }

    Ok(tasks)
}

fn pipeline_pairs(ctx: &EngineContext) -> Vec<PipelinePair> {
    ctx.settings
        .raw
        .get("pipelines")
        .and_then(Value::as_array)
        .map(|arr| {
            arr.iter()
                .filter_map(|entry| {
                    let tap = entry.get("tap")?.as_str()?.to_string();
                    let target = entry.get("target")?.as_str()?.to_string();
                    Some(PipelinePair { tap, target })
                })
                .collect()
        })
        .unwrap_or_default()
}

fn interpreter_identity(ctx: &EngineContext) -> (String, String, String, String) {
    let interpreter_version = ctx
        .base_env
        .get("ALTO_PYTHON_VERSION")
        .cloned()
        .unwrap_or_else(|| "unknown".to_string());
    let cache_version = ctx
        .base_env
        .get("ALTO_CACHE_VERSION")
        .cloned()
        .unwrap_or_else(|| "v1".to_string());
    (
        interpreter_version,
        std::env::consts::ARCH.to_string(),
        std::env::consts::OS.to_string(),
        cache_version,
    )
}

fn local_config_path(ctx: &EngineContext, name: &str) -> PathBuf {
    ctx.project_root
        .join(ALTO_ROOT)
        .join(CONFIG_DIR)
        .join(&ctx.env)
        .join(format!("{name}.json"))
}

fn local_path_for(ctx: &EngineContext, remote: &str) -> PathBuf {
    ctx.project_root.join(ALTO_ROOT).join(remote)
}

fn build_task(ctx: &EngineContext, plugin: &Plugin, registry: BinaryRegistry) -> Task {
    let (interpreter_version, machine, os, cache_version) = interpreter_identity(ctx);
    let requirement = plugin.requirement.clone().unwrap_or_default();
    let cache_key = paths::binary_cache_key(&requirement, &interpreter_version, &machine, &os, &cache_version);

    let resolver = Arc::clone(&ctx.resolver);
    let plugin_for_action = plugin.clone();
    let name = plugin.name.clone();

    TaskBuilder::new("build", name.clone())
        .set_uptodate(vec![UpToDate::ConfigChanged(json!({ "cache_key": cache_key }))])
        .set_actions(vec![Box::new(move |task_ctx| {
            let path = resolver.executable_path(&plugin_for_action, &cache_key)?;
            task_ctx.reporter.info(&format!("resolved {name} -> {}", path.display()));
            registry.lock().unwrap_or_else(|e| e.into_inner()).insert(name.clone(), path);
            Ok(())
        })])
        .build()
}

fn config_task(ctx: &EngineContext, plugin: &Plugin) -> Task {
    let path = local_config_path(ctx, &plugin.name);
    let config: Value = Value::Object(plugin.config.clone());
    let name = plugin.name.clone();

    TaskBuilder::new("config", name.clone())
        .set_uptodate(vec![UpToDate::Never])
        .set_actions(vec![Box::new(move |_| {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)
                    .map_err(|e| AltoError::config(format!("cannot create {}: {e}", parent.display())))?;
            }
            let bytes = serde_json::to_vec_pretty(&config)
                .map_err(|e| AltoError::config(format!("cannot render config for {name}: {e}")))?;
            fs::write(&path, bytes)
                .map_err(|e| AltoError::config(format!("cannot write {}: {e}", path.display())))
        })])
        .build()
}

fn catalog_task(ctx: &EngineContext, plugin: &Plugin, registry: BinaryRegistry) -> Task {
    let name = plugin.name.clone();
    let project_root = ctx.project_root.clone();
    let store = Arc::clone(&ctx.store);
    let catalog_path = paths::base_catalog_path(&name);
    let plugin_for_action = plugin.clone();
    let ctx_config_path = local_config_path(ctx, &name);

    TaskBuilder::new("catalog", name.clone())
        .set_task_dep(vec![format!("build:{name}")])
        .set_actions(vec![Box::new(move |_| {
            let tap = PipelinePlugin {
                name: plugin_for_action.name.clone(),
                capabilities: plugin_for_action.capabilities.clone(),
                entrypoint: plugin_for_action.entrypoint.clone(),
                binary: registry
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .get(&plugin_for_action.name)
                    .cloned()
                    .ok_or_else(|| AltoError::Discovery {
                        tap: name.clone(),
                        message: "build task has not run yet".to_string(),
                    })?,
                config_path: ctx_config_path.clone(),
            };
            let args = assemble_tap_args(&tap, None, None, None);

            let output = Command::new(&tap.binary)
                .args(&args)
                .arg("--discover")
                .current_dir(&project_root)
                .output()
                .map_err(|e| AltoError::Discovery { tap: name.clone(), message: e.to_string() })?;
            if !output.status.success() {
                return Err(AltoError::Discovery {
                    tap: name.clone(),
                    message: String::from_utf8_lossy(&output.stderr).to_string(),
                });
            }
            let value: Value = serde_json::from_slice(&output.stdout)
                .map_err(|e| AltoError::Discovery { tap: name.clone(), message: format!("invalid catalog JSON: {e}") })?;
            let catalog = SingerCatalog::from_value(&value);
            let bytes = serde_json::to_vec(&catalog.to_value())
                .map_err(|e| AltoError::Discovery { tap: name.clone(), message: e.to_string() })?;
            store
                .pipe(&catalog_path, &bytes)
                .map_err(|e| AltoError::store(&catalog_path, e.to_string()))
        })])
        .build()
}

fn apply_task(ctx: &EngineContext, plugin: &Plugin) -> Task {
    let name = plugin.name.clone();
    let store = Arc::clone(&ctx.store);
    let base_path = paths::base_catalog_path(&name);
    let applied_path = paths::applied_catalog_path(&name);
    let select = plugin.select.clone();
    let metadata = plugin.metadata.clone();

    TaskBuilder::new("apply", name.clone())
        .set_task_dep(vec![format!("catalog:{name}")])
        .set_actions(vec![Box::new(move |_| {
            let bytes = store.cat(&base_path).map_err(|e| AltoError::store(&base_path, e.to_string()))?;
            let value: Value = serde_json::from_slice(&bytes)
                .map_err(|e| AltoError::Decode(e.to_string()))?;
            let catalog = SingerCatalog::from_value(&value);

            let overlay: Vec<(String, Map<String, Value>)> = metadata
                .iter()
                .filter_map(|(pattern, v)| v.as_object().map(|m| (pattern.clone(), m.clone())))
                .collect();

            let catalog = apply_selected(catalog, &select, Strategy::Prune);
            let catalog = apply_metadata(catalog, &overlay);

            let bytes = serde_json::to_vec(&catalog.to_value()).map_err(|e| AltoError::Decode(e.to_string()))?;
            store
                .pipe(&applied_path, &bytes)
                .map_err(|e| AltoError::store(&applied_path, e.to_string()))
        })])
        .build()
}

fn about_task(ctx: &EngineContext, plugin: &Plugin, registry: BinaryRegistry) -> Task {
    capability_task(ctx, plugin, registry, "about", Capability::About, "--about")
}

fn test_task(ctx: &EngineContext, plugin: &Plugin, registry: BinaryRegistry) -> Task {
    capability_task(ctx, plugin, registry, "test", Capability::Test, "--test")
}

/// `about:<tap>`/`test:<tap>`: a no-op when the plugin doesn't declare the
/// capability, otherwise a bounded subprocess invocation.
fn capability_task(
    ctx: &EngineContext,
    plugin: &Plugin,
    registry: BinaryRegistry,
    basename: &str,
    capability: Capability,
    flag: &'static str,
) -> Task {
    let name = plugin.name.clone();
    let project_root = ctx.project_root.clone();
    let config_path = local_config_path(ctx, &name);
    let has_capability = plugin.capabilities.contains(&capability);
    let timeout = std::time::Duration::from_secs(60);

    TaskBuilder::new(basename, name.clone())
        .set_task_dep(vec![format!("build:{name}")])
        .set_actions(vec![Box::new(move |task_ctx| {
            if !has_capability {
                return Ok(());
            }
            let binary = registry
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .get(&name)
                .cloned()
                .ok_or_else(|| AltoError::config(format!("build:{name} has not run yet")))?;
            let binary_str = binary.display().to_string();
            let config_path_str = config_path.display().to_string();
            let output = crate::process::run_with_timeout(
                &binary_str,
                &["--config", config_path_str.as_str(), flag],
                &project_root,
                Some(timeout),
            )
            .map_err(|e| AltoError::config(e.to_string()))?;
            if !output.success() {
                return Err(AltoError::config(format!("{flag} failed for {name}: {}", output.stderr)));
            }
            task_ctx.reporter.info(&format!("{flag} {name}: {}", output.stdout.trim()));
            Ok(())
        })])
        .build()
}

fn pipeline_task(
    ctx: &EngineContext,
    pair: &PipelinePair,
    plugins: &HashMap<String, Plugin>,
    registry: BinaryRegistry,
) -> Result<Task, AltoError> {
    let tap_name = pair.tap.clone();
    let target_name = pair.target.clone();
    let tap_plugin = plugins
        .get(&tap_name)
        .ok_or_else(|| AltoError::config(format!("unknown tap in pipelines entry: {tap_name}")))?
        .clone();
    let target_plugin = plugins
        .get(&target_name)
        .ok_or_else(|| AltoError::config(format!("unknown target in pipelines entry: {target_name}")))?
        .clone();

    let project_root = ctx.project_root.clone();
    let env = ctx.env.clone();
    let store = Arc::clone(&ctx.store);
    let base_env = ctx.base_env.clone();
    let console_mutex = Arc::clone(&ctx.console_mutex);
    let reporter = ctx.reporter.clone();
    let applied_catalog_remote = paths::applied_catalog_path(&tap_name);
    let state_remote = paths::state_path(&env, &tap_name, &target_name);
    let log_dir = local_path_for(ctx, &paths::log_dir(&env));
    let tap_config_path = local_config_path(ctx, &tap_name);
    let target_config_path = local_config_path(ctx, &target_name);
    let applied_catalog_local = local_path_for(ctx, &applied_catalog_remote);
    let state_local = local_path_for(ctx, &state_remote);

    Ok(TaskBuilder::new(tap_name.clone(), target_name.clone())
        .set_task_dep(vec![
            format!("build:{tap_name}"),
            format!("build:{target_name}"),
            format!("apply:{tap_name}"),
            format!("config:{tap_name}"),
            format!("config:{target_name}"),
        ])
        .set_actions(vec![Box::new(move |_| {
            let registry = registry.lock().unwrap_or_else(|e| e.into_inner()).clone();
            let resolve = |p: &Plugin, config_path: &PathBuf| -> Result<PipelinePlugin, AltoError> {
                Ok(PipelinePlugin {
                    name: p.name.clone(),
                    capabilities: p.capabilities.clone(),
                    entrypoint: p.entrypoint.clone(),
                    binary: registry
                        .get(&p.name)
                        .cloned()
                        .ok_or_else(|| AltoError::config(format!("build:{} has not run yet", p.name)))?,
                    config_path: config_path.clone(),
                })
            };
            let tap = resolve(&tap_plugin, &tap_config_path)?;
            let target = resolve(&target_plugin, &target_config_path)?;

            if store.exists(&applied_catalog_remote) {
                store
                    .get(&applied_catalog_remote, &applied_catalog_local)
                    .map_err(|e| AltoError::store(&applied_catalog_remote, e.to_string()))?;
            }
            if tap.capabilities.contains(&Capability::State) && store.exists(&state_remote) {
                store
                    .get(&state_remote, &state_local)
                    .map_err(|e| AltoError::store(&state_remote, e.to_string()))?;
            }

            let pipeline_id = format!("{tap_name}-to-{target_name}");
            let report = run_pipeline(PipelineRequest {
                pipeline_id: pipeline_id.clone(),
                tap,
                target,
                state_path: Some(state_local.clone()),
                catalog_path: Some(applied_catalog_local.clone()),
                properties_path: None,
                map_chain: map_chain_for(&tap_plugin.select),
                base_env: base_env.clone(),
                log_dir: log_dir.clone(),
                reporter: reporter.clone(),
                console_mutex: Arc::clone(&console_mutex),
            })?;

            if let Some(state_log_path) = report.state_log_path {
                let log_text = fs::read_to_string(&state_log_path)
                    .map_err(|e| AltoError::Pipeline { pipeline_id: pipeline_id.clone(), message: e.to_string() })?;
                let existing = if state_local.exists() {
                    let bytes = fs::read(&state_local)
                        .map_err(|e| AltoError::Pipeline { pipeline_id: pipeline_id.clone(), message: e.to_string() })?;
                    serde_json::from_slice(&bytes).unwrap_or_else(|_| json!({}))
                } else {
                    json!({})
                };
                let merged = crate::pipeline::fold_state_log(existing, &log_text);
                let bytes = serde_json::to_vec(&merged).map_err(|e| AltoError::StateMerge(e.to_string()))?;
                store
                    .pipe(&state_remote, &bytes)
                    .map_err(|e| AltoError::store(&state_remote, e.to_string()))?;
            }
            Ok(())
        })])
        .build())
}

fn ingest_task(
    ctx: &EngineContext,
    pair: &PipelinePair,
    plugins: &HashMap<String, Plugin>,
    registry: BinaryRegistry,
) -> Result<Task, AltoError> {
    let tap_name = pair.tap.clone();
    let tap_plugin = plugins
        .get(&tap_name)
        .ok_or_else(|| AltoError::config(format!("unknown tap in pipelines entry: {tap_name}")))?
        .clone();

    let project_root = ctx.project_root.clone();
    let env = ctx.env.clone();
    let store = Arc::clone(&ctx.store);
    let base_env = ctx.base_env.clone();
    let applied_catalog_remote = paths::applied_catalog_path(&tap_name);
    let applied_catalog_local = local_path_for(ctx, &applied_catalog_remote);
    let tap_config_path = local_config_path(ctx, &tap_name);

    Ok(TaskBuilder::new(tap_name.clone(), "reservoir")
        .set_task_dep(vec![format!("build:{tap_name}"), format!("apply:{tap_name}"), format!("config:{tap_name}")])
        .set_actions(vec![Box::new(move |_| {
            let binary = registry
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .get(&tap_name)
                .cloned()
                .ok_or_else(|| AltoError::config(format!("build:{tap_name} has not run yet")))?;
            let tap = PipelinePlugin {
                name: tap_plugin.name.clone(),
                capabilities: tap_plugin.capabilities.clone(),
                entrypoint: tap_plugin.entrypoint.clone(),
                binary,
                config_path: tap_config_path.clone(),
            };
            if store.exists(&applied_catalog_remote) {
                store
                    .get(&applied_catalog_remote, &applied_catalog_local)
                    .map_err(|e| AltoError::store(&applied_catalog_remote, e.to_string()))?;
            }
            let args = assemble_tap_args(&tap, None, Some(&applied_catalog_local), None);
            let env_vars = plugin_env(&base_env, &tap);

            let mut child = Command::new(&tap.binary)
                .args(&args)
                .current_dir(&project_root)
                .envs(&env_vars)
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .spawn()
                .map_err(|e| AltoError::Pipeline { pipeline_id: format!("ingest-{tap_name}"), message: e.to_string() })?;

            let stdout = child.stdout.take().expect("piped stdout");
            let outcome = crate::reservoir::tap_to_reservoir(
                store.as_ref(),
                &env,
                &tap_name,
                BufReader::new(stdout),
                &map_chain_for(&tap_plugin.select),
                crate::reservoir::RESERVOIR_BUFFER_SIZE,
            )?;

            let status = child
                .wait()
                .map_err(|e| AltoError::Pipeline { pipeline_id: format!("ingest-{tap_name}"), message: e.to_string() })?;
            if !status.success() {
                return Err(AltoError::Pipeline {
                    pipeline_id: format!("ingest-{tap_name}"),
                    message: format!("tap exited with {status}"),
                });
            }
            let _ = outcome;
            Ok(())
        })])
        .build())
}

fn emit_task(
    ctx: &EngineContext,
    pair: &PipelinePair,
    plugins: &HashMap<String, Plugin>,
    registry: BinaryRegistry,
) -> Result<Task, AltoError> {
    let tap_name = pair.tap.clone();
    let target_name = pair.target.clone();
    let target_plugin = plugins
        .get(&target_name)
        .ok_or_else(|| AltoError::config(format!("unknown target in pipelines entry: {target_name}")))?
        .clone();

    let project_root = ctx.project_root.clone();
    let env = ctx.env.clone();
    let store = Arc::clone(&ctx.store);
    let base_env = ctx.base_env.clone();
    let target_config_path = local_config_path(ctx, &target_name);

    Ok(TaskBuilder::new("reservoir", format!("{tap_name}-{target_name}"))
        .set_task_dep(vec![format!("build:{target_name}"), format!("config:{target_name}")])
        .set_actions(vec![Box::new(move |_| {
            let binary = registry
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .get(&target_name)
                .cloned()
                .ok_or_else(|| AltoError::config(format!("build:{target_name} has not run yet")))?;
            let target = PipelinePlugin {
                name: target_plugin.name.clone(),
                capabilities: target_plugin.capabilities.clone(),
                entrypoint: target_plugin.entrypoint.clone(),
                binary,
                config_path: target_config_path.clone(),
            };
            let args = assemble_target_args(&target);
            let env_vars = plugin_env(&base_env, &target);

            let mut child = Command::new(&target.binary)
                .args(&args)
                .current_dir(&project_root)
                .envs(&env_vars)
                .stdin(Stdio::piped())
                .stdout(Stdio::null())
                .stderr(Stdio::piped())
                .spawn()
                .map_err(|e| AltoError::Pipeline { pipeline_id: format!("emit-{tap_name}-{target_name}"), message: e.to_string() })?;

            let stdin = child.stdin.take().expect("piped stdin");
            let outcome = crate::reservoir::reservoir_to_target(store.as_ref(), &env, &tap_name, &target_name, stdin)?;

            let status = child
                .wait()
                .map_err(|e| AltoError::Pipeline { pipeline_id: format!("emit-{tap_name}-{target_name}"), message: e.to_string() })?;
            if !status.success() {
                return Err(AltoError::Pipeline {
                    pipeline_id: format!("emit-{tap_name}-{target_name}"),
                    message: format!("target exited with {status}"),
                });
            }
            let _ = outcome;
            Ok(())
        })])
        .build())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reporter::{ConsoleReporter, SharedReporter};
    use crate::settings::Settings;
    use crate::store::LocalObjectStore;

    struct StubResolver;

    impl super::super::BinaryResolver for StubResolver {
        fn executable_path(&self, _plugin: &Plugin, _cache_key: &str) -> Result<PathBuf, AltoError> {
            Ok(PathBuf::from("/bin/true"))
        }
    }

    fn settings_with(raw: Value) -> Settings {
        Settings { env: "dev".to_string(), raw }
    }

    fn ctx(tmp: &std::path::Path, raw: Value) -> EngineContext {
        EngineContext {
            project_root: tmp.to_path_buf(),
            env: "dev".to_string(),
            settings: settings_with(raw),
            store: Arc::new(LocalObjectStore::new(tmp)),
            resolver: Arc::new(StubResolver),
            reporter: SharedReporter::new(ConsoleReporter),
            base_env: HashMap::new(),
            console_mutex: Arc::new(Mutex::new(())),
            max_concurrent: 2,
        }
    }

    #[test]
    fn generates_build_and_config_tasks_per_plugin() {
        let tmp = tempfile::tempdir().unwrap();
        let raw = json!({
            "plugins": {
                "tap-csv": {"kind": "tap", "requirement": "tap-csv==1.0", "capabilities": ["discover", "catalog"]},
                "target-jsonl": {"kind": "target", "requirement": "target-jsonl==1.0", "capabilities": []},
            }
        });
        let ctx = ctx(tmp.path(), raw);
        let tasks = generate(&ctx).unwrap();
        let identities: Vec<String> = tasks.iter().map(|t| t.identity()).collect();
        assert!(identities.contains(&"build:tap-csv".to_string()));
        assert!(identities.contains(&"config:tap-csv".to_string()));
        assert!(identities.contains(&"catalog:tap-csv".to_string()));
        assert!(identities.contains(&"apply:tap-csv".to_string()));
        assert!(identities.contains(&"build:target-jsonl".to_string()));
        assert!(!identities.contains(&"catalog:target-jsonl".to_string()));
    }

    #[test]
    fn pipeline_pairs_generate_pipeline_ingest_and_emit_tasks() {
        let tmp = tempfile::tempdir().unwrap();
        let raw = json!({
            "plugins": {
                "tap-csv": {"kind": "tap", "requirement": "tap-csv==1.0", "capabilities": []},
                "target-jsonl": {"kind": "target", "requirement": "target-jsonl==1.0", "capabilities": []},
            },
            "pipelines": [{"tap": "tap-csv", "target": "target-jsonl"}],
        });
        let ctx = ctx(tmp.path(), raw);
        let tasks = generate(&ctx).unwrap();
        let identities: Vec<String> = tasks.iter().map(|t| t.identity()).collect();
        assert!(identities.contains(&"tap-csv:target-jsonl".to_string()));
        assert!(identities.contains(&"tap-csv:reservoir".to_string()));
        assert!(identities.contains(&"reservoir:tap-csv-target-jsonl".to_string()));

        let pipeline = tasks.iter().find(|t| t.identity() == "tap-csv:target-jsonl").unwrap();
        assert!(pipeline.task_dep.contains(&"apply:tap-csv".to_string()));
        assert!(pipeline.task_dep.contains(&"build:target-jsonl".to_string()));
    }

    #[test]
    fn map_chain_for_strips_pii_prefix_and_skips_plain_selectors() {
        let select = vec!["*.*".to_string(), "~users.email".to_string()];
        let chain = map_chain_for(&select);
        assert!(!chain.is_empty());

        let schema = chain.transform_schema(json!({
            "type": "SCHEMA",
            "stream": "users",
            "schema": {"properties": {"email": {"type": "string"}}},
        }));
        assert_eq!(schema["schema"]["properties"]["email"]["format"], json!("hash"));
    }

    #[test]
    fn map_chain_for_is_empty_without_pii_selectors() {
        let select = vec!["*.*".to_string()];
        assert!(map_chain_for(&select).is_empty());
    }

    #[test]
    fn build_task_is_config_changed_gated_on_cache_key() {
        let tmp = tempfile::tempdir().unwrap();
        let raw = json!({
            "plugins": { "tap-csv": {"kind": "tap", "requirement": "tap-csv==1.0", "capabilities": []} }
        });
        let ctx = ctx(tmp.path(), raw);
        let tasks = generate(&ctx).unwrap();
        let build = tasks.iter().find(|t| t.identity() == "build:tap-csv").unwrap();
        assert!(matches!(build.uptodate.as_slice(), [UpToDate::ConfigChanged(_)]));
    }
}
