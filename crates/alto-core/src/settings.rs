//! Layered configuration and plugin model.
//!
//! The settings object this module builds is what every other component
//! consumes for plugin/env lookups; `spec.md` treats the *loader* as an
//! external collaborator, but a real crate still needs one to hand
//! `alto-cli` something to call.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::AltoError;
use crate::state;

pub const SUPPORTED_CONFIG_FORMATS: &[&str] = &["toml", "yaml", "yml", "json"];
pub const DEFAULT_ENVIRONMENT: &str = "dev";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginKind {
    Tap,
    Target,
    Utility,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    State,
    About,
    Test,
    Catalog,
    Properties,
    Discover,
}

#[derive(Debug, Clone)]
pub struct Plugin {
    pub name: String,
    pub kind: PluginKind,
    pub requirement: Option<String>,
    pub capabilities: HashSet<Capability>,
    pub select: Vec<String>,
    pub metadata: Map<String, Value>,
    pub config: Map<String, Value>,
    pub entrypoint: Option<String>,
}

/// Resolve a plugin's spec, following `inherit_from` chains (own settings
/// win key-by-key over the parent's) and rejecting cycles.
pub fn resolve_plugin(raw_plugins: &HashMap<String, Value>, name: &str) -> Result<Plugin, AltoError> {
    let resolved = resolve_raw(raw_plugins, name, &mut Vec::new())?;
    deserialize_plugin(name, &resolved)
}

fn resolve_raw(raw_plugins: &HashMap<String, Value>, name: &str, seen: &mut Vec<String>) -> Result<Value, AltoError> {
    if seen.contains(&name.to_string()) {
        return Err(AltoError::config(format!(
            "cycle in plugin inheritance: {} -> {name}",
            seen.join(" -> ")
        )));
    }
    seen.push(name.to_string());

    let own = raw_plugins
        .get(name)
        .ok_or_else(|| AltoError::config(format!("unknown plugin: {name}")))?;

    match own.get("inherit_from").and_then(Value::as_str) {
        Some(parent_name) => {
            let parent = resolve_raw(raw_plugins, parent_name, seen)?;
            Ok(state::merge(&parent, own))
        }
        None => Ok(own.clone()),
    }
}

fn deserialize_plugin(name: &str, value: &Value) -> Result<Plugin, AltoError> {
    let obj = value
        .as_object()
        .ok_or_else(|| AltoError::config(format!("plugin {name} spec is not an object")))?;

    let kind: PluginKind = obj
        .get("kind")
        .and_then(|v| serde_json::from_value(v.clone()).ok())
        .ok_or_else(|| AltoError::config(format!("plugin {name} missing or invalid kind")))?;

    let requirement = obj.get("requirement").and_then(Value::as_str).map(String::from);
    if requirement.is_none() && kind != PluginKind::Utility {
        return Err(AltoError::config(format!(
            "plugin {name} has no requirements string"
        )));
    }

    let capabilities = obj
        .get("capabilities")
        .and_then(Value::as_array)
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str())
                .filter_map(|s| serde_json::from_value(Value::String(s.to_string())).ok())
                .collect()
        })
        .unwrap_or_default();

    let select = obj
        .get("select")
        .and_then(Value::as_array)
        .map(|arr| arr.iter().filter_map(|v| v.as_str().map(String::from)).collect())
        .unwrap_or_default();

    let metadata = obj.get("metadata").and_then(Value::as_object).cloned().unwrap_or_default();
    let config = obj.get("config").and_then(Value::as_object).cloned().unwrap_or_default();
    let entrypoint = obj.get("entrypoint").and_then(Value::as_str).map(String::from);

    Ok(Plugin {
        name: name.to_string(),
        kind,
        requirement,
        capabilities,
        select,
        metadata,
        config,
        entrypoint,
    })
}

/// Layered, environment-switchable settings: `default` overlaid by the
/// `ALTO_ENV`-selected table, overlaid by `secrets`, overlaid by
/// `ALTO_`-prefixed environment variables.
#[derive(Debug, Clone)]
pub struct Settings {
    pub env: String,
    pub raw: Value,
}

impl Settings {
    pub fn plugins(&self) -> HashMap<String, Value> {
        self.raw
            .get("plugins")
            .and_then(Value::as_object)
            .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default()
    }

    pub fn resolve_plugin(&self, name: &str) -> Result<Plugin, AltoError> {
        resolve_plugin(&self.plugins(), name)
    }
}

fn parse_config_text(text: &str, format: &str) -> anyhow::Result<Value> {
    match format {
        "toml" => Ok(toml_to_json(toml::from_str::<toml::Value>(text)?)),
        "yaml" | "yml" => Ok(serde_yaml::from_str(text)?),
        "json" => Ok(serde_json::from_str(text)?),
        other => anyhow::bail!("unsupported config format: {other}"),
    }
}

fn toml_to_json(value: toml::Value) -> Value {
    match value {
        toml::Value::String(s) => Value::String(s),
        toml::Value::Integer(i) => Value::Number(i.into()),
        toml::Value::Float(f) => serde_json::Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null),
        toml::Value::Boolean(b) => Value::Bool(b),
        toml::Value::Datetime(d) => Value::String(d.to_string()),
        toml::Value::Array(arr) => Value::Array(arr.into_iter().map(toml_to_json).collect()),
        toml::Value::Table(tbl) => {
            Value::Object(tbl.into_iter().map(|(k, v)| (k, toml_to_json(v))).collect())
        }
    }
}

fn find_config_file(root: &Path) -> Option<(std::path::PathBuf, &'static str)> {
    for format in SUPPORTED_CONFIG_FORMATS {
        let path = root.join(format!("alto.{format}"));
        if path.exists() {
            return Some((path, format));
        }
    }
    None
}

/// Load settings from `alto.{toml,yaml,yml,json}` at `root`, selecting
/// `env` (default `ALTO_ENV` or `"dev"`), overlaying `secrets`, then
/// overlaying `ALTO_`-prefixed environment variables.
pub fn load_from_workspace(root: &Path, env: &str) -> anyhow::Result<Settings> {
    let base = match find_config_file(root) {
        Some((path, format)) => {
            let text = std::fs::read_to_string(&path)?;
            parse_config_text(&text, format)?
        }
        None => Value::Object(Map::new()),
    };

    let defaults = base.get("default").cloned().unwrap_or(Value::Object(Map::new()));
    let env_layer = base.get(env).cloned().unwrap_or(Value::Object(Map::new()));
    let secrets = base.get("secrets").cloned().unwrap_or(Value::Object(Map::new()));

    let merged = state::merge(&state::merge(&defaults, &env_layer), &secrets);
    let merged = overlay_env_vars(merged, std::env::vars());

    Ok(Settings {
        env: env.to_string(),
        raw: merged,
    })
}

fn overlay_env_vars(mut value: Value, vars: impl Iterator<Item = (String, String)>) -> Value {
    for (key, val) in vars {
        let Some(rest) = key.strip_prefix("ALTO_") else {
            continue;
        };
        if rest.is_empty() || rest == "ENV" || rest == "MAX_WAIT" {
            continue;
        }
        let path: Vec<String> = rest.split("__").map(|seg| seg.to_lowercase().replace('_', "-")).collect();
        let leaf: Value = serde_json::from_str(&val).unwrap_or(Value::String(val));
        set_nested(&mut value, &path, leaf);
    }
    value
}

fn set_nested(root: &mut Value, path: &[String], leaf: Value) {
    if path.is_empty() {
        return;
    }
    if !root.is_object() {
        *root = Value::Object(Map::new());
    }
    let obj = root.as_object_mut().unwrap();
    if path.len() == 1 {
        obj.insert(path[0].clone(), leaf);
        return;
    }
    let child = obj.entry(path[0].clone()).or_insert_with(|| Value::Object(Map::new()));
    set_nested(child, &path[1..], leaf);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    #[test]
    fn resolve_plugin_merges_parent_with_own_winning() {
        let mut raw = HashMap::new();
        raw.insert(
            "tap-base".to_string(),
            json!({"kind": "tap", "requirement": "tap-base==1.0", "config": {"a": 1, "b": 1}}),
        );
        raw.insert(
            "tap-child".to_string(),
            json!({"kind": "tap", "inherit_from": "tap-base", "config": {"b": 2}}),
        );
        let plugin = resolve_plugin(&raw, "tap-child").unwrap();
        assert_eq!(plugin.requirement.as_deref(), Some("tap-base==1.0"));
        assert_eq!(plugin.config["a"], json!(1));
        assert_eq!(plugin.config["b"], json!(2));
    }

    #[test]
    fn resolve_plugin_rejects_inheritance_cycle() {
        let mut raw = HashMap::new();
        raw.insert("a".to_string(), json!({"kind": "tap", "inherit_from": "b"}));
        raw.insert("b".to_string(), json!({"kind": "tap", "inherit_from": "a"}));
        let err = resolve_plugin(&raw, "a").unwrap_err();
        assert!(matches!(err, AltoError::Config(_)));
    }

    #[test]
    fn utility_plugins_may_omit_requirement() {
        let mut raw = HashMap::new();
        raw.insert("util".to_string(), json!({"kind": "utility"}));
        let plugin = resolve_plugin(&raw, "util").unwrap();
        assert!(plugin.requirement.is_none());
    }

    #[test]
    fn non_utility_plugin_without_requirement_is_an_error() {
        let mut raw = HashMap::new();
        raw.insert("tap-x".to_string(), json!({"kind": "tap"}));
        let err = resolve_plugin(&raw, "tap-x").unwrap_err();
        assert!(matches!(err, AltoError::Config(_)));
    }

    #[test]
    fn env_var_overlay_builds_nested_path() {
        let base = json!({"taps": {"tap-csv": {"config": {"path": "old"}}}});
        let vars = vec![("ALTO_TAPS__TAP_CSV__CONFIG__PATH".to_string(), "new".to_string())];
        let out = overlay_env_vars(base, vars.into_iter());
        assert_eq!(out["taps"]["tap-csv"]["config"]["path"], json!("new"));
    }

    #[test]
    fn env_var_overlay_skips_env_and_max_wait() {
        let base = json!({});
        let vars = vec![
            ("ALTO_ENV".to_string(), "prod".to_string()),
            ("ALTO_MAX_WAIT".to_string(), "30".to_string()),
        ];
        let out = overlay_env_vars(base, vars.into_iter());
        assert_eq!(out, json!({}));
    }

    #[test]
    fn toml_table_round_trips_through_json_value() {
        let parsed: toml::Value = toml::from_str("a = 1\n[b]\nc = \"x\"\n").unwrap();
        let json_val = toml_to_json(parsed);
        assert_eq!(json_val["a"], json!(1));
        assert_eq!(json_val["b"]["c"], json!("x"));
    }
}
