//! Deterministic path derivation.
//!
//! All paths are computed from (project root, plugin name, environment)
//! and are slash-separated regardless of host OS, since they double as
//! object-store keys.

use sha1::{Digest, Sha1};

pub const ALTO_ROOT: &str = ".alto";
pub const ALTO_DB_FILE: &str = ".alto.json";
pub const PLUGIN_DIR: &str = "plugins";
pub const CATALOG_DIR: &str = "catalogs";
pub const CONFIG_DIR: &str = "config";
pub const DEFAULT_ENVIRONMENT: &str = "dev";

/// `sha1(requirements || interpreter_version || machine || os || user_cache_version)`
pub fn binary_cache_key(
    requirements: &str,
    interpreter_version: &str,
    machine: &str,
    os: &str,
    user_cache_version: &str,
) -> String {
    let mut hasher = Sha1::new();
    hasher.update(requirements.as_bytes());
    hasher.update(interpreter_version.as_bytes());
    hasher.update(machine.as_bytes());
    hasher.update(os.as_bytes());
    hasher.update(user_cache_version.as_bytes());
    hex::encode(hasher.finalize())
}

pub fn plugin_binary_path(plugin: &str, cache_key: &str) -> String {
    format!("{PLUGIN_DIR}/{plugin}/{cache_key}")
}

pub fn state_path(env: &str, tap: &str, target: &str) -> String {
    format!("state/{env}/{tap}-to-{target}.json")
}

pub fn base_catalog_path(tap: &str) -> String {
    format!("{CATALOG_DIR}/{tap}.base.json")
}

pub fn applied_catalog_path(tap: &str) -> String {
    format!("{CATALOG_DIR}/{tap}.json")
}

pub fn reservoir_base(env: &str, tap: &str) -> String {
    format!("reservoir/{env}/{tap}")
}

pub fn reservoir_index_path(env: &str, tap: &str) -> String {
    format!("{}/_reservoir.json", reservoir_base(env, tap))
}

pub fn reservoir_lock_path(env: &str, tap: &str) -> String {
    format!("{}/_reservoir.lock", reservoir_base(env, tap))
}

pub fn reservoir_record_path(env: &str, tap: &str, stream: &str, schema_id: &str, ts: &str) -> String {
    format!("{}/{stream}/{schema_id}/{ts}.singer.gz", reservoir_base(env, tap))
}

/// State path used by the reservoir emitter: the tap's `-to-` pairing
/// with `tap` replaced by `reservoir`, per spec (`tap.name.replace("tap",
/// "reservoir")`).
pub fn reservoir_state_path(env: &str, tap: &str, target: &str) -> String {
    let reservoir_name = tap.replacen("tap", "reservoir", 1);
    format!("state/{env}/{reservoir_name}-to-{target}.json")
}

pub fn log_dir(env: &str) -> String {
    format!("logs/{env}")
}

pub fn log_path(env: &str, name: &str) -> String {
    format!("{}/{name}", log_dir(env))
}
