//! reservoir -> target: bookmarked, resumable emission.

use std::collections::HashMap;
use std::io::{Read, Write};

use flate2::read::GzDecoder;
use serde_json::{Map, Value};

use crate::error::AltoError;
use crate::reservoir::index::{filename, load_or_default, persist, schema_id_of, ReservoirIndex};
use crate::store::ObjectStore;

pub struct EmitOutcome {
    pub state: Value,
    pub emitted_counts: HashMap<String, usize>,
}

/// Loads the index, rebuilding it from a directory listing when
/// `_reservoir.json` is missing: lists stream subdirectories under
/// `base`, globs `.singer.gz` files beneath each, sorts lexicographically,
/// and writes a fresh `{__version__: 0}` index.
fn load_or_rebuild_index(
    store: &dyn ObjectStore,
    env: &str,
    tap: &str,
) -> Result<ReservoirIndex, AltoError> {
    let index_path = crate::paths::reservoir_index_path(env, tap);
    if store.exists(&index_path) {
        return load_or_default(store, &index_path).map_err(|e| AltoError::store(&index_path, e.to_string()));
    }

    let base = crate::paths::reservoir_base(env, tap);
    let mut index = ReservoirIndex::default();
    for stream_dir in store.ls(&base).map_err(|e| AltoError::store(&base, e.to_string()))? {
        if !store.isdir(&stream_dir) {
            continue;
        }
        let stream = filename(&stream_dir).to_string();
        let mut paths = store
            .glob(&format!("{stream_dir}/**/*.singer.gz"))
            .map_err(|e| AltoError::store(&stream_dir, e.to_string()))?;
        paths.sort();
        if !paths.is_empty() {
            index.streams.insert(stream, paths);
        }
    }
    persist(store, &index_path, &index).map_err(|e| AltoError::store(&index_path, e.to_string()))?;
    Ok(index)
}

fn load_target_state(store: &dyn ObjectStore, state_path: &str) -> Result<Value, AltoError> {
    match store.cat(state_path) {
        Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| AltoError::StateMerge(e.to_string())),
        Err(crate::store::StoreError::NotFound(_)) => Ok(Value::Object(Map::new())),
        Err(e) => Err(AltoError::store(state_path, e.to_string())),
    }
}

fn stream_emitted(state: &Value, stream: &str) -> Option<String> {
    state
        .get(stream)
        .and_then(|s| s.get("emitted"))
        .and_then(Value::as_str)
        .map(String::from)
}

fn set_stream_emitted(state: &mut Value, stream: &str, filename: &str) {
    if !state.is_object() {
        *state = Value::Object(Map::new());
    }
    let obj = state.as_object_mut().unwrap();
    let entry = obj.entry(stream).or_insert_with(|| Value::Object(Map::new()));
    entry["emitted"] = Value::String(filename.to_string());
}

/// If the index has been compacted (`state.__version__ != index.__version__`),
/// rebuild each stream's bookmark to the greatest known filename `<=` the
/// previously emitted one, then adopt the new version.
fn reconcile_version(state: &mut Value, index: &ReservoirIndex) {
    let state_version = state.get("__version__").and_then(Value::as_u64).unwrap_or(0);
    if state_version == index.version {
        return;
    }
    for (stream, paths) in &index.streams {
        if let Some(previous) = stream_emitted(state, stream) {
            let candidate = paths
                .iter()
                .map(|p| filename(p))
                .filter(|f| *f <= previous.as_str())
                .max()
                .map(String::from);
            if let Some(candidate) = candidate {
                set_stream_emitted(state, stream, &candidate);
            }
        }
    }
    if let Some(obj) = state.as_object_mut() {
        obj.insert("__version__".to_string(), Value::Number(index.version.into()));
    }
}

/// Emits every not-yet-emitted `.singer.gz` record, in schema-id
/// partitions, to `sink` (the target's stdin). Persists the updated
/// bookmark after each partition.
pub fn reservoir_to_target(
    store: &dyn ObjectStore,
    env: &str,
    tap: &str,
    target: &str,
    mut sink: impl Write,
) -> Result<EmitOutcome, AltoError> {
    let index = load_or_rebuild_index(store, env, tap)?;
    let state_path = crate::paths::reservoir_state_path(env, tap, target);
    let mut state = load_target_state(store, &state_path)?;
    reconcile_version(&mut state, &index);

    let mut emitted_counts = HashMap::new();

    for (stream, paths) in &index.streams {
        let emitted_bookmark = stream_emitted(&state, stream);
        let work_queue: Vec<&String> = paths
            .iter()
            .filter(|p| emitted_bookmark.as_deref().map(|e| filename(p) > e).unwrap_or(true))
            .collect();
        if work_queue.is_empty() {
            continue;
        }

        let mut partitions: Vec<(String, Vec<String>)> = Vec::new();
        for path in &work_queue {
            let id = schema_id_of(path).to_string();
            match partitions.last_mut() {
                Some((last_id, group)) if *last_id == id => group.push((*path).clone()),
                _ => partitions.push((id, vec![(*path).clone()])),
            }
        }

        let mut count = 0usize;
        for (_, group) in &partitions {
            let bytes_by_path = store
                .cat_many(group)
                .map_err(|e| AltoError::store(stream, e.to_string()))?;
            for path in group {
                let gz_bytes = bytes_by_path.get(path).cloned().unwrap_or_default();
                let mut decoder = GzDecoder::new(gz_bytes.as_slice());
                let mut text = String::new();
                decoder
                    .read_to_string(&mut text)
                    .map_err(|e| AltoError::store(path, e.to_string()))?;
                for line in text.lines().filter(|l| !l.is_empty()) {
                    writeln!(sink, "{line}").map_err(|e| AltoError::store(path, e.to_string()))?;
                    count += 1;
                }
            }
            if let Some(max_filename) = group.iter().map(|p| filename(p)).max() {
                let new_bookmark = match stream_emitted(&state, stream) {
                    Some(existing) if existing.as_str() >= max_filename => existing,
                    _ => max_filename.to_string(),
                };
                set_stream_emitted(&mut state, stream, &new_bookmark);
                store
                    .pipe(&state_path, &serde_json::to_vec_pretty(&state).unwrap_or_default())
                    .map_err(|e| AltoError::store(&state_path, e.to_string()))?;
            }
        }
        emitted_counts.insert(stream.clone(), count);
    }

    Ok(EmitOutcome { state, emitted_counts })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::LocalObjectStore;
    use flate2::write::GzEncoder;
    use flate2::Compression;

    fn gz(lines: &[&str]) -> Vec<u8> {
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        for l in lines {
            writeln!(enc, "{l}").unwrap();
        }
        enc.finish().unwrap()
    }

    #[test]
    fn scenario_4_emit_after_compaction_reconciliation() {
        let tmp = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(tmp.path());

        store
            .pipe(
                "reservoir/dev/tap-csv/s/sid/b.gz",
                &gz(&["{\"type\":\"SCHEMA\",\"stream\":\"s\",\"schema\":{}}", "{\"type\":\"RECORD\",\"stream\":\"s\",\"record\":{}}"]),
            )
            .unwrap();
        store
            .pipe("reservoir/dev/tap-csv/s/sid/c.gz", &gz(&["{\"type\":\"RECORD\",\"stream\":\"s\",\"record\":{}}"]))
            .unwrap();

        let mut index = ReservoirIndex { version: 4, streams: Default::default() };
        index.append("s", "reservoir/dev/tap-csv/s/sid/b.gz".to_string());
        index.append("s", "reservoir/dev/tap-csv/s/sid/c.gz".to_string());
        persist(&store, "reservoir/dev/tap-csv/_reservoir.json", &index).unwrap();

        let state_path = crate::paths::reservoir_state_path("dev", "tap-csv", "target-csv");
        let initial_state = serde_json::json!({"__version__": 3, "s": {"emitted": "a.gz"}});
        store
            .pipe(&state_path, &serde_json::to_vec(&initial_state).unwrap())
            .unwrap();

        let mut sink = Vec::new();
        let outcome = reservoir_to_target(&store, "dev", "tap-csv", "target-csv", &mut sink).unwrap();

        assert_eq!(outcome.state["s"]["emitted"], serde_json::json!("c.gz"));
        assert_eq!(outcome.state["__version__"], serde_json::json!(4));
    }

    #[test]
    fn rebuilds_index_from_listing_when_missing() {
        let tmp = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(tmp.path());
        store
            .pipe("reservoir/dev/tap-csv/orders/sid/ts1.singer.gz", &gz(&["{\"type\":\"RECORD\"}"]))
            .unwrap();

        let mut sink = Vec::new();
        let outcome = reservoir_to_target(&store, "dev", "tap-csv", "target-csv", &mut sink).unwrap();
        assert!(store.exists("reservoir/dev/tap-csv/_reservoir.json"));
        assert_eq!(*outcome.emitted_counts.get("orders").unwrap(), 1);
    }
}
