//! Reservoir index: `{ "__version__": n, "<stream>": [path, ...] }`.

use std::collections::BTreeMap;

use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::store::{ObjectStore, StoreError};

pub const RESERVOIR_VERSION_KEY: &str = "__version__";
pub const RESERVOIR_BUFFER_SIZE: usize = 10_000;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReservoirIndex {
    #[serde(rename = "__version__")]
    pub version: u64,
    #[serde(flatten)]
    pub streams: BTreeMap<String, Vec<String>>,
}

impl ReservoirIndex {
    pub fn append(&mut self, stream: &str, path: String) {
        self.streams.entry(stream.to_string()).or_default().push(path);
    }
}

/// The final `/`-delimited path segment.
pub(crate) fn filename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// The schema-id directory segment: the parent of the filename.
pub(crate) fn schema_id_of(path: &str) -> &str {
    let mut segments = path.rsplit('/');
    segments.next();
    segments.next().unwrap_or("")
}

/// Loads the index at `index_path`, returning a fresh `{__version__: 0}`
/// document if it does not exist.
pub fn load_or_default(store: &dyn ObjectStore, index_path: &str) -> Result<ReservoirIndex, StoreError> {
    match store.cat(index_path) {
        Ok(bytes) => serde_json::from_slice(&bytes)
            .map_err(|e| StoreError::Transient { path: index_path.to_string(), source: std::io::Error::other(e) }),
        Err(StoreError::NotFound(_)) => Ok(ReservoirIndex::default()),
        Err(other) => Err(other),
    }
}

pub fn persist(store: &dyn ObjectStore, index_path: &str, index: &ReservoirIndex) -> Result<(), StoreError> {
    let bytes = serde_json::to_vec_pretty(index)
        .map_err(|e| StoreError::Transient { path: index_path.to_string(), source: std::io::Error::other(e) })?;
    store.pipe(index_path, &bytes)
}

/// First 15 hex chars of MD5 over the canonicalized (sorted-keys) JSON
/// of a SCHEMA message's `schema` field.
pub fn schema_id(schema: &Value) -> String {
    let canonical = canonicalize(schema);
    let mut hasher = Md5::new();
    hasher.update(canonical.as_bytes());
    let digest = hex::encode(hasher.finalize());
    digest[..15].to_string()
}

/// A stable, sorted-keys JSON rendering used only for hashing.
fn canonicalize(value: &Value) -> String {
    fn sort(value: &Value) -> Value {
        match value {
            Value::Object(map) => {
                let mut sorted: BTreeMap<String, Value> = BTreeMap::new();
                for (k, v) in map {
                    sorted.insert(k.clone(), sort(v));
                }
                serde_json::to_value(sorted).unwrap()
            }
            Value::Array(arr) => Value::Array(arr.iter().map(sort).collect()),
            other => other.clone(),
        }
    }
    serde_json::to_string(&sort(value)).unwrap_or_default()
}
