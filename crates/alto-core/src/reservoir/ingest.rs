//! tap -> reservoir: bucket by `(stream, schema_id)`, gzip-batch by
//! count threshold, flush to the object store, maintain the index.
//!
//! Takes the mapped, post-stream-map line as the bytes that land in the
//! reservoir (a deliberate deviation from the apparent behavior of the
//! system this was modeled on — see design notes: a reservoir that
//! silently persisted unselected or un-hashed data while the live
//! pipeline path hashes it would be a privacy leak between the two
//! paths).

use std::collections::HashMap;
use std::io::{BufRead, Write};
use std::sync::atomic::{AtomicU32, Ordering};

use chrono::Utc;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde_json::Value;

use crate::error::AltoError;
use crate::reservoir::index::{schema_id, ReservoirIndex};
use crate::reservoir::lock::ReservoirLock;
use crate::store::ObjectStore;
use crate::streammap::MapChain;

static NONCE: AtomicU32 = AtomicU32::new(0);

/// Microsecond timestamp with a 4-hex-digit nonce appended to break ties
/// within the same microsecond while preserving lexicographic order.
pub(crate) fn batch_timestamp() -> String {
    let ts = Utc::now().format("%Y%m%d%H%M%S%6f").to_string();
    let nonce = NONCE.fetch_add(1, Ordering::Relaxed) & 0xffff;
    format!("{ts}{nonce:04x}")
}

struct Buffer {
    encoder: GzEncoder<Vec<u8>>,
    header: Vec<u8>,
    count: usize,
}

impl Buffer {
    fn new(header_line: &str) -> Self {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        let header = format!("{header_line}\n").into_bytes();
        let _ = encoder.write_all(&header);
        Self { encoder, header, count: 0 }
    }

    fn write_line(&mut self, line: &str) -> std::io::Result<()> {
        writeln!(self.encoder, "{line}")?;
        self.count += 1;
        Ok(())
    }

    /// Closes the current gzip stream and returns its bytes, then starts
    /// a fresh one re-primed with the same header so every batch stays
    /// self-describing.
    fn finish_and_reset(&mut self) -> std::io::Result<Vec<u8>> {
        let mut fresh = GzEncoder::new(Vec::new(), Compression::default());
        fresh.write_all(&self.header)?;
        let old = std::mem::replace(&mut self.encoder, fresh);
        self.count = 0;
        old.finish()
    }
}

pub struct IngestOutcome {
    pub state: Value,
    pub index: ReservoirIndex,
    pub uploaded_paths: Vec<String>,
}

/// Consumes Singer messages from `lines` (the tap's stdout) until EOF,
/// flushing buffers past `buffer_size` records to `<base>/<stream>/<schema_id>/<ts>.singer.gz`.
pub fn tap_to_reservoir(
    store: &dyn ObjectStore,
    env: &str,
    tap: &str,
    lines: impl BufRead,
    map_chain: &MapChain,
    buffer_size: usize,
) -> Result<IngestOutcome, AltoError> {
    let base = crate::paths::reservoir_base(env, tap);
    let lock_path = crate::paths::reservoir_lock_path(env, tap);
    let index_path = crate::paths::reservoir_index_path(env, tap);

    let pipeline_id = format!("ingest-{}", batch_timestamp());
    let lock = ReservoirLock::acquire(store, &lock_path, &pipeline_id)?;

    let mut index = crate::reservoir::index::load_or_default(store, &index_path)
        .map_err(|e| AltoError::store(&index_path, e.to_string()))?;

    let mut state = Value::Object(serde_json::Map::new());
    let mut active_schemas: HashMap<String, String> = HashMap::new();
    let mut buffers: HashMap<(String, String), Buffer> = HashMap::new();
    let mut uploaded_paths = Vec::new();

    let run = (|| -> Result<(), AltoError> {
        for line in lines.lines() {
            let line = line.map_err(|e| AltoError::Decode(e.to_string()))?;
            if line.trim().is_empty() {
                continue;
            }
            let Ok(message) = serde_json::from_str::<Value>(&line) else {
                continue; // per-line drop on decode failure
            };
            let msg_type = message.get("type").and_then(Value::as_str).unwrap_or("");
            match msg_type {
                "STATE" => {
                    if let Some(value) = message.get("value") {
                        state = crate::state::merge(&state, value);
                    }
                }
                "SCHEMA" => {
                    let mapped = map_chain.transform_schema(message);
                    let Some(stream) = mapped.get("stream").and_then(Value::as_str).map(String::from) else {
                        continue;
                    };
                    let id = mapped
                        .get("schema")
                        .map(schema_id)
                        .unwrap_or_else(|| schema_id(&Value::Null));
                    let header_line = serde_json::to_string(&mapped).unwrap_or_default();
                    buffers
                        .entry((stream.clone(), id.clone()))
                        .or_insert_with(|| Buffer::new(&header_line));
                    active_schemas.insert(stream, id);
                }
                "RECORD" => {
                    let mapped = map_chain.transform_record(message);
                    let Some(stream) = mapped.get("stream").and_then(Value::as_str).map(String::from) else {
                        continue;
                    };
                    let Some(id) = active_schemas.get(&stream).cloned() else {
                        continue; // RECORD without a preceding SCHEMA is dropped
                    };
                    let record_line = serde_json::to_string(&mapped).unwrap_or_default();
                    if let Some(buf) = buffers.get_mut(&(stream.clone(), id.clone())) {
                        buf.write_line(&record_line)
                            .map_err(|e| AltoError::store(&base, e.to_string()))?;
                        if buf.count >= buffer_size {
                            flush_buffer(store, &base, env, tap, &stream, &id, buf, &mut index, &mut uploaded_paths)?;
                        }
                    }
                }
                _ => {}
            }
        }

        for ((stream, id), buf) in buffers.iter_mut() {
            if buf.count > 0 {
                flush_buffer(store, &base, env, tap, stream, id, buf, &mut index, &mut uploaded_paths)?;
            }
        }
        Ok(())
    })();

    crate::reservoir::index::persist(store, &index_path, &index).map_err(|e| AltoError::store(&index_path, e.to_string()))?;
    lock.release()?;
    run?;

    Ok(IngestOutcome { state, index, uploaded_paths })
}

#[allow(clippy::too_many_arguments)]
fn flush_buffer(
    store: &dyn ObjectStore,
    base: &str,
    env: &str,
    tap: &str,
    stream: &str,
    schema_id: &str,
    buf: &mut Buffer,
    index: &mut ReservoirIndex,
    uploaded_paths: &mut Vec<String>,
) -> Result<(), AltoError> {
    let ts = batch_timestamp();
    let path = crate::paths::reservoir_record_path(env, tap, stream, schema_id, &ts);
    let bytes = buf.finish_and_reset().map_err(|e| AltoError::store(base, e.to_string()))?;
    store.pipe(&path, &bytes).map_err(|e| AltoError::store(&path, e.to_string()))?;
    index.append(stream, path.clone());
    uploaded_paths.push(path);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::LocalObjectStore;
    use std::io::Cursor;

    #[test]
    fn ingest_flushes_on_buffer_size_threshold() {
        let tmp = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(tmp.path());
        let mut input = String::new();
        input.push_str("{\"type\":\"SCHEMA\",\"stream\":\"orders\",\"schema\":{\"properties\":{\"id\":{\"type\":\"integer\"}}}}\n");
        for i in 0..3 {
            input.push_str(&format!("{{\"type\":\"RECORD\",\"stream\":\"orders\",\"record\":{{\"id\":{i}}}}}\n"));
        }
        input.push_str("{\"type\":\"STATE\",\"value\":{\"bookmarks\":{\"orders\":{\"id\":2}}}}\n");

        let chain = MapChain::new(vec![]);
        let outcome = tap_to_reservoir(&store, "dev", "tap-csv", Cursor::new(input), &chain, 2).unwrap();

        assert_eq!(outcome.state["bookmarks"]["orders"]["id"], serde_json::json!(2));
        assert!(!outcome.uploaded_paths.is_empty());
        assert!(!store.exists("reservoir/dev/tap-csv/_reservoir.lock"));
        assert!(store.exists("reservoir/dev/tap-csv/_reservoir.json"));
    }

    #[test]
    fn malformed_lines_are_dropped_without_failing_the_run() {
        let tmp = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(tmp.path());
        let input = "not json\n{\"type\":\"STATE\",\"value\":{\"a\":1}}\n";
        let chain = MapChain::new(vec![]);
        let outcome = tap_to_reservoir(&store, "dev", "tap-csv", Cursor::new(input), &chain, 10).unwrap();
        assert_eq!(outcome.state["a"], serde_json::json!(1));
    }

    #[test]
    fn ingest_fails_fast_when_lock_is_held() {
        let tmp = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(tmp.path());
        let _lock = ReservoirLock::acquire(&store, "reservoir/dev/tap-csv/_reservoir.lock", "other").unwrap();
        let chain = MapChain::new(vec![]);
        let err = tap_to_reservoir(&store, "dev", "tap-csv", Cursor::new(""), &chain, 10).unwrap_err();
        assert!(matches!(err, AltoError::ReservoirLocked(_)));
    }

    #[test]
    fn scenario_6_every_batch_starts_with_its_schema_line() {
        use flate2::read::GzDecoder;
        use std::io::Read;

        let tmp = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(tmp.path());
        let mut input = String::new();
        input.push_str("{\"type\":\"SCHEMA\",\"stream\":\"orders\",\"schema\":{\"properties\":{\"id\":{\"type\":\"integer\"}}}}\n");
        for i in 0..5 {
            input.push_str(&format!("{{\"type\":\"RECORD\",\"stream\":\"orders\",\"record\":{{\"id\":{i}}}}}\n"));
        }
        let chain = MapChain::new(vec![]);
        let outcome = tap_to_reservoir(&store, "dev", "tap-csv", Cursor::new(input), &chain, 2).unwrap();

        assert!(outcome.uploaded_paths.len() >= 2);
        for path in &outcome.uploaded_paths {
            assert!(path.starts_with("reservoir/dev/tap-csv/orders/"));
            let gz_bytes = store.cat(path).unwrap();
            let mut raw = String::new();
            GzDecoder::new(&gz_bytes[..]).read_to_string(&mut raw).unwrap();
            let mut lines = raw.lines();
            let header: Value = serde_json::from_str(lines.next().unwrap()).unwrap();
            assert_eq!(header["type"], "SCHEMA");
            assert_eq!(header["stream"], "orders");
            for record_line in lines {
                let record: Value = serde_json::from_str(record_line).unwrap();
                assert_eq!(record["type"], "RECORD");
            }
        }
    }
}
