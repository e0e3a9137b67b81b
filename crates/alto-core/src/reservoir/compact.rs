//! Offline compaction: merges small batches within a `(stream, schema_id)`
//! partition into fewer, larger objects, under the exclusive reservoir
//! lock. Bumps the index version only when something actually changed,
//! so [`crate::reservoir::emit`] knows to rebuild its bookmarks.

use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::error::AltoError;
use crate::reservoir::index::{filename, schema_id_of, ReservoirIndex};
use crate::reservoir::ingest::batch_timestamp;
use crate::reservoir::lock::ReservoirLock;
use crate::store::ObjectStore;

pub const DEFAULT_MAX_BATCH_BYTES: u64 = 25 * 1024 * 1024;

pub struct CompactOutcome {
    pub changed: bool,
    pub merged_groups: usize,
}

/// Merges runs of small, same-`(stream, schema_id)` batches that sum to
/// more than `max_batch_bytes`, into a single batch at the
/// lexicographically greatest path in the run. Leaves already-large
/// batches untouched.
pub fn compact_reservoir(
    store: &dyn ObjectStore,
    env: &str,
    tap: &str,
    max_batch_bytes: u64,
) -> Result<CompactOutcome, AltoError> {
    let lock_path = crate::paths::reservoir_lock_path(env, tap);
    let index_path = crate::paths::reservoir_index_path(env, tap);
    let identity = format!("compact-{}", batch_timestamp());
    let lock = ReservoirLock::acquire(store, &lock_path, &identity)?;

    let mut index = crate::reservoir::index::load_or_default(store, &index_path)
        .map_err(|e| AltoError::store(&index_path, e.to_string()))?;

    if index.streams.is_empty() {
        lock.release()?;
        return Ok(CompactOutcome { changed: false, merged_groups: 0 });
    }

    let result = run_compaction(store, &mut index, max_batch_bytes);

    match &result {
        Ok(outcome) if outcome.changed => {
            index.version += 1;
            crate::reservoir::index::persist(store, &index_path, &index)
                .map_err(|e| AltoError::store(&index_path, e.to_string()))?;
        }
        Err(_) => {
            // A merge failed partway through; the in-memory index may be
            // partially updated. Fall back to a fresh listing rather than
            // risk persisting a half-merged, inconsistent index.
            if let Ok(rebuilt) = rebuild_index_from_listing(store, env, tap) {
                let _ = crate::reservoir::index::persist(store, &index_path, &rebuilt);
            }
        }
        _ => {}
    }

    lock.release()?;
    result
}

fn run_compaction(
    store: &dyn ObjectStore,
    index: &mut ReservoirIndex,
    max_batch_bytes: u64,
) -> Result<CompactOutcome, AltoError> {
    let mut changed = false;
    let mut merged_groups = 0usize;

    for (stream, paths) in index.streams.iter_mut() {
        let mut partitions: Vec<(String, Vec<String>)> = Vec::new();
        for path in paths.iter() {
            let id = schema_id_of(path).to_string();
            match partitions.last_mut() {
                Some((last_id, group)) if *last_id == id => group.push(path.clone()),
                _ => partitions.push((id, vec![path.clone()])),
            }
        }

        let mut rebuilt_paths = Vec::new();
        for (_, partition) in &partitions {
            let mut merge_queue: Vec<String> = Vec::new();
            let mut queue_bytes: u64 = 0;

            for path in partition {
                let size = store.size(path).map_err(|e| AltoError::store(path, e.to_string()))?;
                if size >= max_batch_bytes {
                    flush_merge_queue(store, &mut merge_queue, &mut rebuilt_paths, &mut changed, &mut merged_groups)?;
                    rebuilt_paths.push(path.clone());
                    continue;
                }
                merge_queue.push(path.clone());
                queue_bytes += size;
                if queue_bytes >= max_batch_bytes {
                    flush_merge_queue(store, &mut merge_queue, &mut rebuilt_paths, &mut changed, &mut merged_groups)?;
                    queue_bytes = 0;
                }
            }
            flush_merge_queue(store, &mut merge_queue, &mut rebuilt_paths, &mut changed, &mut merged_groups)?;
        }

        *paths = rebuilt_paths;
    }

    Ok(CompactOutcome { changed, merged_groups })
}

fn flush_merge_queue(
    store: &dyn ObjectStore,
    queue: &mut Vec<String>,
    rebuilt_paths: &mut Vec<String>,
    changed: &mut bool,
    merged_groups: &mut usize,
) -> Result<(), AltoError> {
    if queue.is_empty() {
        return Ok(());
    }
    if queue.len() == 1 {
        rebuilt_paths.push(queue.remove(0));
        return Ok(());
    }

    let mut sorted = std::mem::take(queue);
    sorted.sort();
    let target_path = sorted.last().cloned().unwrap();

    let mut lines: Vec<String> = Vec::new();
    for (i, path) in sorted.iter().enumerate() {
        let bytes = store.cat(path).map_err(|e| AltoError::store(path, e.to_string()))?;
        let mut decoder = GzDecoder::new(bytes.as_slice());
        let mut text = String::new();
        decoder
            .read_to_string(&mut text)
            .map_err(|e| AltoError::store(path, e.to_string()))?;
        let mut batch_lines = text.lines().filter(|l| !l.is_empty());
        if i > 0 {
            batch_lines.next(); // skip the repeated SCHEMA header
        }
        lines.extend(batch_lines.map(String::from));
    }

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    for line in &lines {
        writeln!(encoder, "{line}").map_err(|e| AltoError::store(&target_path, e.to_string()))?;
    }
    let merged_bytes = encoder.finish().map_err(|e| AltoError::store(&target_path, e.to_string()))?;
    store
        .pipe(&target_path, &merged_bytes)
        .map_err(|e| AltoError::store(&target_path, e.to_string()))?;

    for path in &sorted {
        if path != &target_path {
            store.rm(path).map_err(|e| AltoError::store(path, e.to_string()))?;
        }
    }

    rebuilt_paths.push(target_path);
    *changed = true;
    *merged_groups += 1;
    Ok(())
}

fn rebuild_index_from_listing(
    store: &dyn ObjectStore,
    env: &str,
    tap: &str,
) -> Result<ReservoirIndex, AltoError> {
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
    Ok(index)
}
