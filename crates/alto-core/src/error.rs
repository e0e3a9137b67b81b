//! Error taxonomy for the core engine.
//!
//! Each variant names a failure kind from the engine's error handling
//! design, not a Rust type family: callers match on these to decide
//! whether to retry, clean up partial artifacts, or surface the error to
//! an operator. Most call sites propagate with `anyhow::Result` and only
//! construct a specific variant where the engine itself must classify the
//! failure (to decide on cleanup or retry behavior).

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AltoError {
    /// Missing/invalid plugin spec, cycle in inheritance, unknown plugin
    /// name, unsupported object-store scheme. Fatal at setup; never
    /// retried.
    #[error("config error: {0}")]
    Config(String),

    /// Failed to obtain or build a plugin binary.
    #[error("failed to obtain binary for plugin {plugin}: {message}")]
    Binary { plugin: String, message: String },

    /// Tap `--discover` exited non-zero.
    #[error("discovery failed for tap {tap}: {message}")]
    Discovery { tap: String, message: String },

    /// Either subprocess exited non-zero, or the map worker propagated an
    /// error.
    #[error("pipeline {pipeline_id} failed: {message}")]
    Pipeline { pipeline_id: String, message: String },

    /// `_reservoir.lock` exists at start of an ingest or compaction.
    #[error("reservoir locked at {0}")]
    ReservoirLocked(PathBuf),

    /// A line from tap stdout is not JSON. Per-line drop; does not fail
    /// the run on its own, but is surfaced for counting.
    #[error("failed to decode line as JSON: {0}")]
    Decode(String),

    /// State destination is not a JSON object. Fatal for the teardown
    /// phase only.
    #[error("state merge error: destination is not a JSON object ({0})")]
    StateMerge(String),

    /// Transient upload/download failure against the object store.
    #[error("store error for {path}: {message}")]
    Store { path: String, message: String },
}

impl AltoError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn store(path: impl AsRef<str>, msg: impl AsRef<str>) -> Self {
        Self::Store {
            path: path.as_ref().to_string(),
            message: msg.as_ref().to_string(),
        }
    }
}
