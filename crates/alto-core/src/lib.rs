//! # Alto
//!
//! A build-graph-driven orchestrator for Singer-style extract/load pipelines.
//!
//! A Singer pipeline is a pair of subprocesses — a *tap* (producer) and a
//! *target* (consumer) — that exchange newline-delimited JSON messages
//! (SCHEMA, RECORD, STATE) over the tap's stdout piped into the target's
//! stdin. Alto's task engine declares named, inter-dependent tasks (build
//! plugin, render config, discover catalog, apply selections, run
//! pipeline, ingest to reservoir, emit from reservoir, compact reservoir,
//! test) and executes them with dependency order, freshness checks,
//! parallel scheduling, and caching against a pluggable object store.
//!
//! ## Pipeline
//!
//! The core flow is **settings → catalog → pipeline (or reservoir)**:
//!
//! 1. [`settings`] resolves a layered, environment-switchable view of
//!    plugin specs.
//! 2. [`catalog`] applies stream/field selections and metadata overlays to
//!    a discovered base catalog.
//! 3. [`pipeline::run_pipeline`] runs a tap/target pair directly, or
//!    [`reservoir::ingest::tap_to_reservoir`] /
//!    [`reservoir::emit::reservoir_to_target`] route through the durable
//!    landing zone.
//! 4. [`task::Engine`] wires all of the above into a dependency graph with
//!    persistent up-to-date tracking.
//!
//! ## Modules
//!
//! - [`error`] — `AltoError` taxonomy covering config, binary, discovery,
//!   pipeline, reservoir-lock, decode, state-merge, and store failures.
//! - [`reporter`] — `Reporter` trait and console-mutex-serialized stderr
//!   writer.
//! - [`store`] — `ObjectStore` trait: exists/get/put/pipe/cat/ls/glob/rm.
//! - [`paths`] — Deterministic path derivation for plugin binaries, state,
//!   catalogs, logs, and reservoir keys.
//! - [`settings`] — Layered configuration and plugin model.
//! - [`catalog`] — Two-pass Singer stream/field selection and metadata
//!   overlay.
//! - [`state`] — STATE message deep-merge and `singer_state` unwrap.
//! - [`streammap`] — Schema/record transform chain with a built-in
//!   PII-hash map.
//! - [`process`] — Subprocess execution with optional timeout.
//! - [`retry`] — Backoff strategies with jitter.
//! - [`pipeline`] — Tap/target subprocess pair orchestration.
//! - [`reservoir`] — Ingest, emit, and compact against the object store.
//! - [`task`] — Task graph, scheduler, and persistent signature DB.
//!
//! ## Stability
//!
//! The library API is subject to change before v1.0.0.

/// Two-pass Singer stream/field selection and metadata overlay.
pub mod catalog;

/// `AltoError` taxonomy.
pub mod error;

/// Deterministic path derivation.
pub mod paths;

/// Tap/target subprocess pair orchestration.
pub mod pipeline;

/// Process execution with optional timeout support.
pub mod process;

/// `Reporter` trait and console-serialized stderr writer.
pub mod reporter;

/// Reservoir ingest, emit, and compaction.
pub mod reservoir;

/// Configurable retry strategies with backoff and jitter.
pub mod retry;

/// Layered configuration and plugin model.
pub mod settings;

/// STATE message deep-merge and persistence.
pub mod state;

/// `ObjectStore` trait for pluggable persistence backends.
pub mod store;

/// Schema/record transform chain with a built-in PII-hash map.
pub mod streammap;

/// Task graph, scheduler, and persistent signature DB.
pub mod task;

/// Property-based tests for Alto invariants.
#[cfg(test)]
mod property_tests;
