//! Content-addressed, schema-partitioned object-store landing zone.
//!
//! A reservoir replaces a live target with a durable, resumable landing
//! pipeline: [`ingest::tap_to_reservoir`] buffers tap output into
//! gzip batches, [`emit::reservoir_to_target`] replays them into a real
//! target with a per-stream bookmark, and [`compact::compact_reservoir`]
//! merges small batches offline.

pub mod compact;
pub mod emit;
pub mod index;
pub mod ingest;
pub mod lock;

pub use compact::{compact_reservoir, CompactOutcome, DEFAULT_MAX_BATCH_BYTES};
pub use emit::{reservoir_to_target, EmitOutcome};
pub use index::{ReservoirIndex, RESERVOIR_BUFFER_SIZE, RESERVOIR_VERSION_KEY};
pub use ingest::{tap_to_reservoir, IngestOutcome};
pub use lock::ReservoirLock;
