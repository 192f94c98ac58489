//! Persistence layer for crash recovery
//!
//! Per-symbol snapshots written atomically so the engine can restart
//! into the exact state it crashed from.

pub mod snapshot;

pub use snapshot::{SnapshotDoc, SnapshotStore, SNAPSHOT_VERSION};
