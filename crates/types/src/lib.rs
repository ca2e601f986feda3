//! Domain types for the etcdwarden backup-restore sidecar.
//!
//! This crate provides the types shared between the snapshot producer and
//! the restore engine:
//! - Snapshot descriptors and delta-chain validation
//! - The replay event model and its JSON wire shape
//! - Restoration configuration with validation
//! - Error types using snafu

#![deny(unsafe_code)]

pub mod config;
pub mod events;
pub mod snapshots;

// Re-export commonly used types at crate root
pub use config::{AutoCompactionMode, ConfigError, RestorationConfig, RestoreOptions};
pub use events::{EtcdEvent, Event, EventKind, KeyValue};
pub use snapshots::{
    DELTA_SNAPSHOT_PREFIX, FULL_SNAPSHOT_PREFIX, SnapList, SnapListError, Snapshot, SnapshotKind,
    verify_snapshot_chain,
};
