//! Restore engine for the etcdwarden backup-restore sidecar.
//!
//! Reconstructs an etcd data directory from a base (full) snapshot plus an
//! ordered chain of incremental (delta) snapshots held in a remote object
//! store. The base snapshot materialises the initial data directory through
//! the etcd snapshot-restore primitive; the deltas are then replayed as
//! transactions against a transient embedded etcd, in global revision
//! order, while a lean-keeper bounds the transient backend's size through
//! interleaved compaction and defragmentation.
//!
//! # Architecture
//!
//! ```text
//! object store ──► integrity reader ──┬──► base restorer ──► data dir
//!                                     │
//!                                     └──► fetcher pool ──► temp files
//!                                                              │
//!                             ordered applier ◄────────────────┘
//!                                     │
//!                              transient etcd ◄──► lean-keeper / alarm handler
//! ```
//!
//! External collaborators (the object store client, the embedded etcd
//! launcher, the snapshot-restore primitive, and member control) are
//! consumed through the narrow traits in [`snapstore`], [`client`],
//! [`etcd`], and [`member`].

#![deny(unsafe_code)]

pub mod client;
pub mod compressor;
pub mod error;
pub mod etcd;
pub mod member;
pub mod metrics;
pub mod snapstore;

mod applier;
mod base;
mod fetcher;
mod integrity;
mod lean;
mod restorer;

pub use client::{
    ClientError, ClientFactory, ClusterClient, DbStatus, ETCD_COMPACT_TIMEOUT,
    ETCD_CONNECTION_TIMEOUT, ETCD_DEFRAG_TIMEOUT, KvClient, MaintenanceClient, Member, TxnOp,
};
pub use compressor::{CompressionError, CompressionPolicy, decompress_snapshot, is_snapshot_compressed};
pub use error::{RestoreError, Result};
pub use etcd::{DbRestoreParams, EmbeddedEtcd, EmbeddedLauncher, EtcdError, SnapshotRestore};
pub use integrity::DELTA_CHECKSUM_SIZE;
pub use member::{MemberControl, MemberError};
pub use restorer::Restorer;
pub use snapstore::{LocalSnapStore, SnapStore, SnapStoreError, SnapshotReadStream};
