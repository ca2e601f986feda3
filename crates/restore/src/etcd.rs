//! Seams around the embedded etcd.
//!
//! Two primitives are consumed, both implemented by the embedding binary:
//! the snapshot-restore primitive that materialises a data directory from a
//! bbolt database file, and the launcher that boots the transient etcd used
//! for delta replay.

use std::path::Path;

use async_trait::async_trait;
use etcdwarden_types::RestoreOptions;
use snafu::Snafu;

/// Errors raised by the embedded-etcd primitives.
#[derive(Debug, Snafu)]
pub enum EtcdError {
    /// The snapshot-restore primitive rejected the database file.
    #[snafu(display("snapshot restore failed: {message}"))]
    Restore {
        /// The failure reported by the primitive.
        message: String,
    },

    /// The embedded server did not come up.
    #[snafu(display("embedded etcd failed to start: {message}"))]
    Start {
        /// The failure reported by the launcher.
        message: String,
    },
}

/// Inputs to the etcd snapshot-restore primitive.
#[derive(Debug)]
pub struct DbRestoreParams<'a> {
    /// Path of the bbolt database file to restore from.
    pub snapshot_path: &'a Path,
    /// This member's name.
    pub member_name: &'a str,
    /// This member's advertised peer URLs, in string form.
    pub peer_urls: Vec<String>,
    /// Initial cluster string (`name=url,...`).
    pub initial_cluster: &'a str,
    /// Initial cluster token.
    pub initial_cluster_token: &'a str,
    /// Directory to materialise the data directory into.
    pub output_data_dir: &'a Path,
    /// Skip the bbolt integrity hash check.
    pub skip_hash_check: bool,
}

/// The etcd snapshot-restore primitive: bbolt file in, data directory out.
#[async_trait]
pub trait SnapshotRestore: Send + Sync {
    /// Materialises `params.output_data_dir` from `params.snapshot_path`.
    async fn restore_to_data_dir(&self, params: DbRestoreParams<'_>) -> Result<(), EtcdError>;
}

/// A running transient etcd.
#[async_trait]
pub trait EmbeddedEtcd: Send + Sync + std::fmt::Debug {
    /// Client endpoints the transient etcd is listening on.
    fn client_endpoints(&self) -> Vec<String>;

    /// Stops the server and releases its resources. Idempotent.
    async fn stop(&self);
}

/// Boots a transient etcd over an existing data directory.
#[async_trait]
pub trait EmbeddedLauncher: Send + Sync {
    /// Starts the transient etcd configured per `opts` (data dir, quota,
    /// request ceilings, auto-compaction settings).
    async fn start(&self, opts: &RestoreOptions) -> Result<Box<dyn EmbeddedEtcd>, EtcdError>;
}
