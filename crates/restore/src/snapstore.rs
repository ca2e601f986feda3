//! Object-store access for snapshot blobs.
//!
//! The restore engine only ever *reads* from the store, so the seam is a
//! single streaming fetch. Production deployments plug in their cloud
//! bucket client; [`LocalSnapStore`] serves filesystem-backed stores and
//! development setups.

use std::path::PathBuf;

use async_trait::async_trait;
use etcdwarden_types::Snapshot;
use snafu::Snafu;
use tokio::io::AsyncRead;

/// An [`AsyncRead`] stream that also supports [`Debug`](std::fmt::Debug), so
/// that results carrying it can be unwrapped in tests.
pub trait DebugAsyncRead: AsyncRead + std::fmt::Debug {}
impl<T: AsyncRead + std::fmt::Debug> DebugAsyncRead for T {}

/// A streaming handle on one snapshot blob.
pub type SnapshotReadStream = Box<dyn DebugAsyncRead + Send + Unpin>;

/// Errors raised by a snapshot store.
#[derive(Debug, Snafu)]
pub enum SnapStoreError {
    /// The requested blob does not exist in the store.
    #[snafu(display("snapshot {name} not found in store"))]
    NotFound {
        /// Name of the missing blob.
        name: String,
    },

    /// Reading the blob failed.
    #[snafu(display("failed to read snapshot {name}: {source}"))]
    Read {
        /// Name of the blob being read.
        name: String,
        /// The underlying I/O error.
        source: std::io::Error,
    },

    /// The store itself is unreachable.
    #[snafu(display("snapshot store unavailable: {message}"))]
    Unavailable {
        /// Description of the outage.
        message: String,
    },
}

/// Read access to the object store holding snapshot blobs.
#[async_trait]
pub trait SnapStore: Send + Sync {
    /// Opens a streaming reader on the blob described by `snap`.
    async fn fetch(&self, snap: &Snapshot) -> Result<SnapshotReadStream, SnapStoreError>;
}

/// A snapshot store rooted at a local directory.
///
/// Blobs live at `<root>/<snap_dir>/<snap_name>`, mirroring the object-store
/// key layout.
#[derive(Debug, Clone)]
pub struct LocalSnapStore {
    root: PathBuf,
}

impl LocalSnapStore {
    /// Creates a store rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn blob_path(&self, snap: &Snapshot) -> PathBuf {
        if snap.snap_dir.is_empty() {
            self.root.join(&snap.snap_name)
        } else {
            self.root.join(&snap.snap_dir).join(&snap.snap_name)
        }
    }
}

#[async_trait]
impl SnapStore for LocalSnapStore {
    async fn fetch(&self, snap: &Snapshot) -> Result<SnapshotReadStream, SnapStoreError> {
        let path = self.blob_path(snap);
        match tokio::fs::File::open(&path).await {
            Ok(file) => Ok(Box::new(file)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(SnapStoreError::NotFound { name: snap.snap_name.clone() })
            },
            Err(e) => Err(SnapStoreError::Read { name: snap.snap_name.clone(), source: e }),
        }
    }
}
