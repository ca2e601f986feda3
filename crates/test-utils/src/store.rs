//! In-memory snapshot store and blob builders.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use etcdwarden_restore::{
    CompressionPolicy, SnapStore, SnapStoreError, SnapshotReadStream,
};
use etcdwarden_types::{Event, Snapshot};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};

type BlobKey = (String, String);

/// An object store held in memory, with per-blob failure and latency
/// injection.
#[derive(Clone, Default)]
pub struct InMemorySnapStore {
    blobs: Arc<Mutex<HashMap<BlobKey, Vec<u8>>>>,
    fail_fetches: Arc<Mutex<HashSet<BlobKey>>>,
    delays: Arc<Mutex<HashMap<BlobKey, Duration>>>,
}

impl InMemorySnapStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `bytes` under the snapshot's `(dir, name)` key.
    pub fn put(&self, snap: &Snapshot, bytes: Vec<u8>) {
        self.blobs.lock().insert(key(snap), bytes);
    }

    /// Makes every fetch of this snapshot fail with a store outage.
    pub fn fail_fetch(&self, snap: &Snapshot) {
        self.fail_fetches.lock().insert(key(snap));
    }

    /// Delays every fetch of this snapshot, simulating a slow download.
    pub fn delay_fetch(&self, snap: &Snapshot, delay: Duration) {
        self.delays.lock().insert(key(snap), delay);
    }
}

fn key(snap: &Snapshot) -> BlobKey {
    (snap.snap_dir.clone(), snap.snap_name.clone())
}

#[async_trait]
impl SnapStore for InMemorySnapStore {
    async fn fetch(&self, snap: &Snapshot) -> Result<SnapshotReadStream, SnapStoreError> {
        let delay = self.delays.lock().get(&key(snap)).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_fetches.lock().contains(&key(snap)) {
            return Err(SnapStoreError::Unavailable {
                message: format!("injected fetch failure for {}", snap.snap_name),
            });
        }
        let blobs = self.blobs.lock();
        let Some(bytes) = blobs.get(&key(snap)) else {
            return Err(SnapStoreError::NotFound { name: snap.snap_name.clone() });
        };
        Ok(Box::new(std::io::Cursor::new(bytes.clone())))
    }
}

/// Encodes `events` the way the snapshot producer does: a JSON array
/// followed by the 32-byte SHA-256 of that JSON.
pub fn delta_blob(events: &[Event]) -> Vec<u8> {
    #[allow(clippy::expect_used)]
    let mut blob = serde_json::to_vec(events).expect("events always serialize");
    let digest = Sha256::digest(&blob);
    blob.extend_from_slice(digest.as_slice());
    blob
}

/// Compresses a finished blob with the given codec, producing what the
/// store would hold for a snapshot carrying that codec's suffix.
#[allow(clippy::expect_used)]
pub async fn compress(bytes: &[u8], policy: CompressionPolicy) -> Vec<u8> {
    use async_compression::tokio::write::{GzipEncoder, ZlibEncoder, ZstdEncoder};
    use tokio::io::AsyncWriteExt;

    let mut out = Vec::new();
    match policy {
        CompressionPolicy::Gzip => {
            let mut enc = GzipEncoder::new(&mut out);
            enc.write_all(bytes).await.expect("in-memory compression");
            enc.shutdown().await.expect("in-memory compression");
        },
        CompressionPolicy::Zlib => {
            let mut enc = ZlibEncoder::new(&mut out);
            enc.write_all(bytes).await.expect("in-memory compression");
            enc.shutdown().await.expect("in-memory compression");
        },
        CompressionPolicy::Zstd => {
            let mut enc = ZstdEncoder::new(&mut out);
            enc.write_all(bytes).await.expect("in-memory compression");
            enc.shutdown().await.expect("in-memory compression");
        },
    }
    out
}
