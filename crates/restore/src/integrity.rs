//! Delta snapshot integrity verification.
//!
//! A delta blob is a JSON event log followed by a 32-byte SHA-256 of that
//! JSON. The checksum is verified here, before any event reaches the
//! transient etcd. Base snapshots never pass through this path: their
//! integrity is checked by the etcd snapshot-restore primitive itself
//! (unless `skip_hash_check` is set).

use std::path::Path;

use etcdwarden_types::Snapshot;
use sha2::{Digest, Sha256};
use snafu::ResultExt;
use tokio::io::AsyncReadExt;
use tracing::debug;

use crate::{
    compressor::{decompress_snapshot, is_snapshot_compressed},
    error::{CodecSnafu, IoSnafu, RestoreError},
    snapstore::SnapshotReadStream,
};

/// Size of the trailing SHA-256 checksum on a delta blob.
pub const DELTA_CHECKSUM_SIZE: usize = 32;

/// Reads a delta blob to completion and returns its verified JSON payload.
///
/// The stream is decompressed per the snapshot's compression suffix, the
/// trailing checksum is split off, and the payload hash is recomputed and
/// compared.
///
/// # Errors
///
/// - [`RestoreError::Codec`] for an unknown compression suffix
/// - [`RestoreError::Io`] if the stream cannot be read
/// - [`RestoreError::Integrity`] if the blob is truncated or the checksum
///   does not match
pub(crate) async fn read_delta_contents(
    stream: SnapshotReadStream,
    snap: &Snapshot,
) -> Result<Vec<u8>, RestoreError> {
    let policy = is_snapshot_compressed(&snap.compression_suffix).context(CodecSnafu)?;
    let mut reader = match policy {
        Some(policy) => decompress_snapshot(stream, policy),
        None => stream,
    };

    let started = std::time::Instant::now();
    let mut buf = Vec::new();
    reader.read_to_end(&mut buf).await.context(IoSnafu)?;
    debug!(
        snap_name = %snap.snap_name,
        bytes = buf.len(),
        compression = %policy.map(|p| p.to_string()).unwrap_or_else(|| "none".to_string()),
        elapsed_secs = started.elapsed().as_secs_f64(),
        "Read delta snapshot contents"
    );

    if buf.len() <= DELTA_CHECKSUM_SIZE {
        return Err(RestoreError::Integrity {
            snap_name: snap.snap_name.clone(),
            reason: format!("blob of {} bytes is missing its trailing checksum", buf.len()),
        });
    }

    let payload_len = buf.len() - DELTA_CHECKSUM_SIZE;
    let expected = &buf[payload_len..];
    let computed = Sha256::digest(&buf[..payload_len]);

    if computed.as_slice() != expected {
        return Err(RestoreError::Integrity {
            snap_name: snap.snap_name.clone(),
            reason: format!(
                "checksum mismatch: expected {}, got {}",
                hex(expected),
                hex(computed.as_slice())
            ),
        });
    }

    buf.truncate(payload_len);
    Ok(buf)
}

/// Opens a persisted delta file and returns its verified JSON payload.
pub(crate) async fn read_delta_file(
    path: &Path,
    snap: &Snapshot,
) -> Result<Vec<u8>, RestoreError> {
    let file = tokio::fs::File::open(path).await.context(IoSnafu)?;
    read_delta_contents(Box::new(file), snap).await
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
