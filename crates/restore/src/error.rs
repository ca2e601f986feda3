//! Error types for the restore engine.

use snafu::Snafu;

use crate::{
    client::ClientError, compressor::CompressionError, etcd::EtcdError, member::MemberError,
    snapstore::SnapStoreError,
};

/// Errors that can occur while restoring a data directory.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum RestoreError {
    /// Fetching a snapshot blob from the object store failed.
    #[snafu(display("failed to fetch snapshot {snap_name} from store: {source}"))]
    Fetch {
        /// Name of the snapshot that could not be fetched.
        snap_name: String,
        /// The underlying store error.
        source: SnapStoreError,
    },

    /// I/O error while persisting or reading snapshot data.
    #[snafu(display("restoration I/O error: {source}"))]
    Io {
        /// The underlying I/O error.
        source: std::io::Error,
        #[snafu(implicit)]
        location: snafu::Location,
    },

    /// The snapshot's compression suffix names no known codec.
    #[snafu(display("snapshot compression error: {source}"))]
    Codec {
        /// The underlying compression error.
        source: CompressionError,
    },

    /// A delta blob is truncated or its trailing SHA-256 does not match.
    #[snafu(display("integrity check failed for delta snapshot {snap_name}: {reason}"))]
    Integrity {
        /// Name of the offending snapshot.
        snap_name: String,
        /// What exactly failed (truncation or checksum mismatch).
        reason: String,
    },

    /// A delta payload did not decode into an event list.
    ///
    /// Unknown event kinds are rejected here: the decoder only accepts
    /// `PUT` and `DELETE`.
    #[snafu(display("failed to decode events from delta snapshot {snap_name}: {source}"))]
    EventDecode {
        /// Name of the offending snapshot.
        snap_name: String,
        /// The underlying decode error.
        source: serde_json::Error,
    },

    /// A fetched delta index went backwards; the pipeline is inconsistent.
    #[snafu(display(
        "snap index mismatch for delta snapshot {fetched}; expected snap index to be at least {expected}"
    ))]
    SnapIndexMismatch {
        /// The index that arrived.
        fetched: usize,
        /// The smallest index still acceptable.
        expected: usize,
    },

    /// The transient etcd's revision disagrees with the delta just applied.
    #[snafu(display(
        "mismatched revision while applying delta snapshot {snap_name}: expected {expected} but applied {actual}"
    ))]
    RevisionMismatch {
        /// Name of the delta whose revision was asserted.
        snap_name: String,
        /// Revision the delta claims.
        expected: i64,
        /// Revision the transient etcd reports.
        actual: i64,
    },

    /// Compaction of the transient etcd failed.
    #[snafu(display("compact call failed: {source}"))]
    Compact {
        /// The underlying client error.
        source: ClientError,
    },

    /// Status query of the transient etcd failed.
    #[snafu(display("unable to check embedded etcd status: {source}"))]
    Status {
        /// The underlying client error.
        source: ClientError,
    },

    /// Defragmentation did not disarm the db-size alarm.
    #[snafu(display("failed to disarm the embedded etcd db-size alarm"))]
    DefragFailed,

    /// The etcd snapshot-restore primitive rejected the base snapshot.
    #[snafu(display("failed to restore the etcd database from the base snapshot: {source}"))]
    EtcdRestore {
        /// The underlying etcd error.
        source: EtcdError,
    },

    /// The embedded etcd could not be started.
    #[snafu(display("failed to start embedded etcd: {source}"))]
    Launch {
        /// The underlying etcd error.
        source: EtcdError,
    },

    /// A KV or maintenance request against the transient etcd failed.
    #[snafu(display("etcd client request failed: {source}"))]
    Client {
        /// The underlying client error.
        source: ClientError,
    },

    /// Rewriting the member peer URL in the transient cluster failed.
    #[snafu(display("member control error: {source}"))]
    Member {
        /// The underlying member-control error.
        source: MemberError,
    },

    /// Temporary snapshot files could not be removed during cleanup.
    ///
    /// Aggregated and reported by the orchestrator; never overrides the
    /// primary restore outcome.
    #[snafu(display("cleanup failed: {}", messages.join("; ")))]
    Cleanup {
        /// One message per file that could not be removed.
        messages: Vec<String>,
    },

    /// The pipeline tasks exited without delivering a result.
    #[snafu(display("restore pipeline exited without reporting a result"))]
    PipelineInterrupted,
}

/// Result type for restore operations.
pub type Result<T, E = RestoreError> = std::result::Result<T, E>;
