//! Snapshot descriptors for blobs kept in the object store.
//!
//! A full snapshot is a bbolt database dump at a specific revision; a delta
//! snapshot is a JSON event log covering a contiguous revision range. The
//! restore engine consumes a base full snapshot plus an ordered chain of
//! deltas, so the chain-contiguity rules live here next to the descriptor.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use snafu::Snafu;

/// Name prefix for full snapshots.
pub const FULL_SNAPSHOT_PREFIX: &str = "Full";

/// Name prefix for delta (incremental) snapshots.
pub const DELTA_SNAPSHOT_PREFIX: &str = "Incr";

/// Errors raised when a delta snapshot chain is not replayable.
#[derive(Debug, Snafu)]
pub enum SnapListError {
    /// A delta does not start where its predecessor ended.
    #[snafu(display(
        "delta snapshot {index} starts at revision {start}, expected {expected} to continue the chain"
    ))]
    RevisionGap {
        /// Position of the offending delta in the chain.
        index: usize,
        /// Start revision recorded on the delta.
        start: i64,
        /// Revision the chain requires it to start at.
        expected: i64,
    },

    /// The first delta leaves a gap after the base full snapshot.
    #[snafu(display(
        "first delta starts at revision {start}, leaving a gap after base revision {base_last}"
    ))]
    BaseGap {
        /// Start revision of the first delta.
        start: i64,
        /// Last revision covered by the base snapshot.
        base_last: i64,
    },

    /// A snapshot records `last_revision` below its `start_revision`.
    #[snafu(display("snapshot {name} has inverted revision range {start}..{last}"))]
    InvertedRange {
        /// Name of the offending snapshot.
        name: String,
        /// Start revision recorded on the snapshot.
        start: i64,
        /// Last revision recorded on the snapshot.
        last: i64,
    },
}

/// Whether a snapshot is a full dump or an incremental event log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SnapshotKind {
    /// Full bbolt database dump.
    Full,
    /// Incremental JSON event log.
    Delta,
}

impl SnapshotKind {
    /// The prefix this kind contributes to a canonical snapshot name.
    pub fn prefix(&self) -> &'static str {
        match self {
            Self::Full => FULL_SNAPSHOT_PREFIX,
            Self::Delta => DELTA_SNAPSHOT_PREFIX,
        }
    }
}

impl std::fmt::Display for SnapshotKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.prefix())
    }
}

/// Immutable descriptor of one snapshot blob in the object store.
///
/// Two snapshots are considered the same blob iff `(snap_dir, snap_name)`
/// match; revision metadata never participates in identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    /// Full or delta.
    pub kind: SnapshotKind,
    /// Directory (object-store prefix) the blob lives under. May be empty.
    pub snap_dir: String,
    /// Blob name, including the compression suffix when compressed.
    pub snap_name: String,
    /// First revision covered by this snapshot.
    pub start_revision: i64,
    /// Last revision covered by this snapshot.
    pub last_revision: i64,
    /// Filename suffix identifying the compression codec; empty when the
    /// blob is stored uncompressed.
    pub compression_suffix: String,
    /// When the snapshot was taken.
    pub created_on: DateTime<Utc>,
}

impl Snapshot {
    /// Creates a descriptor with the canonical name
    /// `<kind>-<start>-<last>-<unix_ts><suffix>`.
    pub fn new(
        kind: SnapshotKind,
        start_revision: i64,
        last_revision: i64,
        compression_suffix: impl Into<String>,
    ) -> Self {
        let compression_suffix = compression_suffix.into();
        let created_on = Utc::now();
        let snap_name = format!(
            "{}-{:08}-{:08}-{}{}",
            kind.prefix(),
            start_revision,
            last_revision,
            created_on.timestamp(),
            compression_suffix,
        );
        Self {
            kind,
            snap_dir: String::new(),
            snap_name,
            start_revision,
            last_revision,
            compression_suffix,
            created_on,
        }
    }

    /// Places the snapshot under an object-store directory.
    #[must_use]
    pub fn in_dir(mut self, snap_dir: impl Into<String>) -> Self {
        self.snap_dir = snap_dir.into();
        self
    }

    /// Object-store path of the blob (`<snap_dir>/<snap_name>`).
    pub fn full_path(&self) -> String {
        if self.snap_dir.is_empty() {
            self.snap_name.clone()
        } else {
            format!("{}/{}", self.snap_dir, self.snap_name)
        }
    }

    /// Whether the blob is stored compressed.
    pub fn is_compressed(&self) -> bool {
        !self.compression_suffix.is_empty()
    }
}

impl PartialEq for Snapshot {
    fn eq(&self, other: &Self) -> bool {
        self.snap_dir == other.snap_dir && self.snap_name == other.snap_name
    }
}

impl Eq for Snapshot {}

/// An ordered chain of snapshots.
pub type SnapList = Vec<Snapshot>;

/// Validates that `deltas` form a contiguous, replayable chain over `base`.
///
/// Each delta must start exactly one revision after its predecessor ends,
/// and the first delta must not leave a gap after the base snapshot. The
/// first delta *overlapping* the base is allowed; the overlap is resolved
/// at apply time.
///
/// # Errors
///
/// Returns [`SnapListError`] naming the first violation found.
pub fn verify_snapshot_chain(base: &Snapshot, deltas: &SnapList) -> Result<(), SnapListError> {
    for (index, delta) in deltas.iter().enumerate() {
        if delta.last_revision < delta.start_revision {
            return Err(SnapListError::InvertedRange {
                name: delta.snap_name.clone(),
                start: delta.start_revision,
                last: delta.last_revision,
            });
        }
        if index == 0 {
            if delta.start_revision > base.last_revision + 1 {
                return Err(SnapListError::BaseGap {
                    start: delta.start_revision,
                    base_last: base.last_revision,
                });
            }
        } else {
            let expected = deltas[index - 1].last_revision + 1;
            if delta.start_revision != expected {
                return Err(SnapListError::RevisionGap {
                    index,
                    start: delta.start_revision,
                    expected,
                });
            }
        }
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn delta(start: i64, last: i64) -> Snapshot {
        Snapshot::new(SnapshotKind::Delta, start, last, "")
    }

    #[test]
    fn test_canonical_name_carries_kind_and_revisions() {
        let snap = Snapshot::new(SnapshotKind::Full, 0, 512, ".gz");
        assert!(snap.snap_name.starts_with("Full-00000000-00000512-"));
        assert!(snap.snap_name.ends_with(".gz"));
        assert!(snap.is_compressed());
    }

    #[test]
    fn test_identity_is_dir_and_name_only() {
        let mut a = delta(1, 10);
        let mut b = a.clone();
        b.start_revision = 99;
        b.last_revision = 100;
        assert_eq!(a, b);

        a.snap_dir = "v2".to_string();
        assert_ne!(a, b);
    }

    #[test]
    fn test_full_path_joins_dir_and_name() {
        let snap = delta(1, 10).in_dir("Backup-001");
        assert_eq!(snap.full_path(), format!("Backup-001/{}", snap.snap_name));

        let bare = delta(1, 10);
        assert_eq!(bare.full_path(), bare.snap_name);
    }

    #[test]
    fn test_contiguous_chain_accepted() {
        let base = Snapshot::new(SnapshotKind::Full, 0, 5, "");
        let deltas = vec![delta(6, 9), delta(10, 14), delta(15, 20)];
        verify_snapshot_chain(&base, &deltas).expect("contiguous chain");
    }

    #[test]
    fn test_overlapping_first_delta_accepted() {
        // The producer may overlap the first delta with the base; the
        // applier resolves it at replay time.
        let base = Snapshot::new(SnapshotKind::Full, 0, 7, "");
        let deltas = vec![delta(4, 7), delta(8, 12)];
        verify_snapshot_chain(&base, &deltas).expect("overlap is allowed");
    }

    #[test]
    fn test_gap_after_base_rejected() {
        let base = Snapshot::new(SnapshotKind::Full, 0, 5, "");
        let deltas = vec![delta(8, 12)];
        let err = verify_snapshot_chain(&base, &deltas).unwrap_err();
        assert!(matches!(err, SnapListError::BaseGap { start: 8, base_last: 5 }));
    }

    #[test]
    fn test_mid_chain_gap_rejected() {
        let base = Snapshot::new(SnapshotKind::Full, 0, 5, "");
        let deltas = vec![delta(6, 9), delta(11, 14)];
        let err = verify_snapshot_chain(&base, &deltas).unwrap_err();
        assert!(matches!(err, SnapListError::RevisionGap { index: 1, start: 11, expected: 10 }));
    }

    #[test]
    fn test_inverted_range_rejected() {
        let base = Snapshot::new(SnapshotKind::Full, 0, 5, "");
        let deltas = vec![delta(6, 4)];
        let err = verify_snapshot_chain(&base, &deltas).unwrap_err();
        assert!(matches!(err, SnapListError::InvertedRange { .. }));
    }
}
