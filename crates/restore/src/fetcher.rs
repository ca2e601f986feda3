//! Parallel delta snapshot fetching.
//!
//! A pool of workers drains a shared work queue of delta descriptors,
//! persists each fetched blob to the scratch directory, and announces
//! availability to the applier. Workers complete in arbitrary order; the
//! applier restores ordering by index.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use etcdwarden_types::Snapshot;
use snafu::ResultExt;
use tokio::{io::AsyncWriteExt, sync::mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    error::{FetchSnafu, IoSnafu, RestoreError},
    metrics::{record_delta_fetched, record_fetch_failure},
    snapstore::{SnapStore, SnapshotReadStream},
};

/// Sentinel index announcing a failed fetch.
///
/// Used instead of closing the applier channel: multiple fetchers share the
/// sender side, so no single fetcher may close it.
pub(crate) const POISON_SNAP_INDEX: i64 = -1;

/// A delta snapshot queued for fetching, tagged with its position in the
/// remaining-delta list.
#[derive(Debug, Clone)]
pub(crate) struct FetcherInfo {
    /// The delta to fetch.
    pub snapshot: Snapshot,
    /// Index into `delta_snap_list[1..]`.
    pub snap_index: usize,
}

/// Availability announcement from a fetcher to the applier.
#[derive(Debug, Clone)]
pub(crate) struct ApplierInfo {
    /// Where the raw blob was persisted.
    pub snap_file_path: PathBuf,
    /// Index into `delta_snap_list[1..]`, or [`POISON_SNAP_INDEX`].
    pub snap_index: i64,
}

impl ApplierInfo {
    /// The poison announcement terminating the applier.
    pub(crate) fn poison() -> Self {
        Self { snap_file_path: PathBuf::new(), snap_index: POISON_SNAP_INDEX }
    }
}

/// One fetch worker.
///
/// Drains the work queue until it closes or the pipeline is cancelled. On
/// failure the worker reports the error on `err_tx`, poisons the applier,
/// and keeps serving the queue; the orchestrator cancels the pipeline once
/// it observes the error.
pub(crate) async fn fetch_snaps(
    fetcher_index: usize,
    store: Arc<dyn SnapStore>,
    temp_dir: PathBuf,
    fetcher_info_rx: async_channel::Receiver<FetcherInfo>,
    applier_tx: mpsc::Sender<ApplierInfo>,
    locations_tx: mpsc::Sender<PathBuf>,
    err_tx: mpsc::Sender<Result<(), RestoreError>>,
    cancel: CancellationToken,
) {
    loop {
        let info = tokio::select! {
            _ = cancel.cancelled() => return,
            received = fetcher_info_rx.recv() => match received {
                Ok(info) => info,
                // Queue closed and fully drained: nothing left to fetch.
                Err(_) => return,
            },
        };

        info!(
            fetcher = fetcher_index + 1,
            snapshot = %info.snapshot.full_path(),
            "Fetching delta snapshot"
        );

        match fetch_one(store.as_ref(), &temp_dir, &info).await {
            Ok(path) => {
                record_delta_fetched();
                // Register for terminal cleanup before the applier can
                // consume (and delete) the file.
                let _ = locations_tx.send(path.clone()).await;
                let announce =
                    ApplierInfo { snap_file_path: path, snap_index: info.snap_index as i64 };
                if applier_tx.send(announce).await.is_err() {
                    return;
                }
            },
            Err(e) => {
                record_fetch_failure();
                warn!(
                    snapshot = %info.snapshot.snap_name,
                    error = %e,
                    "Failed to fetch delta snapshot"
                );
                // The error channel only has room for one report per
                // fetcher plus the applier's; once the pipeline is being
                // torn down, further reports are redundant.
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = err_tx.send(Err(e)) => {},
                }
                if applier_tx.send(ApplierInfo::poison()).await.is_err() {
                    return;
                }
            },
        }
    }
}

async fn fetch_one(
    store: &dyn SnapStore,
    temp_dir: &Path,
    info: &FetcherInfo,
) -> Result<PathBuf, RestoreError> {
    let stream = store
        .fetch(&info.snapshot)
        .await
        .context(FetchSnafu { snap_name: info.snapshot.snap_name.clone() })?;
    let path = temp_dir.join(&info.snapshot.snap_name);
    persist_raw_delta(stream, &path).await?;
    Ok(path)
}

/// Persists the raw blob bytes, trailing checksum included; integrity is
/// deferred to the applier.
async fn persist_raw_delta(mut stream: SnapshotReadStream, path: &Path) -> Result<(), RestoreError> {
    let mut file = tokio::fs::File::create(path).await.context(IoSnafu)?;
    tokio::io::copy(&mut stream, &mut file).await.context(IoSnafu)?;
    file.flush().await.context(IoSnafu)?;
    Ok(())
}
