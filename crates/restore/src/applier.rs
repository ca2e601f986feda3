//! Ordered application of delta snapshots.
//!
//! Exactly one applier consumes the fetchers' announcements, buffers them by
//! index, and replays deltas against the transient etcd in strict index
//! order. Within a delta, operations sharing a `mod_revision` are committed
//! as one transaction so the replay reproduces the original revision
//! sequence; the post-apply revision check relies on that.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use etcdwarden_types::{Event, EventKind, Snapshot};
use snafu::ResultExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    client::{ETCD_CONNECTION_TIMEOUT, KvClient, MaintenanceClient, TxnOp, with_timeout},
    error::{ClientSnafu, EventDecodeSnafu, FetchSnafu, RestoreError},
    fetcher::{ApplierInfo, POISON_SNAP_INDEX},
    integrity::{read_delta_contents, read_delta_file},
    lean::{LEAN_DELTA_INTERVAL, LeanKeeper},
    metrics::record_delta_applied,
    snapstore::SnapStore,
};

/// Decodes a verified delta payload into its event list.
pub(crate) fn decode_events(data: &[u8], snap: &Snapshot) -> Result<Vec<Event>, RestoreError> {
    serde_json::from_slice(data).context(EventDecodeSnafu { snap_name: snap.snap_name.clone() })
}

/// Replays `events` in order against the transient etcd.
///
/// Operations are accumulated into a pending transaction; a strictly
/// increasing `mod_revision` commits the pending batch and starts a new
/// one, so operations sharing a revision land in a single transaction. The
/// final residual batch is committed unconditionally.
pub(crate) async fn apply_events(kv: &dyn KvClient, events: &[Event]) -> Result<(), RestoreError> {
    let mut last_rev: i64 = 0;
    let mut ops: Vec<TxnOp> = Vec::new();

    for event in events {
        let next_rev = event.mod_revision();
        if last_rev != 0 && next_rev > last_rev {
            let batch = std::mem::take(&mut ops);
            kv.commit_txn(batch).await.context(ClientSnafu)?;
        }
        last_rev = next_rev;

        let pair = &event.etcd_event.kv;
        match event.etcd_event.kind {
            EventKind::Put => {
                ops.push(TxnOp::Put { key: pair.key.clone(), value: pair.value.clone() });
            },
            EventKind::Delete => {
                ops.push(TxnOp::Delete { key: pair.key.clone() });
            },
        }
    }

    kv.commit_txn(ops).await.context(ClientSnafu)
}

/// Asserts that the transient etcd's revision matches the last revision the
/// delta claims to cover.
pub(crate) async fn verify_snapshot_revision(
    kv: &dyn KvClient,
    snap: &Snapshot,
) -> Result<(), RestoreError> {
    let actual = with_timeout(ETCD_CONNECTION_TIMEOUT, kv.current_revision())
        .await
        .context(ClientSnafu)?;
    if snap.last_revision != actual {
        return Err(RestoreError::RevisionMismatch {
            snap_name: snap.snap_name.clone(),
            expected: snap.last_revision,
            actual,
        });
    }
    Ok(())
}

/// Applies the first delta snapshot, resolving revision overlap with the
/// base snapshot.
///
/// The base snapshot's recorded last-revision can lag the store's actual
/// latest revision, so the first delta may overlap the base. If the store
/// is already at the delta's last revision the delta is skipped entirely;
/// otherwise replay starts at the first event past the store's revision.
pub(crate) async fn apply_first_delta_snapshot(
    store: &dyn SnapStore,
    kv: &dyn KvClient,
    snap: &Snapshot,
) -> Result<(), RestoreError> {
    info!(snapshot = %snap.full_path(), "Applying first delta snapshot");

    let stream = store
        .fetch(snap)
        .await
        .context(FetchSnafu { snap_name: snap.snap_name.clone() })?;
    let data = read_delta_contents(stream, snap).await?;
    let events = decode_events(&data, snap)?;

    let last_revision =
        with_timeout(ETCD_CONNECTION_TIMEOUT, kv.latest_revision()).await.context(ClientSnafu)?;

    if last_revision == snap.last_revision {
        info!(
            snapshot = %snap.full_path(),
            revision = last_revision,
            "First delta snapshot completely overlaps the base snapshot; skipping it"
        );
        return Ok(());
    }

    let start = events.iter().position(|e| e.mod_revision() > last_revision).unwrap_or(0);
    apply_events(kv, &events[start..]).await
}

async fn apply_delta_file(
    kv: &dyn KvClient,
    path: &Path,
    snap: &Snapshot,
) -> Result<(), RestoreError> {
    let data = read_delta_file(path, snap).await?;
    let events = decode_events(&data, snap)?;
    apply_events(kv, &events).await?;
    verify_snapshot_revision(kv, snap).await
}

/// Reports an outcome on the error channel unless the pipeline is already
/// being torn down.
async fn report(
    err_tx: &mpsc::Sender<Result<(), RestoreError>>,
    outcome: Result<(), RestoreError>,
    cancel: &CancellationToken,
) {
    tokio::select! {
        _ = cancel.cancelled() => {},
        _ = err_tx.send(outcome) => {},
    }
}

/// The applier task: consumes fetcher announcements and replays deltas in
/// strict index order.
///
/// Signals completion by sending `Ok(())` on `err_tx` once the last delta
/// is applied. A poison announcement terminates the task silently (the
/// failing fetcher already reported the error). Every
/// [`LEAN_DELTA_INTERVAL`]th applied delta triggers a lean-keeping cycle;
/// lean failures are logged and retried after the next delta, never fatal.
pub(crate) async fn apply_snaps(
    kv: Arc<dyn KvClient>,
    maintenance: Arc<dyn MaintenanceClient>,
    remaining_snaps: Arc<Vec<Snapshot>>,
    mut lean: LeanKeeper,
    mut applier_rx: mpsc::Receiver<ApplierInfo>,
    err_tx: mpsc::Sender<Result<(), RestoreError>>,
    cancel: CancellationToken,
) {
    // The first delta was already applied synchronously before the
    // pipeline started.
    let mut deltas_applied: usize = 1;
    let mut prev_lean_attempt_failed = false;
    let mut path_by_index: Vec<Option<PathBuf>> = vec![None; remaining_snaps.len()];
    let mut next_index: usize = 0;

    loop {
        let announced = tokio::select! {
            _ = cancel.cancelled() => return,
            received = applier_rx.recv() => match received {
                Some(info) => info,
                None => return,
            },
        };

        if announced.snap_index == POISON_SNAP_INDEX {
            // A fetcher failed and already reported its error.
            return;
        }
        let fetched = announced.snap_index as usize;

        if fetched < next_index {
            let mismatch = RestoreError::SnapIndexMismatch { fetched, expected: next_index };
            report(&err_tx, Err(mismatch), &cancel).await;
            return;
        }
        path_by_index[fetched] = Some(announced.snap_file_path);
        if fetched != next_index {
            continue;
        }

        while next_index < remaining_snaps.len() {
            let Some(path) = path_by_index[next_index].take() else { break };
            let snap = &remaining_snaps[next_index];

            info!(
                snapshot = %snap.full_path(),
                applied = next_index + 2,
                total = remaining_snaps.len() + 1,
                "Applying delta snapshot"
            );
            if let Err(e) = apply_delta_file(kv.as_ref(), &path, snap).await {
                report(&err_tx, Err(e), &cancel).await;
                return;
            }
            record_delta_applied(snap.last_revision);

            if let Err(e) = tokio::fs::remove_file(&path).await {
                warn!(
                    path = %path.display(),
                    error = %e,
                    "Unable to remove applied delta snapshot file"
                );
            }

            next_index += 1;
            if next_index == remaining_snaps.len() {
                // Restore finished.
                report(&err_tx, Ok(()), &cancel).await;
                return;
            }

            deltas_applied += 1;
            if deltas_applied % LEAN_DELTA_INTERVAL == 0 || prev_lean_attempt_failed {
                info!("Making the embedded etcd lean and checking the db-size alarm");
                match lean
                    .make_etcd_lean_and_check_alarm(
                        snap.last_revision,
                        kv.as_ref(),
                        maintenance.as_ref(),
                    )
                    .await
                {
                    Ok(()) => prev_lean_attempt_failed = false,
                    Err(e) => {
                        warn!(
                            error = %e,
                            "Unable to make the embedded etcd lean; the database may exceed \
                             its quota, retrying after the next delta"
                        );
                        prev_lean_attempt_failed = true;
                    },
                }
            }
        }
    }
}
