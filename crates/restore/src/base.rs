//! Base snapshot restoration.
//!
//! Materialises the initial data directory from the base full snapshot: the
//! blob is fetched, decompressed on the fly, spooled to a temporary bbolt
//! database file, and handed to the etcd snapshot-restore primitive. The
//! temporary file is removed on every exit path.

use snafu::ResultExt;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

use etcdwarden_types::RestoreOptions;

use crate::{
    compressor::{decompress_snapshot, is_snapshot_compressed},
    error::{CodecSnafu, EtcdRestoreSnafu, FetchSnafu, IoSnafu, RestoreError},
    etcd::{DbRestoreParams, SnapshotRestore},
    snapstore::SnapStore,
};

/// Restores `opts.config.data_dir` from the base snapshot.
///
/// A missing base snapshot (or one with an empty name) skips the step with
/// a warning: replay then starts from an empty transient etcd.
///
/// On failure the data directory may be partially written and must be
/// treated as invalid by the caller.
pub(crate) async fn restore_from_base_snapshot(
    store: &dyn SnapStore,
    restore_api: &dyn SnapshotRestore,
    opts: &RestoreOptions,
) -> Result<(), RestoreError> {
    let Some(base) = opts.base_snapshot.as_ref().filter(|s| !s.snap_name.is_empty()) else {
        warn!("Base snapshot path not provided. Will do nothing.");
        return Ok(());
    };

    info!(base_snapshot = %base.full_path(), "Restoring from base snapshot");
    let started = std::time::Instant::now();

    let stream = store
        .fetch(base)
        .await
        .context(FetchSnafu { snap_name: base.snap_name.clone() })?;

    let policy = is_snapshot_compressed(&base.compression_suffix).context(CodecSnafu)?;
    let mut reader = match policy {
        Some(policy) => decompress_snapshot(stream, policy),
        None => stream,
    };

    // Spool the database to disk; the restore primitive wants a file path.
    // NamedTempFile removes it again on drop, success or failure alike.
    let db_file = tempfile::Builder::new()
        .prefix("snapshot-")
        .suffix(".db")
        .tempfile_in(&opts.config.temp_snapshots_dir)
        .context(IoSnafu)?;
    let std_clone = db_file.as_file().try_clone().context(IoSnafu)?;
    let mut writer = tokio::fs::File::from_std(std_clone);
    tokio::io::copy(&mut reader, &mut writer).await.context(IoSnafu)?;
    writer.flush().await.context(IoSnafu)?;

    match policy {
        Some(policy) => info!(
            elapsed_secs = started.elapsed().as_secs_f64(),
            compression = %policy,
            "Fetched and saved data of the base snapshot"
        ),
        None => info!(
            elapsed_secs = started.elapsed().as_secs_f64(),
            "Fetched and saved data of the base snapshot"
        ),
    }

    restore_api
        .restore_to_data_dir(DbRestoreParams {
            snapshot_path: db_file.path(),
            member_name: &opts.config.name,
            peer_urls: opts.peer_urls.iter().map(|u| u.to_string()).collect(),
            initial_cluster: &opts.config.initial_cluster,
            initial_cluster_token: &opts.config.initial_cluster_token,
            output_data_dir: &opts.config.data_dir,
            skip_hash_check: opts.config.skip_hash_check,
        })
        .await
        .context(EtcdRestoreSnafu)?;

    info!(base_snapshot = %base.full_path(), "Successfully restored from base snapshot");
    Ok(())
}
