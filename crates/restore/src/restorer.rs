//! Restore orchestration.
//!
//! [`Restorer`] sequences the whole restore: temp directory lifecycle, base
//! restoration, transient etcd startup, the fetch/apply pipeline, member
//! peer-URL rewriting, and cleanup on every exit path. Each invocation is
//! all-or-nothing; there is no resumption of a partial restore.

use std::{path::PathBuf, sync::Arc, time::Instant};

use etcdwarden_types::{RestoreOptions, Snapshot};
use snafu::ResultExt;
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    applier::{apply_first_delta_snapshot, apply_snaps, verify_snapshot_revision},
    base::restore_from_base_snapshot,
    client::{ClientFactory, KvClient, MaintenanceClient},
    error::{ClientSnafu, IoSnafu, LaunchSnafu, MemberSnafu, RestoreError},
    etcd::{EmbeddedEtcd, EmbeddedLauncher, SnapshotRestore},
    fetcher::{FetcherInfo, fetch_snaps},
    lean::{LeanKeeper, handle_alarm},
    member::MemberControl,
    metrics::record_restoration_duration,
    snapstore::SnapStore,
};

/// Restores an etcd data directory from a base snapshot plus a chain of
/// delta snapshots.
pub struct Restorer {
    store: Arc<dyn SnapStore>,
    snapshot_restore: Arc<dyn SnapshotRestore>,
    launcher: Arc<dyn EmbeddedLauncher>,
}

impl Restorer {
    /// Creates a restorer over the given store and embedded-etcd primitives.
    pub fn new(
        store: Arc<dyn SnapStore>,
        snapshot_restore: Arc<dyn SnapshotRestore>,
        launcher: Arc<dyn EmbeddedLauncher>,
    ) -> Self {
        Self { store, snapshot_restore, launcher }
    }

    /// Restores the data directory and stops the transient etcd before
    /// returning.
    ///
    /// # Errors
    ///
    /// Propagates the first fatal error of the underlying [`restore`]
    /// (see [`RestoreError`]); the transient etcd is stopped either way.
    ///
    /// [`restore`]: Self::restore
    pub async fn restore_and_stop_etcd(
        &self,
        opts: &RestoreOptions,
        factory: &dyn ClientFactory,
        member_control: Option<&dyn MemberControl>,
    ) -> Result<(), RestoreError> {
        let embedded = self.restore(opts, factory, member_control).await?;
        if let Some(embedded) = embedded {
            embedded.stop().await;
        }
        Ok(())
    }

    /// Restores the data directory described by `opts`.
    ///
    /// On success with at least one delta, returns the still-running
    /// transient etcd; the caller owns stopping it. Returns `None` when no
    /// deltas exist and the transient etcd was never started. On failure
    /// the transient etcd is stopped before the error is returned, and the
    /// data directory must be treated as invalid.
    ///
    /// The temporary snapshot directory is created on entry and removed on
    /// every exit path, after all pipeline tasks have been joined.
    pub async fn restore(
        &self,
        opts: &RestoreOptions,
        factory: &dyn ClientFactory,
        member_control: Option<&dyn MemberControl>,
    ) -> Result<Option<Box<dyn EmbeddedEtcd>>, RestoreError> {
        let started = Instant::now();
        let result = self.restore_inner(opts, factory, member_control).await;

        match tokio::fs::remove_dir_all(&opts.config.temp_snapshots_dir).await {
            Ok(()) => {},
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {},
            Err(e) => error!(
                temp_dir = %opts.config.temp_snapshots_dir.display(),
                error = %e,
                "Failed to remove the restoration temp directory"
            ),
        }

        record_restoration_duration(
            if result.is_ok() { "success" } else { "failure" },
            started.elapsed().as_secs_f64(),
        );
        result
    }

    async fn restore_inner(
        &self,
        opts: &RestoreOptions,
        factory: &dyn ClientFactory,
        member_control: Option<&dyn MemberControl>,
    ) -> Result<Option<Box<dyn EmbeddedEtcd>>, RestoreError> {
        info!(
            temp_dir = %opts.config.temp_snapshots_dir.display(),
            "Creating temporary directory for persisting full and delta snapshots locally"
        );
        tokio::fs::create_dir_all(&opts.config.temp_snapshots_dir).await.context(IoSnafu)?;

        restore_from_base_snapshot(self.store.as_ref(), self.snapshot_restore.as_ref(), opts)
            .await?;

        if opts.delta_snap_list.is_empty() {
            info!("No delta snapshots present over base snapshot");
            return Ok(None);
        }

        info!(
            deltas = opts.delta_snap_list.len(),
            "Attempting to apply delta snapshots for restoration"
        );
        info!("Starting an embedded etcd server");
        let embedded = self.launcher.start(opts).await.context(LaunchSnafu)?;
        let endpoints = embedded.client_endpoints();

        if let Err(e) = self.apply_delta_snapshots(opts, factory, &endpoints).await {
            embedded.stop().await;
            return Err(e);
        }

        if let Some(member_control) = member_control {
            let updated = async {
                let cluster = factory.new_cluster().context(ClientSnafu)?;
                member_control.update_member_peer_url(cluster.as_ref()).await.context(MemberSnafu)
            }
            .await;
            if let Err(e) = updated {
                embedded.stop().await;
                return Err(e);
            }
        }

        Ok(Some(embedded))
    }

    /// Applies the whole delta chain: the first delta synchronously, the
    /// rest through the fetch/apply pipeline.
    async fn apply_delta_snapshots(
        &self,
        opts: &RestoreOptions,
        factory: &dyn ClientFactory,
        endpoints: &[String],
    ) -> Result<(), RestoreError> {
        let kv: Arc<dyn KvClient> = Arc::from(factory.new_kv().context(ClientSnafu)?);
        let maintenance: Arc<dyn MaintenanceClient> =
            Arc::from(factory.new_maintenance().context(ClientSnafu)?);

        let snap_list = &opts.delta_snap_list;
        let first = &snap_list[0];
        apply_first_delta_snapshot(self.store.as_ref(), kv.as_ref(), first).await?;
        verify_snapshot_revision(kv.as_ref(), first).await?;

        if snap_list.len() == 1 {
            info!("Restoration complete");
            return Ok(());
        }

        let remaining: Arc<Vec<Snapshot>> = Arc::new(snap_list[1..].to_vec());
        let num_snaps = remaining.len();
        let num_fetchers = opts.config.max_fetchers.min(num_snaps);

        let (fetcher_tx, fetcher_rx) = async_channel::bounded::<FetcherInfo>(num_snaps);
        let (applier_tx, applier_rx) = mpsc::channel(num_snaps);
        let (locations_tx, mut locations_rx) = mpsc::channel::<PathBuf>(num_snaps);
        // Sized so simultaneous fetcher failures plus the applier's
        // completion message can never block a sender.
        let (err_tx, mut err_rx) = mpsc::channel::<Result<(), RestoreError>>(num_fetchers + 1);
        let (alarm_tx, alarm_rx) = mpsc::channel::<String>(1);
        let (disarm_tx, disarm_rx) = mpsc::channel::<bool>(1);
        let cancel = CancellationToken::new();

        let lean = LeanKeeper::new(
            endpoints.to_vec(),
            opts.config.embedded_etcd_quota_bytes,
            alarm_tx,
            disarm_rx,
        );

        let mut tasks: Vec<JoinHandle<()>> = Vec::new();
        tasks.push(tokio::spawn(apply_snaps(
            kv.clone(),
            maintenance.clone(),
            remaining.clone(),
            lean,
            applier_rx,
            err_tx.clone(),
            cancel.clone(),
        )));
        for fetcher_index in 0..num_fetchers {
            tasks.push(tokio::spawn(fetch_snaps(
                fetcher_index,
                self.store.clone(),
                opts.config.temp_snapshots_dir.clone(),
                fetcher_rx.clone(),
                applier_tx.clone(),
                locations_tx.clone(),
                err_tx.clone(),
                cancel.clone(),
            )));
        }
        tasks.push(tokio::spawn(handle_alarm(
            maintenance.clone(),
            alarm_rx,
            disarm_tx,
            cancel.clone(),
        )));

        for (snap_index, snapshot) in remaining.iter().enumerate() {
            let queued = FetcherInfo { snapshot: snapshot.clone(), snap_index };
            if fetcher_tx.send(queued).await.is_err() {
                break;
            }
        }
        fetcher_tx.close();

        let outcome = err_rx.recv().await.unwrap_or(Err(RestoreError::PipelineInterrupted));

        // Our clones must go before the drain below can observe closure.
        drop(applier_tx);
        drop(err_tx);
        drop(locations_tx);

        if let Err(e) = cleanup(&cancel, tasks, &mut locations_rx).await {
            error!(error = %e, "Cleanup of temporary snapshots failed");
        }

        match &outcome {
            Ok(()) => info!("Restoration complete"),
            Err(_) => error!("Restoration failed"),
        }
        outcome
    }
}

/// Stops all pipeline tasks, joins them, and removes any persisted delta
/// files that were never consumed by the applier.
///
/// Removal failures are aggregated into one [`RestoreError::Cleanup`];
/// the caller reports it without letting it override the primary outcome.
async fn cleanup(
    cancel: &CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    locations_rx: &mut mpsc::Receiver<PathBuf>,
) -> Result<(), RestoreError> {
    cancel.cancel();
    for task in tasks {
        if let Err(e) = task.await {
            warn!(error = %e, "Restore pipeline task ended abnormally");
        }
    }

    let mut failures: Vec<String> = Vec::new();
    while let Ok(path) = locations_rx.try_recv() {
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {},
            // Already removed by the applier after a successful apply.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {},
            Err(e) => failures.push(format!("unable to remove file {}: {e}", path.display())),
        }
    }

    if failures.is_empty() {
        info!("Cleanup complete");
        Ok(())
    } else {
        Err(RestoreError::Cleanup { messages: failures })
    }
}
