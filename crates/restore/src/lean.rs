//! Lean-keeping for the transient etcd.
//!
//! Replaying tens of thousands of events grows the embedded backend toward
//! its quota. The applier periodically compacts at the latest applied
//! revision and, when the database size crosses the alarm threshold, raises
//! an alarm that a dedicated handler answers with a defragmentation. The
//! alarm/disarm handshake keeps compaction and defragmentation strictly
//! non-concurrent and blocks the applier until the defragmentation is done,
//! so the next batch cannot overflow the quota.

use std::sync::Arc;

use snafu::ResultExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    client::{
        ETCD_COMPACT_TIMEOUT, ETCD_CONNECTION_TIMEOUT, ETCD_DEFRAG_TIMEOUT, KvClient,
        MaintenanceClient, with_timeout,
    },
    error::{CompactSnafu, RestoreError, StatusSnafu},
    metrics::{record_defrag, record_lean_cycle},
};

/// Lean-keeping runs after every this-many applied deltas.
pub(crate) const LEAN_DELTA_INTERVAL: usize = 10;

/// Fraction of the backend quota at which the db-size alarm is raised.
pub(crate) const DB_SIZE_ALARM_THRESHOLD: f64 = 0.80;

/// The applier-side half of the lean-keeping handshake.
pub(crate) struct LeanKeeper {
    endpoints: Vec<String>,
    quota_bytes: f64,
    alarm_tx: mpsc::Sender<String>,
    disarm_rx: mpsc::Receiver<bool>,
}

impl LeanKeeper {
    /// Creates the applier-side handle.
    pub(crate) fn new(
        endpoints: Vec<String>,
        quota_bytes: i64,
        alarm_tx: mpsc::Sender<String>,
        disarm_rx: mpsc::Receiver<bool>,
    ) -> Self {
        Self { endpoints, quota_bytes: quota_bytes as f64, alarm_tx, disarm_rx }
    }

    /// Compacts the transient etcd at `revision` and raises the db-size
    /// alarm when the backend crosses the threshold.
    ///
    /// # Errors
    ///
    /// - [`RestoreError::Compact`] if the compaction call fails
    /// - [`RestoreError::Status`] if the status query fails
    /// - [`RestoreError::DefragFailed`] if the alarm could not be disarmed
    pub(crate) async fn make_etcd_lean_and_check_alarm(
        &mut self,
        revision: i64,
        kv: &dyn KvClient,
        maintenance: &dyn MaintenanceClient,
    ) -> Result<(), RestoreError> {
        let result = self.lean_once(revision, kv, maintenance).await;
        record_lean_cycle(if result.is_ok() { "success" } else { "failure" });
        result
    }

    async fn lean_once(
        &mut self,
        revision: i64,
        kv: &dyn KvClient,
        maintenance: &dyn MaintenanceClient,
    ) -> Result<(), RestoreError> {
        with_timeout(ETCD_COMPACT_TIMEOUT, kv.compact(revision)).await.context(CompactSnafu)?;
        info!(revision, "Compacted the embedded etcd");

        let status = with_timeout(
            ETCD_CONNECTION_TIMEOUT,
            maintenance.status(&self.endpoints[0]),
        )
        .await
        .context(StatusSnafu)?;

        let threshold = DB_SIZE_ALARM_THRESHOLD * self.quota_bytes;
        if (status.db_size_in_use as f64) <= threshold && (status.db_size as f64) <= threshold {
            info!(
                db_size_bytes = status.db_size,
                threshold_bytes = threshold,
                "Embedded etcd database size is below the threshold limit"
            );
            return Ok(());
        }

        info!(
            db_size_bytes = status.db_size,
            db_size_in_use_bytes = status.db_size_in_use,
            threshold_bytes = threshold,
            "Embedded etcd database size crosses the threshold limit; raising a db-size alarm"
        );

        let endpoints = self.endpoints.clone();
        for endpoint in endpoints {
            if self.alarm_tx.send(endpoint.clone()).await.is_err() {
                return Err(RestoreError::DefragFailed);
            }
            match self.disarm_rx.recv().await {
                Some(true) => {},
                Some(false) | None => return Err(RestoreError::DefragFailed),
            }
            info!(endpoint = %endpoint, "Successfully disarmed the embedded etcd db-size alarm");

            match with_timeout(ETCD_CONNECTION_TIMEOUT, maintenance.status(&endpoint)).await {
                Ok(after) => info!(
                    before_bytes = status.db_size,
                    after_bytes = after.db_size,
                    "Database size change after defragmentation"
                ),
                Err(e) => warn!(
                    endpoint = %endpoint,
                    error = %e,
                    "Failed to get status of the embedded etcd after defragmentation"
                ),
            }
        }
        Ok(())
    }
}

/// The alarm handler task.
///
/// Answers each raised alarm with a defragmentation of the named endpoint
/// and reports the outcome on the disarm channel. Runs until cancelled.
pub(crate) async fn handle_alarm(
    maintenance: Arc<dyn MaintenanceClient>,
    mut alarm_rx: mpsc::Receiver<String>,
    disarm_tx: mpsc::Sender<bool>,
    cancel: CancellationToken,
) {
    info!("Starting the db-size alarm handler");
    loop {
        let endpoint = tokio::select! {
            _ = cancel.cancelled() => {
                info!("Closing the db-size alarm handler");
                return;
            }
            received = alarm_rx.recv() => match received {
                Some(endpoint) => endpoint,
                None => return,
            },
        };

        info!(endpoint = %endpoint, "Received a db-size alarm; calling defragment");
        let disarmed =
            match with_timeout(ETCD_DEFRAG_TIMEOUT, maintenance.defragment(&endpoint)).await {
                Ok(()) => {
                    record_defrag("success");
                    true
                },
                Err(e) => {
                    record_defrag("failure");
                    error!(
                        endpoint = %endpoint,
                        error = %e,
                        "Unable to disarm as the defragment call failed"
                    );
                    false
                },
            };

        if disarm_tx.send(disarmed).await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use etcdwarden_test_utils::FakeEtcd;

    use super::*;

    const ENDPOINT: &str = "http://127.0.0.1:2379";

    struct LeanWorld {
        etcd: FakeEtcd,
        keeper: LeanKeeper,
        handler: tokio::task::JoinHandle<()>,
        cancel: CancellationToken,
    }

    fn lean_world(quota_bytes: i64) -> LeanWorld {
        let etcd = FakeEtcd::new();
        let (alarm_tx, alarm_rx) = mpsc::channel(1);
        let (disarm_tx, disarm_rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let handler = tokio::spawn(handle_alarm(
            Arc::new(etcd.clone()),
            alarm_rx,
            disarm_tx,
            cancel.clone(),
        ));
        let keeper =
            LeanKeeper::new(vec![ENDPOINT.to_string()], quota_bytes, alarm_tx, disarm_rx);
        LeanWorld { etcd, keeper, handler, cancel }
    }

    async fn shutdown(world: LeanWorld) {
        world.cancel.cancel();
        world.handler.await.unwrap();
    }

    #[tokio::test]
    async fn test_below_threshold_compacts_without_alarm() {
        let mut world = lean_world(1024 * 1024);
        world.etcd.seed("a", "1", 5);

        world
            .keeper
            .make_etcd_lean_and_check_alarm(5, &world.etcd, &world.etcd)
            .await
            .expect("lean succeeds");

        assert_eq!(world.etcd.compactions(), vec![5]);
        assert_eq!(world.etcd.defrag_calls(), 0, "no alarm below the threshold");
        shutdown(world).await;
    }

    #[tokio::test]
    async fn test_threshold_crossing_defragments_through_the_handler() {
        let mut world = lean_world(1024);
        world.etcd.seed("a", "1", 5);
        world.etcd.set_db_size(900);

        world
            .keeper
            .make_etcd_lean_and_check_alarm(5, &world.etcd, &world.etcd)
            .await
            .expect("lean succeeds");

        assert_eq!(world.etcd.defrag_calls(), 1);
        assert!(world.etcd.db_size() < 900, "defragmentation reclaimed free pages");
        shutdown(world).await;
    }

    #[tokio::test]
    async fn test_failed_defragmentation_reports_defrag_failed() {
        let mut world = lean_world(1024);
        world.etcd.seed("a", "1", 5);
        world.etcd.set_db_size(900);
        world.etcd.set_fail_defrag(true);

        let err = world
            .keeper
            .make_etcd_lean_and_check_alarm(5, &world.etcd, &world.etcd)
            .await
            .unwrap_err();

        assert!(matches!(err, RestoreError::DefragFailed), "got {err}");
        shutdown(world).await;
    }

    #[tokio::test]
    async fn test_compact_failure_short_circuits() {
        let mut world = lean_world(1024);
        world.etcd.set_fail_compact(true);

        let err = world
            .keeper
            .make_etcd_lean_and_check_alarm(5, &world.etcd, &world.etcd)
            .await
            .unwrap_err();

        assert!(matches!(err, RestoreError::Compact { .. }), "got {err}");
        assert_eq!(world.etcd.defrag_calls(), 0);
        shutdown(world).await;
    }

    #[tokio::test]
    async fn test_status_failure_short_circuits() {
        let mut world = lean_world(1024);
        world.etcd.set_fail_status(true);

        let err = world
            .keeper
            .make_etcd_lean_and_check_alarm(5, &world.etcd, &world.etcd)
            .await
            .unwrap_err();

        assert!(matches!(err, RestoreError::Status { .. }), "got {err}");
        shutdown(world).await;
    }
}
