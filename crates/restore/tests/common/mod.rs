//! Shared fixtures for restore integration tests.

#![allow(clippy::unwrap_used, clippy::expect_used)]
// Each integration test binary uses the subset of the harness it needs.
#![allow(dead_code)]

use std::sync::Arc;

use etcdwarden_restore::Restorer;
use etcdwarden_test_utils::{
    FakeEtcd, FakeLauncher, FakeSnapshotRestore, InMemorySnapStore, TestDir, delta_blob,
};
use etcdwarden_types::{
    Event, RestorationConfig, RestoreOptions, SnapList, Snapshot, SnapshotKind,
};

/// One restore world: fake store, fake etcd, fake primitives, scratch dirs.
pub struct Harness {
    pub etcd: FakeEtcd,
    pub store: InMemorySnapStore,
    pub snapshot_restore: Arc<FakeSnapshotRestore>,
    pub launcher: Arc<FakeLauncher>,
    pub dir: TestDir,
}

impl Harness {
    pub fn new() -> Self {
        let etcd = FakeEtcd::new();
        Self {
            snapshot_restore: Arc::new(FakeSnapshotRestore::new(etcd.clone())),
            launcher: Arc::new(FakeLauncher::new()),
            etcd,
            store: InMemorySnapStore::new(),
            dir: TestDir::new(),
        }
    }

    pub fn restorer(&self) -> Restorer {
        Restorer::new(
            Arc::new(self.store.clone()),
            self.snapshot_restore.clone(),
            self.launcher.clone(),
        )
    }

    /// Restore options targeting this harness's scratch directories.
    pub fn options(&self, base: Option<Snapshot>, deltas: SnapList) -> RestoreOptions {
        self.options_from_config(base, deltas, self.config())
    }

    /// The default test config, pointed at this harness's scratch dirs.
    /// Tests needing quota or fetcher overrides rebuild from here.
    pub fn config(&self) -> RestorationConfig {
        RestorationConfig::builder()
            .data_dir(self.dir.join("default.etcd"))
            .temp_snapshots_dir(self.dir.join("restoration.tmp"))
            .build()
            .expect("valid test config")
    }

    /// Builds options from an explicit config (validated here).
    pub fn options_from_config(
        &self,
        base: Option<Snapshot>,
        deltas: SnapList,
        config: RestorationConfig,
    ) -> RestoreOptions {
        RestoreOptions::new(config, base, deltas).expect("valid restore options")
    }

    /// Creates a base snapshot descriptor and stores its (opaque) blob.
    pub fn base_snapshot(&self, last_revision: i64) -> Snapshot {
        let snap = Snapshot::new(SnapshotKind::Full, 0, last_revision, "");
        self.store.put(&snap, b"bbolt base image".to_vec());
        snap
    }

    /// Creates a delta snapshot descriptor and stores its encoded blob.
    pub fn delta(&self, start: i64, last: i64, events: &[Event]) -> Snapshot {
        let snap = Snapshot::new(SnapshotKind::Delta, start, last, "");
        self.store.put(&snap, delta_blob(events));
        snap
    }

    pub fn data_dir_exists(&self) -> bool {
        self.dir.join("default.etcd").join("member").join("snap").join("db").exists()
    }

    pub fn temp_dir_exists(&self) -> bool {
        self.dir.join("restoration.tmp").exists()
    }
}
