//! Pipeline-level behavior: integrity failures, ordering, lean-keeping,
//! collaborator failures, and lifecycle guarantees.

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use std::time::Duration;

use common::Harness;
use etcdwarden_restore::{CompressionPolicy, RestoreError, TxnOp};
use etcdwarden_test_utils::{FakeMemberControl, compress, delta_blob};
use etcdwarden_types::{Event, RestorationConfig, Snapshot, SnapshotKind};
use sha2::{Digest, Sha256};

#[tokio::test]
async fn compressed_base_and_deltas_restore_end_to_end() {
    let h = Harness::new();
    h.snapshot_restore.seed_base("a", "1", 5);

    // The base blob travels gzip-compressed; the primitive must receive
    // the decompressed bytes.
    let base_bytes = b"bbolt base image".to_vec();
    h.snapshot_restore.set_expected_db_bytes(base_bytes.clone());
    let base = Snapshot::new(SnapshotKind::Full, 0, 5, ".gz");
    h.store.put(&base, compress(&base_bytes, CompressionPolicy::Gzip).await);

    let events = [Event::put("b", "2", 6), Event::put("c", "3", 7)];
    let delta = Snapshot::new(SnapshotKind::Delta, 6, 7, ".zst");
    h.store.put(&delta, compress(&delta_blob(&events), CompressionPolicy::Zstd).await);

    let opts = h.options(Some(base), vec![delta]);
    h.restorer().restore_and_stop_etcd(&opts, &h.etcd, None).await.expect("restore succeeds");

    assert_eq!(h.etcd.revision(), 7);
    assert_eq!(h.snapshot_restore.restore_calls(), 1);
}

#[tokio::test]
async fn corrupted_delta_blob_fails_before_mutating_past_it() {
    let h = Harness::new();
    h.snapshot_restore.seed_base("a", "1", 5);
    let base = h.base_snapshot(5);

    let first = h.delta(6, 7, &[Event::put("b", "2", 6), Event::put("c", "3", 7)]);
    // Second delta: stored with one payload byte flipped.
    let events = [Event::put("d", "4", 8)];
    let mut blob = delta_blob(&events);
    blob[0] ^= 0xFF;
    let corrupt = Snapshot::new(SnapshotKind::Delta, 8, 8, "");
    h.store.put(&corrupt, blob);
    let third = h.delta(9, 9, &[Event::put("e", "5", 9)]);

    let opts = h.options(Some(base), vec![first, corrupt, third]);
    let err = h.restorer().restore(&opts, &h.etcd, None).await.unwrap_err();

    assert!(matches!(err, RestoreError::Integrity { .. }), "got {err}");
    // The corrupted delta contributed nothing to the transient etcd.
    assert!(h.etcd.kvs().get(b"d".as_slice()).is_none());
    assert_eq!(h.etcd.revision(), 7, "revision stops at the last verified delta");
    assert!(!h.temp_dir_exists());
}

#[tokio::test]
async fn truncated_delta_blob_is_an_integrity_error() {
    let h = Harness::new();
    h.snapshot_restore.seed_base("a", "1", 5);
    let base = h.base_snapshot(5);

    // 32 bytes total: checksum-sized, zero payload.
    let truncated = Snapshot::new(SnapshotKind::Delta, 6, 7, "");
    h.store.put(&truncated, vec![0u8; 32]);

    let opts = h.options(Some(base), vec![truncated]);
    let err = h.restorer().restore(&opts, &h.etcd, None).await.unwrap_err();

    assert!(matches!(err, RestoreError::Integrity { .. }), "got {err}");
}

#[tokio::test]
async fn unknown_event_kind_fails_the_decode() {
    let h = Harness::new();
    h.snapshot_restore.seed_base("a", "1", 5);
    let base = h.base_snapshot(5);

    // A compaction marker is not a replayable mutation.
    let payload = br#"[{"etcdEvent":{"type":"COMPACT","kv":{"key":"Zm9v","mod_revision":6}},"time":"2024-03-01T10:00:00Z"}]"#;
    let mut blob = payload.to_vec();
    blob.extend_from_slice(Sha256::digest(payload.as_slice()).as_slice());
    let delta = Snapshot::new(SnapshotKind::Delta, 6, 6, "");
    h.store.put(&delta, blob);

    let opts = h.options(Some(base), vec![delta]);
    let err = h.restorer().restore(&opts, &h.etcd, None).await.unwrap_err();

    assert!(matches!(err, RestoreError::EventDecode { .. }), "got {err}");
    assert!(h.etcd.committed_txns().is_empty());
}

#[tokio::test]
async fn out_of_order_fetches_apply_in_index_order() {
    let h = Harness::new();
    h.snapshot_restore.seed_base("a", "1", 5);
    let base = h.base_snapshot(5);

    let deltas = vec![
        h.delta(6, 6, &[Event::put("k0", "v", 6)]),
        h.delta(7, 7, &[Event::put("k1", "v", 7)]),
        h.delta(8, 8, &[Event::put("k2", "v", 8)]),
        h.delta(9, 9, &[Event::put("k3", "v", 9)]),
    ];
    // The first pipelined delta arrives last; later indices buffer until
    // it lands.
    h.store.delay_fetch(&deltas[1], Duration::from_millis(200));

    let opts = h.options(Some(base), deltas);
    h.restorer().restore_and_stop_etcd(&opts, &h.etcd, None).await.expect("restore succeeds");

    assert_eq!(h.etcd.revision(), 9);
    let applied_keys: Vec<Vec<u8>> = h
        .etcd
        .committed_txns()
        .into_iter()
        .flatten()
        .map(|op| match op {
            TxnOp::Put { key, .. } => key,
            TxnOp::Delete { key } => key,
        })
        .collect();
    assert_eq!(
        applied_keys,
        vec![b"k0".to_vec(), b"k1".to_vec(), b"k2".to_vec(), b"k3".to_vec()],
        "mutations must commit in global revision order regardless of fetch order"
    );
}

#[tokio::test]
async fn simultaneous_fetch_failures_never_deadlock() {
    let h = Harness::new();
    h.snapshot_restore.seed_base("a", "1", 5);
    let base = h.base_snapshot(5);

    let mut deltas = Vec::new();
    for i in 0..8_i64 {
        let rev = 6 + i;
        deltas.push(h.delta(rev, rev, &[Event::put(format!("k{i}"), "v", rev)]));
    }
    // Every pipelined fetch fails; the error channel must absorb one
    // report per fetcher without blocking any of them.
    for delta in &deltas[1..] {
        h.store.fail_fetch(delta);
    }

    let opts = h.options(Some(base), deltas);
    let err = h.restorer().restore(&opts, &h.etcd, None).await.unwrap_err();

    assert!(matches!(err, RestoreError::Fetch { .. }), "got {err}");
    assert!(!h.temp_dir_exists());
}

fn quota_config(h: &Harness, quota_bytes: i64) -> RestorationConfig {
    RestorationConfig::builder()
        .data_dir(h.dir.join("default.etcd"))
        .temp_snapshots_dir(h.dir.join("restoration.tmp"))
        .embedded_etcd_quota_bytes(quota_bytes)
        .build()
        .unwrap()
}

/// Twelve single-put deltas over a base at revision 5.
fn twelve_deltas(h: &Harness) -> Vec<Snapshot> {
    (0..12_i64)
        .map(|i| {
            let rev = 6 + i;
            h.delta(rev, rev, &[Event::put(format!("k{i}"), "v", rev)])
        })
        .collect()
}

#[tokio::test]
async fn failed_defragmentation_does_not_abort_the_restore() {
    let h = Harness::new();
    h.snapshot_restore.seed_base("a", "1", 5);
    let base = h.base_snapshot(5);
    let deltas = twelve_deltas(&h);

    // A one-byte quota keeps the backend permanently over the alarm
    // threshold, so every lean cycle raises the alarm; every
    // defragmentation is made to fail.
    h.etcd.set_fail_defrag(true);
    let opts = h.options_from_config(Some(base), deltas, quota_config(&h, 1));

    h.restorer()
        .restore_and_stop_etcd(&opts, &h.etcd, None)
        .await
        .expect("lean-keeping failures are absorbed by the applier");

    assert_eq!(h.etcd.revision(), 17, "all deltas applied despite defrag failures");
    // Lean ran at the 10-delta boundary and then again after the next
    // delta because the previous attempt failed.
    assert_eq!(h.etcd.compactions().len(), 2);
    assert_eq!(h.etcd.defrag_calls(), 0, "no defragmentation ever succeeded");
}

#[tokio::test]
async fn failed_compaction_does_not_abort_the_restore() {
    let h = Harness::new();
    h.snapshot_restore.seed_base("a", "1", 5);
    let base = h.base_snapshot(5);
    let deltas = twelve_deltas(&h);

    h.etcd.set_fail_compact(true);
    let opts = h.options_from_config(Some(base), deltas, quota_config(&h, 1));

    h.restorer()
        .restore_and_stop_etcd(&opts, &h.etcd, None)
        .await
        .expect("compaction failures are absorbed by the applier");

    assert_eq!(h.etcd.revision(), 17);
    assert!(h.etcd.compactions().is_empty());
    assert_eq!(h.etcd.defrag_calls(), 0);
}

#[tokio::test]
async fn successful_lean_cycle_defragments_once_alarmed() {
    let h = Harness::new();
    h.snapshot_restore.seed_base("a", "1", 5);
    let base = h.base_snapshot(5);
    let deltas = twelve_deltas(&h);

    let opts = h.options_from_config(Some(base), deltas, quota_config(&h, 1));
    h.restorer().restore_and_stop_etcd(&opts, &h.etcd, None).await.expect("restore succeeds");

    assert_eq!(h.etcd.revision(), 17);
    // First lean at the 10-delta boundary raises the alarm and the
    // handler defragments; the retry flag stays clear afterwards.
    assert_eq!(h.etcd.compactions(), vec![15]);
    assert_eq!(h.etcd.defrag_calls(), 1);
}

#[tokio::test]
async fn member_peer_url_is_rewritten_after_replay() {
    let h = Harness::new();
    h.snapshot_restore.seed_base("a", "1", 5);
    let base = h.base_snapshot(5);
    let delta = h.delta(6, 6, &[Event::put("b", "2", 6)]);
    let opts = h.options(Some(base), vec![delta]);

    let member_control = FakeMemberControl::new(vec!["http://10.0.0.9:2380".to_string()]);
    h.restorer()
        .restore_and_stop_etcd(&opts, &h.etcd, Some(&member_control))
        .await
        .expect("restore succeeds");

    assert_eq!(member_control.calls(), 1);
    let updates = h.etcd.member_updates();
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].1, vec!["http://10.0.0.9:2380".to_string()]);
}

#[tokio::test]
async fn member_control_failure_stops_the_transient_etcd() {
    let h = Harness::new();
    h.snapshot_restore.seed_base("a", "1", 5);
    let base = h.base_snapshot(5);
    let delta = h.delta(6, 6, &[Event::put("b", "2", 6)]);
    let opts = h.options(Some(base), vec![delta]);

    let member_control = FakeMemberControl::new(vec!["http://10.0.0.9:2380".to_string()]);
    member_control.set_fail(true);

    let err =
        h.restorer().restore(&opts, &h.etcd, Some(&member_control)).await.unwrap_err();

    assert!(matches!(err, RestoreError::Member { .. }), "got {err}");
    assert_eq!(h.launcher.stop_calls(), 1);
}

#[tokio::test]
async fn base_restore_failure_aborts_before_etcd_starts() {
    let h = Harness::new();
    let base = h.base_snapshot(5);
    h.snapshot_restore.set_fail(true);
    let delta = h.delta(6, 6, &[Event::put("b", "2", 6)]);
    let opts = h.options(Some(base), vec![delta]);

    let err = h.restorer().restore(&opts, &h.etcd, None).await.unwrap_err();

    assert!(matches!(err, RestoreError::EtcdRestore { .. }), "got {err}");
    assert_eq!(h.launcher.start_calls(), 0, "no transient etcd exists yet");
    assert!(!h.temp_dir_exists());
}

#[tokio::test]
async fn launcher_failure_is_fatal_and_cleaned_up() {
    let h = Harness::new();
    h.snapshot_restore.seed_base("a", "1", 5);
    let base = h.base_snapshot(5);
    h.launcher.set_fail_start(true);
    let delta = h.delta(6, 6, &[Event::put("b", "2", 6)]);
    let opts = h.options(Some(base), vec![delta]);

    let err = h.restorer().restore(&opts, &h.etcd, None).await.unwrap_err();

    assert!(matches!(err, RestoreError::Launch { .. }), "got {err}");
    assert!(!h.temp_dir_exists());
}

#[tokio::test]
async fn restore_and_stop_etcd_stops_the_handle_on_success() {
    let h = Harness::new();
    h.snapshot_restore.seed_base("a", "1", 5);
    let base = h.base_snapshot(5);
    let delta = h.delta(6, 6, &[Event::put("b", "2", 6)]);
    let opts = h.options(Some(base), vec![delta]);

    h.restorer().restore_and_stop_etcd(&opts, &h.etcd, None).await.expect("restore succeeds");

    assert_eq!(h.launcher.start_calls(), 1);
    assert_eq!(h.launcher.stop_calls(), 1);
}
