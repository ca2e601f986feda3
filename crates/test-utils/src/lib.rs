//! In-memory fakes and helpers for testing the etcdwarden restore engine.
//!
//! The restore engine consumes its collaborators (the object store, the
//! etcd clients, the snapshot-restore primitive, the embedded launcher, and
//! member control) through traits. This crate implements all of them in
//! memory, with failure injection, so engine behavior can be exercised
//! end-to-end without a real etcd or object store.

#![deny(unsafe_code)]

mod fake_etcd;
mod store;
mod test_dir;

pub use fake_etcd::{
    FakeEmbedded, FakeEtcd, FakeLauncher, FakeMemberControl, FakeSnapshotRestore,
};
pub use store::{InMemorySnapStore, compress, delta_blob};
pub use test_dir::TestDir;
