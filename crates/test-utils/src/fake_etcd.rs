//! An in-memory etcd standing in for the transient replay server.
//!
//! [`FakeEtcd`] models exactly as much of etcd as the restore engine
//! observes: an MVCC key space where every non-empty transaction commits at
//! one new revision, backend size accounting that grows with writes and
//! shrinks on defragmentation, and compaction/status/defragment calls with
//! failure injection. One `FakeEtcd` implements every client trait plus the
//! client factory, mirroring how the real clients all talk to the same
//! server.

use std::{
    collections::BTreeMap,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use async_trait::async_trait;
use etcdwarden_restore::{
    ClientError, ClientFactory, ClusterClient, DbRestoreParams, DbStatus, EmbeddedEtcd,
    EmbeddedLauncher, EtcdError, KvClient, MaintenanceClient, Member, MemberControl, MemberError,
    SnapshotRestore, TxnOp,
};
use etcdwarden_types::RestoreOptions;
use parking_lot::Mutex;

/// The client endpoint the fake pretends to listen on.
pub const FAKE_ENDPOINT: &str = "http://127.0.0.1:2379";

#[derive(Default)]
struct FakeEtcdState {
    kvs: BTreeMap<Vec<u8>, (Vec<u8>, i64)>,
    revision: i64,
    db_size: i64,
    committed_txns: Vec<Vec<TxnOp>>,
    compactions: Vec<i64>,
    defrag_calls: usize,
    member_updates: Vec<(u64, Vec<String>)>,
    members: Vec<Member>,
    fail_next_txn: bool,
    fail_compact: bool,
    fail_status: bool,
    fail_defrag: bool,
}

impl FakeEtcdState {
    fn live_bytes(&self) -> i64 {
        self.kvs.iter().map(|(k, (v, _))| (k.len() + v.len()) as i64).sum()
    }
}

/// In-memory transient etcd with failure injection.
#[derive(Clone)]
pub struct FakeEtcd {
    state: Arc<Mutex<FakeEtcdState>>,
}

impl Default for FakeEtcd {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeEtcd {
    /// Creates an empty fake with one default member.
    pub fn new() -> Self {
        let members = vec![Member {
            id: 1,
            name: "default".to_string(),
            peer_urls: vec!["http://localhost:2380".to_string()],
        }];
        let state = FakeEtcdState { members, ..FakeEtcdState::default() };
        Self { state: Arc::new(Mutex::new(state)) }
    }

    /// Seeds one key as if it was written at `mod_revision`; the store
    /// revision advances to at least that revision.
    pub fn seed(&self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>, mod_revision: i64) {
        let mut state = self.state.lock();
        let key = key.into();
        let value = value.into();
        state.db_size += (key.len() + value.len()) as i64;
        state.kvs.insert(key, (value, mod_revision));
        state.revision = state.revision.max(mod_revision);
    }

    /// Forces the store revision, independent of seeded keys.
    pub fn set_revision(&self, revision: i64) {
        self.state.lock().revision = revision;
    }

    /// Current store revision.
    pub fn revision(&self) -> i64 {
        self.state.lock().revision
    }

    /// Current value of `key`, if present.
    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.state.lock().kvs.get(key).map(|(v, _)| v.clone())
    }

    /// Live key-value view of the store.
    pub fn kvs(&self) -> BTreeMap<Vec<u8>, Vec<u8>> {
        self.state.lock().kvs.iter().map(|(k, (v, _))| (k.clone(), v.clone())).collect()
    }

    /// Every transaction committed so far, empty ones included.
    pub fn committed_txns(&self) -> Vec<Vec<TxnOp>> {
        self.state.lock().committed_txns.clone()
    }

    /// Revisions compaction was requested at.
    pub fn compactions(&self) -> Vec<i64> {
        self.state.lock().compactions.clone()
    }

    /// Number of defragmentation calls served.
    pub fn defrag_calls(&self) -> usize {
        self.state.lock().defrag_calls
    }

    /// Backend size, free pages included.
    pub fn db_size(&self) -> i64 {
        self.state.lock().db_size
    }

    /// Forces the backend size, e.g. to push it over the alarm threshold.
    pub fn set_db_size(&self, bytes: i64) {
        self.state.lock().db_size = bytes;
    }

    /// Recorded member peer-URL updates.
    pub fn member_updates(&self) -> Vec<(u64, Vec<String>)> {
        self.state.lock().member_updates.clone()
    }

    /// Fails the next transaction commit with a request error.
    pub fn fail_next_txn(&self) {
        self.state.lock().fail_next_txn = true;
    }

    /// Makes compaction calls fail until reset.
    pub fn set_fail_compact(&self, fail: bool) {
        self.state.lock().fail_compact = fail;
    }

    /// Makes status calls fail until reset.
    pub fn set_fail_status(&self, fail: bool) {
        self.state.lock().fail_status = fail;
    }

    /// Makes defragment calls fail until reset.
    pub fn set_fail_defrag(&self, fail: bool) {
        self.state.lock().fail_defrag = fail;
    }
}

#[async_trait]
impl KvClient for FakeEtcd {
    async fn latest_revision(&self) -> Result<i64, ClientError> {
        Ok(self.state.lock().revision)
    }

    async fn current_revision(&self) -> Result<i64, ClientError> {
        Ok(self.state.lock().revision)
    }

    async fn commit_txn(&self, ops: Vec<TxnOp>) -> Result<(), ClientError> {
        let mut state = self.state.lock();
        if state.fail_next_txn {
            state.fail_next_txn = false;
            return Err(ClientError::Request { message: "injected txn failure".to_string() });
        }

        // Every non-empty transaction commits at exactly one new revision;
        // this is what lets replay reproduce the original revision
        // sequence when equal-revision operations share a transaction.
        if !ops.is_empty() {
            state.revision += 1;
            let revision = state.revision;
            for op in &ops {
                match op {
                    TxnOp::Put { key, value } => {
                        state.db_size += (key.len() + value.len()) as i64;
                        state.kvs.insert(key.clone(), (value.clone(), revision));
                    },
                    TxnOp::Delete { key } => {
                        state.kvs.remove(key);
                    },
                }
            }
        }
        state.committed_txns.push(ops);
        Ok(())
    }

    async fn compact(&self, revision: i64) -> Result<(), ClientError> {
        let mut state = self.state.lock();
        if state.fail_compact {
            return Err(ClientError::Request { message: "injected compact failure".to_string() });
        }
        state.compactions.push(revision);
        Ok(())
    }
}

#[async_trait]
impl MaintenanceClient for FakeEtcd {
    async fn status(&self, _endpoint: &str) -> Result<DbStatus, ClientError> {
        let state = self.state.lock();
        if state.fail_status {
            return Err(ClientError::Connection { message: "injected status failure".to_string() });
        }
        Ok(DbStatus {
            db_size: state.db_size,
            db_size_in_use: state.live_bytes(),
            revision: state.revision,
        })
    }

    async fn defragment(&self, _endpoint: &str) -> Result<(), ClientError> {
        let mut state = self.state.lock();
        if state.fail_defrag {
            return Err(ClientError::Request { message: "injected defrag failure".to_string() });
        }
        state.defrag_calls += 1;
        state.db_size = state.live_bytes();
        Ok(())
    }
}

#[async_trait]
impl ClusterClient for FakeEtcd {
    async fn member_list(&self) -> Result<Vec<Member>, ClientError> {
        Ok(self.state.lock().members.clone())
    }

    async fn member_update(
        &self,
        member_id: u64,
        peer_urls: Vec<String>,
    ) -> Result<(), ClientError> {
        let mut state = self.state.lock();
        let Some(member) = state.members.iter_mut().find(|m| m.id == member_id) else {
            return Err(ClientError::Request { message: format!("no member {member_id}") });
        };
        member.peer_urls = peer_urls.clone();
        state.member_updates.push((member_id, peer_urls));
        Ok(())
    }
}

impl ClientFactory for FakeEtcd {
    fn new_kv(&self) -> Result<Box<dyn KvClient>, ClientError> {
        Ok(Box::new(self.clone()))
    }

    fn new_maintenance(&self) -> Result<Box<dyn MaintenanceClient>, ClientError> {
        Ok(Box::new(self.clone()))
    }

    fn new_cluster(&self) -> Result<Box<dyn ClusterClient>, ClientError> {
        Ok(Box::new(self.clone()))
    }
}

/// The running-server handle returned by [`FakeLauncher`].
#[derive(Debug)]
pub struct FakeEmbedded {
    stop_calls: Arc<AtomicUsize>,
}

#[async_trait]
impl EmbeddedEtcd for FakeEmbedded {
    fn client_endpoints(&self) -> Vec<String> {
        vec![FAKE_ENDPOINT.to_string()]
    }

    async fn stop(&self) {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
    }
}

/// Launcher handing out [`FakeEmbedded`] handles over one [`FakeEtcd`].
pub struct FakeLauncher {
    start_calls: Arc<AtomicUsize>,
    stop_calls: Arc<AtomicUsize>,
    fail_start: Mutex<bool>,
}

impl Default for FakeLauncher {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeLauncher {
    /// Creates a launcher that starts successfully.
    pub fn new() -> Self {
        Self {
            start_calls: Arc::new(AtomicUsize::new(0)),
            stop_calls: Arc::new(AtomicUsize::new(0)),
            fail_start: Mutex::new(false),
        }
    }

    /// Makes the next and all further starts fail.
    pub fn set_fail_start(&self, fail: bool) {
        *self.fail_start.lock() = fail;
    }

    /// How many times the embedded server was started.
    pub fn start_calls(&self) -> usize {
        self.start_calls.load(Ordering::SeqCst)
    }

    /// How many times a handed-out server handle was stopped.
    pub fn stop_calls(&self) -> usize {
        self.stop_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EmbeddedLauncher for FakeLauncher {
    async fn start(&self, _opts: &RestoreOptions) -> Result<Box<dyn EmbeddedEtcd>, EtcdError> {
        if *self.fail_start.lock() {
            return Err(EtcdError::Start { message: "injected start failure".to_string() });
        }
        self.start_calls.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeEmbedded { stop_calls: self.stop_calls.clone() }))
    }
}

/// Fake of the etcd snapshot-restore primitive.
///
/// Checks the spooled database file, materialises a data directory, and
/// seeds the [`FakeEtcd`] with the state the base snapshot represents,
/// which is what the transient server would boot from.
pub struct FakeSnapshotRestore {
    etcd: FakeEtcd,
    seed: Mutex<Vec<(Vec<u8>, Vec<u8>, i64)>>,
    base_revision: Mutex<Option<i64>>,
    expected_db_bytes: Mutex<Option<Vec<u8>>>,
    restore_calls: Arc<AtomicUsize>,
    fail: Mutex<bool>,
}

impl FakeSnapshotRestore {
    /// Creates the fake primitive over the given fake server.
    pub fn new(etcd: FakeEtcd) -> Self {
        Self {
            etcd,
            seed: Mutex::new(Vec::new()),
            base_revision: Mutex::new(None),
            expected_db_bytes: Mutex::new(None),
            restore_calls: Arc::new(AtomicUsize::new(0)),
            fail: Mutex::new(false),
        }
    }

    /// Declares one key the base snapshot contains.
    pub fn seed_base(&self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>, mod_revision: i64) {
        self.seed.lock().push((key.into(), value.into(), mod_revision));
    }

    /// Overrides the revision the restored store reports, independent of
    /// the seeded keys. Models the base snapshot whose recorded
    /// last-revision lags the store's actual latest revision.
    pub fn set_base_revision(&self, revision: i64) {
        *self.base_revision.lock() = Some(revision);
    }

    /// Requires the spooled database file to contain exactly these bytes.
    pub fn set_expected_db_bytes(&self, bytes: Vec<u8>) {
        *self.expected_db_bytes.lock() = Some(bytes);
    }

    /// Makes restore calls fail until reset.
    pub fn set_fail(&self, fail: bool) {
        *self.fail.lock() = fail;
    }

    /// How many times the primitive was invoked.
    pub fn restore_calls(&self) -> usize {
        self.restore_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SnapshotRestore for FakeSnapshotRestore {
    async fn restore_to_data_dir(&self, params: DbRestoreParams<'_>) -> Result<(), EtcdError> {
        if *self.fail.lock() {
            return Err(EtcdError::Restore { message: "injected restore failure".to_string() });
        }

        let db_bytes = std::fs::read(params.snapshot_path)
            .map_err(|e| EtcdError::Restore { message: format!("unreadable db file: {e}") })?;
        if let Some(expected) = self.expected_db_bytes.lock().as_ref() {
            if &db_bytes != expected {
                return Err(EtcdError::Restore {
                    message: "db file does not match the expected base contents".to_string(),
                });
            }
        }

        let snap_dir = params.output_data_dir.join("member").join("snap");
        std::fs::create_dir_all(&snap_dir)
            .map_err(|e| EtcdError::Restore { message: format!("cannot create data dir: {e}") })?;
        std::fs::write(snap_dir.join("db"), &db_bytes)
            .map_err(|e| EtcdError::Restore { message: format!("cannot write data dir: {e}") })?;

        let mut max_revision = 0;
        for (key, value, mod_revision) in self.seed.lock().iter() {
            self.etcd.seed(key.clone(), value.clone(), *mod_revision);
            max_revision = max_revision.max(*mod_revision);
        }
        if let Some(revision) = *self.base_revision.lock() {
            self.etcd.set_revision(revision);
        } else {
            self.etcd.set_revision(max_revision);
        }

        self.restore_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Member control recording its invocations against the cluster client.
pub struct FakeMemberControl {
    new_peer_urls: Vec<String>,
    calls: Arc<AtomicUsize>,
    fail: Mutex<bool>,
}

impl FakeMemberControl {
    /// Creates a member control that rewrites the first member's peer URLs.
    pub fn new(new_peer_urls: Vec<String>) -> Self {
        Self { new_peer_urls, calls: Arc::new(AtomicUsize::new(0)), fail: Mutex::new(false) }
    }

    /// Makes updates fail until reset.
    pub fn set_fail(&self, fail: bool) {
        *self.fail.lock() = fail;
    }

    /// How many times the update ran.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MemberControl for FakeMemberControl {
    async fn update_member_peer_url(&self, cluster: &dyn ClusterClient) -> Result<(), MemberError> {
        if *self.fail.lock() {
            return Err(MemberError::Update { message: "injected member failure".to_string() });
        }
        let members = cluster
            .member_list()
            .await
            .map_err(|e| MemberError::Update { message: e.to_string() })?;
        let first = members
            .first()
            .ok_or_else(|| MemberError::Update { message: "empty member list".to_string() })?;
        cluster
            .member_update(first.id, self.new_peer_urls.clone())
            .await
            .map_err(|e| MemberError::Update { message: e.to_string() })?;
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
