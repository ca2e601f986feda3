//! Client seams for the transient etcd.
//!
//! The engine drives the transient etcd exclusively through these traits so
//! that replay logic stays independent of the concrete client library and
//! fully testable against in-memory fakes. Implementations must be safe for
//! concurrent use: the applier and the alarm handler share them on disjoint
//! operations.

use std::{future::Future, time::Duration};

use async_trait::async_trait;
use snafu::Snafu;

/// Timeout for connection-weight requests (gets, status).
pub const ETCD_CONNECTION_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout for a compaction request.
pub const ETCD_COMPACT_TIMEOUT: Duration = Duration::from_secs(2 * 60);

/// Timeout for a defragmentation request.
pub const ETCD_DEFRAG_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Errors raised by the etcd clients.
#[derive(Debug, Snafu)]
pub enum ClientError {
    /// The request reached etcd and was rejected.
    #[snafu(display("etcd request failed: {message}"))]
    Request {
        /// The server-side failure.
        message: String,
    },

    /// The request did not complete within its deadline.
    #[snafu(display("etcd request timed out after {timeout:?}"))]
    Timeout {
        /// The deadline that elapsed.
        timeout: Duration,
    },

    /// No connection to the transient etcd could be established.
    #[snafu(display("connection to etcd failed: {message}"))]
    Connection {
        /// Description of the connection failure.
        message: String,
    },
}

/// One operation inside a replay transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxnOp {
    /// Write `key` with `value`.
    Put {
        /// Key to write.
        key: Vec<u8>,
        /// Value to write.
        value: Vec<u8>,
    },
    /// Remove `key`.
    Delete {
        /// Key to remove.
        key: Vec<u8>,
    },
}

/// Backend status of one etcd endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DbStatus {
    /// Size of the backend database file, free pages included.
    pub db_size: i64,
    /// Size of the backend database logically in use.
    pub db_size_in_use: i64,
    /// Current store revision.
    pub revision: i64,
}

/// Key-value operations against the transient etcd.
#[async_trait]
pub trait KvClient: Send + Sync {
    /// The store's latest revision, as observed by a last-revision range
    /// over the whole keyspace.
    async fn latest_revision(&self) -> Result<i64, ClientError>;

    /// The revision reported in any response header (a cheap single-key
    /// get).
    async fn current_revision(&self) -> Result<i64, ClientError>;

    /// Commits `ops` as one transaction.
    async fn commit_txn(&self, ops: Vec<TxnOp>) -> Result<(), ClientError>;

    /// Compacts history below `revision`, requesting physical compaction.
    async fn compact(&self, revision: i64) -> Result<(), ClientError>;
}

/// Maintenance operations against the transient etcd.
#[async_trait]
pub trait MaintenanceClient: Send + Sync {
    /// Queries backend status of `endpoint`.
    async fn status(&self, endpoint: &str) -> Result<DbStatus, ClientError>;

    /// Defragments the backend of `endpoint`, reclaiming free pages.
    async fn defragment(&self, endpoint: &str) -> Result<(), ClientError>;
}

/// One member of the transient cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    /// Member ID.
    pub id: u64,
    /// Member name.
    pub name: String,
    /// Advertised peer URLs.
    pub peer_urls: Vec<String>,
}

/// Cluster-membership operations against the transient etcd.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Lists the members of the transient cluster.
    async fn member_list(&self) -> Result<Vec<Member>, ClientError>;

    /// Replaces the peer URLs of member `member_id`.
    async fn member_update(
        &self,
        member_id: u64,
        peer_urls: Vec<String>,
    ) -> Result<(), ClientError>;
}

/// Builds the clients used during one restore.
pub trait ClientFactory: Send + Sync {
    /// Builds a KV client.
    fn new_kv(&self) -> Result<Box<dyn KvClient>, ClientError>;

    /// Builds a maintenance client.
    fn new_maintenance(&self) -> Result<Box<dyn MaintenanceClient>, ClientError>;

    /// Builds a cluster client.
    fn new_cluster(&self) -> Result<Box<dyn ClusterClient>, ClientError>;
}

/// Runs `fut` under `deadline`, mapping an elapsed deadline onto
/// [`ClientError::Timeout`].
pub(crate) async fn with_timeout<T, F>(deadline: Duration, fut: F) -> Result<T, ClientError>
where
    F: Future<Output = Result<T, ClientError>>,
{
    match tokio::time::timeout(deadline, fut).await {
        Ok(result) => result,
        Err(_) => Err(ClientError::Timeout { timeout: deadline }),
    }
}
