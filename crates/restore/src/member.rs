//! Member-control seam.
//!
//! After replay, the restored member's advertised peer URL must be rewritten
//! in the transient cluster so that the data directory registers the correct
//! URL when it rejoins the real cluster. The member-control subsystem owns
//! that policy; the engine only hands it a cluster client at the right
//! moment.

use async_trait::async_trait;
use snafu::Snafu;

use crate::client::ClusterClient;

/// Errors raised by member control.
#[derive(Debug, Snafu)]
pub enum MemberError {
    /// The peer-URL update did not take effect.
    #[snafu(display("failed to update member peer URL: {message}"))]
    Update {
        /// Description of the failure.
        message: String,
    },
}

/// Rewrites this member's advertised peer URL in the transient cluster.
#[async_trait]
pub trait MemberControl: Send + Sync {
    /// Updates the member's peer URL through `cluster`.
    async fn update_member_peer_url(&self, cluster: &dyn ClusterClient) -> Result<(), MemberError>;
}
