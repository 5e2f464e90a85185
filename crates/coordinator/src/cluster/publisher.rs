//! Cluster state publication

use std::sync::Arc;

use async_trait::async_trait;
use cluster_core::ClusterState;

use crate::error::ShardStateError;

/// Commits a new state to the cluster
#[async_trait]
pub trait ClusterStatePublisher: Send + Sync {
    /// Returns `FailedToCommit` when the state could not be committed;
    /// the master then fails every task of the batch
    async fn publish(&self, state: Arc<ClusterState>) -> Result<(), ShardStateError>;
}
