//! Cluster state
//!
//! An immutable, versioned snapshot of nodes, metadata and routing. States
//! are shared by `Arc`; producing a new state always goes through
//! `ClusterState::builder`, which copies the component pointers and
//! replaces only what changed.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::metadata::Metadata;
use crate::node::DiscoveryNodes;
use crate::routing::RoutingTable;
use crate::shard::ShardRoutingState;

/// Cluster state snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterState {
    pub cluster_name: String,
    /// Incremented on every committed change
    pub version: u64,
    /// Unique per state object
    pub state_uuid: String,
    pub nodes: Arc<DiscoveryNodes>,
    pub metadata: Arc<Metadata>,
    pub routing_table: Arc<RoutingTable>,
}

impl ClusterState {
    /// An empty state (version 0, no master)
    pub fn empty(cluster_name: impl Into<String>) -> Self {
        Self {
            cluster_name: cluster_name.into(),
            version: 0,
            state_uuid: uuid::Uuid::new_v4().to_string(),
            nodes: Arc::new(DiscoveryNodes::new()),
            metadata: Arc::new(Metadata::new()),
            routing_table: Arc::new(RoutingTable::new()),
        }
    }

    /// Start building a new state from this one
    pub fn builder(&self) -> ClusterStateBuilder {
        ClusterStateBuilder {
            cluster_name: self.cluster_name.clone(),
            version: self.version,
            nodes: self.nodes.clone(),
            metadata: self.metadata.clone(),
            routing_table: self.routing_table.clone(),
        }
    }

    pub fn unassigned_shard_count(&self) -> usize {
        self.routing_table.unassigned_count()
    }

    /// Whether the two snapshots are the same object version
    pub fn same_state(&self, other: &ClusterState) -> bool {
        self.state_uuid == other.state_uuid
    }

    /// Summary statistics
    pub fn stats(&self) -> ClusterStats {
        let count = |state| self.routing_table.shards_with_state(state).len();
        ClusterStats {
            cluster_name: self.cluster_name.clone(),
            version: self.version,
            master_node: self.nodes.master_node_id().cloned(),
            total_nodes: self.nodes.len(),
            data_nodes: self.nodes.data_nodes().count(),
            indices: self.metadata.indices.len(),
            unassigned_shards: count(ShardRoutingState::Unassigned),
            initializing_shards: count(ShardRoutingState::Initializing),
            started_shards: count(ShardRoutingState::Started),
            relocating_shards: count(ShardRoutingState::Relocating),
        }
    }
}

/// Builder producing a fresh `ClusterState`
#[derive(Debug, Clone)]
pub struct ClusterStateBuilder {
    cluster_name: String,
    version: u64,
    nodes: Arc<DiscoveryNodes>,
    metadata: Arc<Metadata>,
    routing_table: Arc<RoutingTable>,
}

impl ClusterStateBuilder {
    pub fn version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }

    pub fn incr_version(mut self) -> Self {
        self.version += 1;
        self
    }

    pub fn nodes(mut self, nodes: DiscoveryNodes) -> Self {
        self.nodes = Arc::new(nodes);
        self
    }

    pub fn metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = Arc::new(metadata);
        self
    }

    pub fn routing_table(mut self, routing_table: Arc<RoutingTable>) -> Self {
        self.routing_table = routing_table;
        self
    }

    pub fn build(self) -> ClusterState {
        ClusterState {
            cluster_name: self.cluster_name,
            version: self.version,
            state_uuid: uuid::Uuid::new_v4().to_string(),
            nodes: self.nodes,
            metadata: self.metadata,
            routing_table: self.routing_table,
        }
    }
}

/// Cluster statistics
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterStats {
    pub cluster_name: String,
    pub version: u64,
    pub master_node: Option<String>,
    pub total_nodes: usize,
    pub data_nodes: usize,
    pub indices: usize,
    pub unassigned_shards: usize,
    pub initializing_shards: usize,
    pub started_shards: usize,
    pub relocating_shards: usize,
}
