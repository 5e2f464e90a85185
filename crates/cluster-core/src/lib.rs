//! Core cluster state model
//!
//! Provides the shared, immutable building blocks of the cluster:
//! - Discovery nodes and the elected master
//! - Shard routing entries and their lifecycle
//! - Routing table and index metadata
//! - Flat settings and the live settings notifier
//! - Binary stream codec used on the wire

pub mod metadata;
pub mod node;
pub mod routing;
pub mod settings;
pub mod shard;
pub mod state;
pub mod stream;

// Re-export commonly used types
pub use metadata::{IndexMetadata, Metadata, INDEX_UUID_NA_VALUE};
pub use node::{DiscoveryNode, DiscoveryNodes, NodeId, NodeRole};
pub use routing::{IndexRoutingTable, IndexShardRoutingTable, RoutingTable};
pub use settings::{ClusterSettings, Settings, SettingsError};
pub use shard::{ShardId, ShardRouting, ShardRoutingState, UnassignedInfo, UnassignedReason};
pub use state::{ClusterState, ClusterStateBuilder, ClusterStats};
pub use stream::{StreamInput, StreamOutput, WireError, Writeable};
