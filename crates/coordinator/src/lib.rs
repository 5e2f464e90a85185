//! Coordinator - master-side shard state coordination
//!
//! Carries shard started/failed reports from data nodes to the elected
//! master and turns them into committed cluster states.
//!
//! # Features
//! - Cluster service with prioritized, batched master task queues
//! - Cluster state observer for event-driven waits on master changes
//! - Shard state action: resending client, master handlers and executors
//! - Routing service and persistent cluster settings updates
//! - In-process transport and multi-node cluster for tests and the CLI
//!
//! # Usage Example
//! ```ignore
//! use coordinator::{Config, LocalCluster};
//!
//! let cluster = LocalCluster::new(&Config::from_file("cluster.yaml")?)?;
//! cluster.start();
//! cluster.reroute("initial").await?;
//! cluster.start_initializing_shards().await?;
//! ```

pub mod action;
pub mod cluster;
pub mod config;
pub mod error;
pub mod local;
pub mod node;
pub mod routing_service;
pub mod transport;

// Re-export commonly used types
pub use action::{
    ClusterSettingsAction, ShardRoutingEntry, ShardStateAction, ShardStateListener, SHARD_FAILED_ACTION_NAME,
    SHARD_STARTED_ACTION_NAME,
};
pub use cluster::{
    master_changed, BatchResult, ClusterService, ClusterStateObserver, ClusterStatePublisher,
    ClusterStateTaskExecutor, MasterTaskQueue, Priority, TaskResult,
};
pub use config::{Config, ConfigError};
pub use error::ShardStateError;
pub use local::LocalCluster;
pub use node::Node;
pub use routing_service::RoutingService;
pub use transport::{LocalTransportHub, RequestHandler, Transport, TransportService};
