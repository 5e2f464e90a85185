//! Cluster actions

pub mod settings;
pub mod shard_state;

pub use settings::{ClusterSettingsAction, SettingsUpdateExecutor};
pub use shard_state::{
    ShardFailedClusterStateTaskExecutor, ShardRoutingEntry, ShardStartedClusterStateTaskExecutor, ShardStateAction,
    ShardStateListener, SHARD_FAILED_ACTION_NAME, SHARD_STARTED_ACTION_NAME,
};
