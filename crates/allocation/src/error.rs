//! Allocation errors

use cluster_core::ShardId;

/// Malformed input to the allocation service
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AllocationError {
    #[error("{shard}: shard routing has no allocation id")]
    MissingAllocationId { shard: ShardId },

    #[error("{shard}: shard routing is not assigned to a node")]
    NotAssigned { shard: ShardId },

    #[error("{shard}: shard id out of range, index has {number_of_shards} shards")]
    ShardOutOfRange { shard: ShardId, number_of_shards: u32 },
}
