//! Never place two copies of a shard on one node

use cluster_core::ShardRouting;

use super::AllocationDecider;
use crate::decision::{Decision, DecisionType};
use crate::routing_allocation::RoutingAllocation;
use crate::routing_nodes::RoutingNode;

const NAME: &str = "same_shard";

/// NO when the node already holds a copy of the shard
pub struct SameShardAllocationDecider;

impl AllocationDecider for SameShardAllocationDecider {
    fn name(&self) -> &'static str {
        NAME
    }

    fn can_allocate(&self, shard: &ShardRouting, node: &RoutingNode<'_>, _allocation: &RoutingAllocation<'_>) -> Decision {
        match node.copy_of(&shard.shard_id) {
            Some(existing) if !existing.is_same_allocation(shard) => Decision::single(
                DecisionType::No,
                NAME,
                format!(
                    "a copy of this shard is already allocated to this node [{}]",
                    existing
                ),
            ),
            _ => Decision::single(
                DecisionType::Yes,
                NAME,
                "this node does not hold a copy of this shard",
            ),
        }
    }
}
