//! Replicas wait for an active primary

use cluster_core::ShardRouting;

use super::AllocationDecider;
use crate::decision::{Decision, DecisionType};
use crate::routing_allocation::RoutingAllocation;
use crate::routing_nodes::RoutingNode;

const NAME: &str = "replica_after_primary_active";

/// NO for a replica until its primary is started or relocating
pub struct ReplicaAfterPrimaryActiveAllocationDecider;

impl AllocationDecider for ReplicaAfterPrimaryActiveAllocationDecider {
    fn name(&self) -> &'static str {
        NAME
    }

    fn can_allocate(&self, shard: &ShardRouting, _node: &RoutingNode<'_>, allocation: &RoutingAllocation<'_>) -> Decision {
        if shard.primary {
            return Decision::single(DecisionType::Yes, NAME, "shard is primary and can be allocated");
        }
        match allocation.routing_nodes().active_primary(&shard.shard_id) {
            Some(_) => Decision::single(DecisionType::Yes, NAME, "primary shard for this replica is already active"),
            None => Decision::single(DecisionType::No, NAME, "primary shard for this replica is not yet active"),
        }
    }
}
