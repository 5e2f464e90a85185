//! Stop retrying copies that keep failing

use cluster_core::ShardRouting;

use super::AllocationDecider;
use crate::decision::{Decision, DecisionType};
use crate::routing_allocation::RoutingAllocation;
use crate::routing_nodes::RoutingNode;

const NAME: &str = "max_retry";

/// Index setting bounding failed allocation attempts per copy
pub const MAX_RETRIES_SETTING: &str = "index.allocation.max_retries";
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// NO once a copy has failed `index.allocation.max_retries` times
pub struct MaxRetryAllocationDecider;

impl AllocationDecider for MaxRetryAllocationDecider {
    fn name(&self) -> &'static str {
        NAME
    }

    fn can_allocate(&self, shard: &ShardRouting, _node: &RoutingNode<'_>, allocation: &RoutingAllocation<'_>) -> Decision {
        let Some(info) = shard.unassigned_info.as_ref() else {
            return Decision::single(DecisionType::Yes, NAME, "shard has no previous failures");
        };

        let max_retries = allocation
            .metadata()
            .index(&shard.shard_id.index)
            .map(|index| {
                index
                    .settings
                    .get_as(MAX_RETRIES_SETTING, DEFAULT_MAX_RETRIES)
                    .unwrap_or(DEFAULT_MAX_RETRIES)
            })
            .unwrap_or(DEFAULT_MAX_RETRIES);

        if info.failed_allocations >= max_retries {
            Decision::single(
                DecisionType::No,
                NAME,
                format!(
                    "shard has exceeded the maximum number of retries [{}] on failed allocation attempts, last failure [{}]",
                    max_retries, info
                ),
            )
        } else {
            Decision::single(
                DecisionType::Yes,
                NAME,
                format!(
                    "shard has failed allocating [{}] times but [{}] retries are allowed",
                    info.failed_allocations, max_retries
                ),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use crate::routing_allocation::DebugMode;
    use crate::AllocationDeciders;
    use cluster_core::{IndexMetadata, Settings, UnassignedInfo, UnassignedReason};
    use std::sync::Arc;

    #[test]
    fn test_blocks_after_max_retries() {
        let index = IndexMetadata::new("idx", 1, 0)
            .with_settings(Settings::builder().put(MAX_RETRIES_SETTING, 2).build());
        let state = make_state(vec![make_node("n1")], vec![index]);
        let deciders = Arc::new(AllocationDeciders::new(Vec::new()));
        let allocation = RoutingAllocation::new(deciders, &state, DebugMode::Off);
        let shard = allocation.routing_nodes().unassigned()[0].clone();
        let node = allocation.routing_nodes().routing_node("n1").unwrap();
        let decider = MaxRetryAllocationDecider;

        assert!(decider.can_allocate(&shard, &node, &allocation).is_yes());

        let failed_once = shard.move_to_unassigned(
            UnassignedInfo::new(UnassignedReason::AllocationFailed, Some("boom".into())).with_failure(None, 1),
        );
        assert!(decider.can_allocate(&failed_once, &node, &allocation).is_yes());

        let failed_twice = shard.move_to_unassigned(
            UnassignedInfo::new(UnassignedReason::AllocationFailed, Some("boom".into())).with_failure(None, 2),
        );
        let decision = decider.can_allocate(&failed_twice, &node, &allocation);
        assert!(decision.is_no());
        assert!(decision.explanation().unwrap().contains("[2]"));
    }
}
