//! Allocation deciders
//!
//! Each decider answers two questions for a (shard copy, node) pair: may
//! the copy be allocated there, and may an already placed copy remain
//! there. `AllocationDeciders` runs them in registration order and
//! combines the answers.

mod filter;
mod max_retry;
mod replica_after_primary_active;
mod same_shard;
mod throttling;

pub use filter::{DiscoveryNodeFilters, FilterAllocationDecider, FilterSet, OpType};
pub use max_retry::MaxRetryAllocationDecider;
pub use replica_after_primary_active::ReplicaAfterPrimaryActiveAllocationDecider;
pub use same_shard::SameShardAllocationDecider;
pub use throttling::ThrottlingAllocationDecider;

use std::sync::Arc;

use cluster_core::{ClusterSettings, Settings, ShardRouting};
use tracing::trace;

use crate::decision::{Decision, DecisionType};
use crate::routing_allocation::{DebugMode, RoutingAllocation};
use crate::routing_nodes::RoutingNode;

/// A single placement rule
pub trait AllocationDecider: Send + Sync {
    /// Short name used as the decision label
    fn name(&self) -> &'static str;

    /// Whether `shard` may be allocated to `node`
    fn can_allocate(&self, _shard: &ShardRouting, _node: &RoutingNode<'_>, _allocation: &RoutingAllocation<'_>) -> Decision {
        Decision::YES
    }

    /// Whether `shard`, already on `node`, may stay there
    fn can_remain(&self, _shard: &ShardRouting, _node: &RoutingNode<'_>, _allocation: &RoutingAllocation<'_>) -> Decision {
        Decision::YES
    }
}

/// Ordered decider chain
pub struct AllocationDeciders {
    deciders: Vec<Arc<dyn AllocationDecider>>,
}

impl AllocationDeciders {
    pub fn new(deciders: Vec<Arc<dyn AllocationDecider>>) -> Self {
        Self { deciders }
    }

    /// The default chain, wired to live cluster settings
    pub fn with_defaults(settings: &Settings, cluster_settings: &ClusterSettings) -> Self {
        Self::new(vec![
            Arc::new(SameShardAllocationDecider),
            Arc::new(FilterAllocationDecider::new(settings, cluster_settings)),
            Arc::new(ReplicaAfterPrimaryActiveAllocationDecider),
            Arc::new(MaxRetryAllocationDecider),
            Arc::new(ThrottlingAllocationDecider::new(settings, cluster_settings)),
        ])
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.deciders.iter().map(|d| d.name()).collect()
    }

    pub fn can_allocate(&self, shard: &ShardRouting, node: &RoutingNode<'_>, allocation: &RoutingAllocation<'_>) -> Decision {
        self.evaluate(allocation, |decider| {
            let decision = decider.can_allocate(shard, node, allocation);
            if decision.is_no() {
                trace!(
                    "Can not allocate {} on node [{}] due to [{}]",
                    shard,
                    node.node_id(),
                    decider.name()
                );
            }
            decision
        })
    }

    pub fn can_remain(&self, shard: &ShardRouting, node: &RoutingNode<'_>, allocation: &RoutingAllocation<'_>) -> Decision {
        self.evaluate(allocation, |decider| {
            let decision = decider.can_remain(shard, node, allocation);
            if decision.is_no() {
                trace!(
                    "Shard {} can not remain on node [{}] due to [{}]",
                    shard,
                    node.node_id(),
                    decider.name()
                );
            }
            decision
        })
    }

    fn evaluate<F>(&self, allocation: &RoutingAllocation<'_>, mut decide: F) -> Decision
    where
        F: FnMut(&dyn AllocationDecider) -> Decision,
    {
        let debug = allocation.debug_mode();
        let mut decisions = Vec::with_capacity(self.deciders.len());
        for decider in &self.deciders {
            let decision = decide(decider.as_ref());
            let kind = decision.kind();
            if kind == DecisionType::No && debug == DebugMode::Off {
                return decision;
            }
            if debug == DebugMode::ExcludeYesDecisions && kind == DecisionType::Yes {
                continue;
            }
            decisions.push(decision);
        }
        Decision::Multi(decisions)
    }
}
