//! Balanced shards allocator
//!
//! Places unassigned copies (primaries first) on the node with the lowest
//! weight that the decider chain accepts, and relocates started copies
//! whose node no longer satisfies `can_remain`.
//!
//! The weight of a node for a shard of index `i` is
//! `theta0 * (shards(node) - avg_shards) + theta1 * (shards(node, i) - avg_shards(i))`
//! where the thetas are the normalized shard and index balance factors.

use std::sync::Arc;

use cluster_core::{ClusterSettings, NodeId, Settings, ShardRouting};
use parking_lot::RwLock;
use tracing::{debug, info, trace, warn};

use crate::decider::AllocationDeciders;
use crate::decision::DecisionType;
use crate::routing_allocation::RoutingAllocation;
use crate::routing_nodes::RoutingNode;

pub const INDEX_BALANCE_FACTOR_SETTING: &str = "cluster.routing.allocation.balance.index";
pub const SHARD_BALANCE_FACTOR_SETTING: &str = "cluster.routing.allocation.balance.shard";
pub const DEFAULT_INDEX_BALANCE_FACTOR: f32 = 0.55;
pub const DEFAULT_SHARD_BALANCE_FACTOR: f32 = 0.45;

/// Node weight for a given index
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WeightFunction {
    index_balance: f32,
    shard_balance: f32,
    theta0: f32,
    theta1: f32,
}

impl WeightFunction {
    /// Returns `None` when the factors do not sum to a positive value
    pub fn new(index_balance: f32, shard_balance: f32) -> Option<Self> {
        let sum = index_balance + shard_balance;
        if sum <= 0.0 || !sum.is_finite() {
            return None;
        }
        Some(Self {
            index_balance,
            shard_balance,
            theta0: shard_balance / sum,
            theta1: index_balance / sum,
        })
    }

    fn from_settings(settings: &Settings) -> Self {
        let index = settings
            .get_as(INDEX_BALANCE_FACTOR_SETTING, DEFAULT_INDEX_BALANCE_FACTOR)
            .unwrap_or(DEFAULT_INDEX_BALANCE_FACTOR);
        let shard = settings
            .get_as(SHARD_BALANCE_FACTOR_SETTING, DEFAULT_SHARD_BALANCE_FACTOR)
            .unwrap_or(DEFAULT_SHARD_BALANCE_FACTOR);
        match Self::new(index, shard) {
            Some(weights) => weights,
            None => {
                warn!(
                    "Balance factors must sum to a positive value, got index [{}] shard [{}]; using defaults",
                    index, shard
                );
                Self::default()
            }
        }
    }

    pub fn index_balance(&self) -> f32 {
        self.index_balance
    }

    pub fn shard_balance(&self) -> f32 {
        self.shard_balance
    }

    pub fn weight(&self, node_shards: f32, avg_shards: f32, node_index_shards: f32, avg_index_shards: f32) -> f32 {
        self.theta0 * (node_shards - avg_shards) + self.theta1 * (node_index_shards - avg_index_shards)
    }
}

impl Default for WeightFunction {
    fn default() -> Self {
        let sum = DEFAULT_INDEX_BALANCE_FACTOR + DEFAULT_SHARD_BALANCE_FACTOR;
        Self {
            index_balance: DEFAULT_INDEX_BALANCE_FACTOR,
            shard_balance: DEFAULT_SHARD_BALANCE_FACTOR,
            theta0: DEFAULT_SHARD_BALANCE_FACTOR / sum,
            theta1: DEFAULT_INDEX_BALANCE_FACTOR / sum,
        }
    }
}

/// Outcome of searching a node for one copy
struct Placement {
    target: Option<NodeId>,
    throttled: bool,
    rejections: Vec<String>,
}

/// Balanced shards allocator
pub struct BalancedShardsAllocator {
    weights: Arc<RwLock<WeightFunction>>,
}

impl BalancedShardsAllocator {
    pub fn new(settings: &Settings, cluster_settings: &ClusterSettings) -> Self {
        let weights = Arc::new(RwLock::new(WeightFunction::from_settings(settings)));
        let target = weights.clone();
        cluster_settings.add_settings_update_consumer(&["cluster.routing.allocation.balance."], move |snapshot| {
            let next = WeightFunction::from_settings(snapshot);
            info!(
                "Updated balance factors: index [{}], shard [{}]",
                next.index_balance, next.shard_balance
            );
            *target.write() = next;
        });
        Self { weights }
    }

    pub fn weight_function(&self) -> WeightFunction {
        *self.weights.read()
    }

    /// Run one allocation round: moves first, then unassigned copies
    pub fn allocate(&self, allocation: &mut RoutingAllocation<'_>) {
        if allocation.routing_nodes().routing_nodes().next().is_none() {
            debug!("No data nodes available, skipping allocation");
            return;
        }
        let weights = self.weight_function();
        self.move_shards(allocation, &weights);
        self.allocate_unassigned(allocation, &weights);
    }

    fn move_shards(&self, allocation: &mut RoutingAllocation<'_>, weights: &WeightFunction) {
        let deciders = allocation.deciders().clone();

        let mut to_move = Vec::new();
        for node in allocation.routing_nodes().routing_nodes() {
            for shard in node.shards().iter().filter(|s| s.started()) {
                let decision = deciders.can_remain(shard, &node, allocation);
                if decision.is_no() {
                    to_move.push((shard.clone(), decision));
                }
            }
        }

        for (shard, remain) in to_move {
            let placement = self.find_target(allocation, &deciders, weights, &shard, shard.current_node.as_deref());
            match placement.target {
                Some(target) => {
                    let relocation = allocation.routing_nodes_mut().relocate(&shard, &target);
                    allocation.mark_changed();
                    info!("Moving {} to node [{}], it can not remain: {}", shard, target, remain);
                    allocation.add_explanation(format!("move {} -> {}", shard, relocation));
                }
                None => {
                    debug!(
                        "{} can not remain on its node but no other node accepts it (throttled: {})",
                        shard, placement.throttled
                    );
                    allocation.add_explanation(format!(
                        "{} can not remain {}, no target: {}",
                        shard,
                        remain,
                        placement.rejections.join("; ")
                    ));
                }
            }
        }
    }

    fn allocate_unassigned(&self, allocation: &mut RoutingAllocation<'_>, weights: &WeightFunction) {
        let deciders = allocation.deciders().clone();
        let mut pending = allocation.routing_nodes_mut().take_unassigned();
        pending.sort_by(|a, b| b.primary.cmp(&a.primary).then_with(|| a.shard_id.cmp(&b.shard_id)));

        let mut ignored = Vec::new();
        for shard in pending {
            let placement = self.find_target(allocation, &deciders, weights, &shard, None);
            match placement.target {
                Some(node_id) => {
                    let initialized = allocation.routing_nodes_mut().initialize(&shard, &node_id);
                    allocation.mark_changed();
                    debug!("Assigned {} to node [{}]", initialized, node_id);
                    allocation.add_explanation(format!("allocate {}", initialized));
                }
                None => {
                    trace!("No node for {} (throttled: {})", shard, placement.throttled);
                    allocation.add_explanation(format!(
                        "{} stays unassigned{}: {}",
                        shard,
                        if placement.throttled { " (throttled)" } else { "" },
                        placement.rejections.join("; ")
                    ));
                    ignored.push(shard);
                }
            }
        }

        for shard in ignored {
            allocation.routing_nodes_mut().add_unassigned(shard);
        }
    }

    /// Lowest-weight node accepting `shard`, ties broken by node id
    fn find_target(
        &self,
        allocation: &RoutingAllocation<'_>,
        deciders: &AllocationDeciders,
        weights: &WeightFunction,
        shard: &ShardRouting,
        exclude: Option<&str>,
    ) -> Placement {
        let mut candidates: Vec<(f32, RoutingNode<'_>)> = allocation
            .routing_nodes()
            .routing_nodes()
            .filter(|node| Some(node.node_id()) != exclude)
            .map(|node| (node_weight(allocation, weights, &node, &shard.shard_id.index), node))
            .collect();
        candidates.sort_by(|a, b| a.0.total_cmp(&b.0).then_with(|| a.1.node_id().cmp(b.1.node_id())));

        let mut placement = Placement {
            target: None,
            throttled: false,
            rejections: Vec::new(),
        };
        for (weight, node) in candidates {
            let decision = deciders.can_allocate(shard, &node, allocation);
            match decision.kind() {
                DecisionType::Yes => {
                    trace!("Node [{}] accepts {} with weight {}", node.node_id(), shard, weight);
                    placement.target = Some(node.node_id().to_string());
                    return placement;
                }
                DecisionType::Throttle => placement.throttled = true,
                DecisionType::No => {}
            }
            if allocation.debug_decision() {
                placement
                    .rejections
                    .push(format!("node [{}] {}", node.node_id(), decision));
            }
        }
        placement
    }
}

fn node_weight(allocation: &RoutingAllocation<'_>, weights: &WeightFunction, node: &RoutingNode<'_>, index: &str) -> f32 {
    let num_nodes = allocation.routing_nodes().node_ids().len().max(1) as f32;
    let metadata = allocation.metadata();
    let total_copies: u32 = metadata.indices.values().map(|i| i.total_copies()).sum();
    let index_copies = metadata.index(index).map(|i| i.total_copies()).unwrap_or(0);

    // weight as if the copy were already added
    weights.weight(
        node.size() as f32 + 1.0,
        total_copies as f32 / num_nodes,
        node.num_shards_of_index(index) as f32 + 1.0,
        index_copies as f32 / num_nodes,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decider::test_support::*;
    use crate::routing_allocation::DebugMode;
    use cluster_core::IndexMetadata;

    fn allocate(state: &cluster_core::ClusterState, cluster_settings: &ClusterSettings) -> cluster_core::RoutingTable {
        let settings = Settings::empty();
        let deciders = Arc::new(AllocationDeciders::with_defaults(&settings, cluster_settings));
        let allocator = BalancedShardsAllocator::new(&settings, cluster_settings);
        let mut allocation = RoutingAllocation::new(deciders, state, DebugMode::Off);
        allocator.allocate(&mut allocation);
        assert!(allocation.changed());
        allocation.routing_nodes().to_routing_table(state.routing_table.version + 1)
    }

    #[test]
    fn test_weight_function_normalizes() {
        let weights = WeightFunction::new(1.0, 1.0).unwrap();
        assert_eq!(weights.weight(3.0, 1.0, 1.0, 1.0), 1.0);
        assert!(WeightFunction::new(0.0, 0.0).is_none());
        assert_eq!(WeightFunction::default().index_balance(), DEFAULT_INDEX_BALANCE_FACTOR);
    }

    #[test]
    fn test_primaries_spread_across_nodes() {
        let cluster_settings = ClusterSettings::default();
        let state = make_state(
            vec![make_node("n1"), make_node("n2"), make_node("n3")],
            vec![IndexMetadata::new("idx", 3, 1)],
        );
        let table = allocate(&state, &cluster_settings);

        let initializing = table.shards_with_state(cluster_core::ShardRoutingState::Initializing);
        assert_eq!(initializing.len(), 3);
        assert!(initializing.iter().all(|s| s.primary));
        let nodes: std::collections::BTreeSet<_> = initializing
            .iter()
            .filter_map(|s| s.current_node.clone())
            .collect();
        assert_eq!(nodes.len(), 3);
        // replicas wait for their primaries
        assert_eq!(table.unassigned_count(), 3);
        assert!(table.validate(&state.metadata).is_empty());
    }

    #[test]
    fn test_balance_factors_follow_settings() {
        let cluster_settings = ClusterSettings::default();
        let allocator = BalancedShardsAllocator::new(&Settings::empty(), &cluster_settings);
        cluster_settings.apply_settings(
            Settings::builder()
                .put(INDEX_BALANCE_FACTOR_SETTING, 0.2)
                .put(SHARD_BALANCE_FACTOR_SETTING, 0.8)
                .build(),
        );
        assert_eq!(allocator.weight_function().shard_balance(), 0.8);

        cluster_settings.apply_settings(
            Settings::builder()
                .put(INDEX_BALANCE_FACTOR_SETTING, 0.0)
                .put(SHARD_BALANCE_FACTOR_SETTING, 0.0)
                .build(),
        );
        assert_eq!(allocator.weight_function(), WeightFunction::default());
    }
}
