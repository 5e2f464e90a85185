//! Allocation service
//!
//! Turns batches of started and failed shard reports into new routing
//! tables, and reroutes unassigned copies. The input state is never
//! modified; callers install the result with `RoutingResultExt`.

use std::sync::Arc;

use cluster_core::{
    ClusterSettings, ClusterState, ClusterStateBuilder, RoutingTable, Settings, ShardRouting, UnassignedInfo,
    UnassignedReason,
};
use tracing::{debug, info, trace};

use crate::allocator::BalancedShardsAllocator;
use crate::decider::AllocationDeciders;
use crate::error::AllocationError;
use crate::routing_allocation::{DebugMode, RoutingAllocation};

/// A copy reported as failed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedShard {
    pub routing: ShardRouting,
    pub message: String,
    pub failure: Option<String>,
}

impl FailedShard {
    pub fn new(routing: ShardRouting, message: impl Into<String>, failure: Option<String>) -> Self {
        Self {
            routing,
            message: message.into(),
            failure,
        }
    }
}

/// Result of an allocation pass
#[derive(Debug, Clone)]
pub struct RoutingResult {
    changed: bool,
    routing_table: Arc<RoutingTable>,
    explanations: Vec<String>,
}

impl RoutingResult {
    pub fn changed(&self) -> bool {
        self.changed
    }

    pub fn routing_table(&self) -> &Arc<RoutingTable> {
        &self.routing_table
    }

    /// Allocator trace, filled only in debug mode
    pub fn explanations(&self) -> &[String] {
        &self.explanations
    }
}

/// Install an allocation result into a state under construction
pub trait RoutingResultExt {
    fn routing_result(self, result: &RoutingResult) -> Self;
}

impl RoutingResultExt for ClusterStateBuilder {
    fn routing_result(self, result: &RoutingResult) -> Self {
        self.routing_table(result.routing_table.clone())
    }
}

/// Allocation service
pub struct AllocationService {
    deciders: Arc<AllocationDeciders>,
    allocator: BalancedShardsAllocator,
    debug: DebugMode,
}

impl AllocationService {
    pub fn new(deciders: Arc<AllocationDeciders>, allocator: BalancedShardsAllocator) -> Self {
        Self {
            deciders,
            allocator,
            debug: DebugMode::Off,
        }
    }

    /// Default deciders and allocator, wired to live cluster settings
    pub fn with_defaults(settings: &Settings, cluster_settings: &ClusterSettings) -> Self {
        Self::new(
            Arc::new(AllocationDeciders::with_defaults(settings, cluster_settings)),
            BalancedShardsAllocator::new(settings, cluster_settings),
        )
    }

    pub fn with_debug_mode(mut self, debug: DebugMode) -> Self {
        self.debug = debug;
        self
    }

    pub fn deciders(&self) -> &Arc<AllocationDeciders> {
        &self.deciders
    }

    /// Mark initializing copies as started.
    ///
    /// Unknown allocation ids and copies that are already active are
    /// ignored, so applying the same batch twice is a no-op the second
    /// time. A started relocation target drops its source.
    pub fn apply_started_shards(
        &self,
        state: &ClusterState,
        started: &[ShardRouting],
        with_reroute: bool,
    ) -> Result<RoutingResult, AllocationError> {
        let mut allocation = RoutingAllocation::new(self.deciders.clone(), state, self.debug);

        for routing in started {
            let (node_id, allocation_id) = validate(state, routing)?;
            let Some(existing) = allocation
                .routing_nodes()
                .get(node_id, &routing.shard_id, allocation_id)
                .cloned()
            else {
                debug!("{} ignoring shard started, unknown allocation id [{}]", routing.shard_id, allocation_id);
                continue;
            };
            if !existing.initializing() {
                trace!("{} ignoring shard started, copy is already {}", routing.shard_id, existing.state);
                continue;
            }

            let routing_nodes = allocation.routing_nodes_mut();
            routing_nodes.replace(&existing, existing.move_to_started());
            if existing.is_relocation_target() {
                if let Some(source) = routing_nodes.relocation_source_of(&existing) {
                    routing_nodes.remove(&source);
                    debug!("{} relocation completed, removed source on [{}]", existing.shard_id, source.current_node.as_deref().unwrap_or_default());
                }
            }
            allocation.mark_changed();
            debug!("{} marked shard as started on node [{}]", existing.shard_id, node_id);
        }

        if with_reroute {
            self.reroute_in(&mut allocation);
        }
        Ok(build_result(state, allocation))
    }

    /// Move failed copies back to unassigned.
    ///
    /// Entries whose assignment no longer exists are ignored. Does not
    /// allocate the resulting unassigned copies; callers reroute.
    pub fn apply_failed_shards(
        &self,
        state: &ClusterState,
        failed: &[FailedShard],
    ) -> Result<RoutingResult, AllocationError> {
        let mut allocation = RoutingAllocation::new(self.deciders.clone(), state, self.debug);

        for failed_shard in failed {
            let routing = &failed_shard.routing;
            let (node_id, allocation_id) = validate(state, routing)?;
            let Some(existing) = allocation
                .routing_nodes()
                .get(node_id, &routing.shard_id, allocation_id)
                .cloned()
            else {
                debug!(
                    "{} ignoring shard failure, unknown allocation id [{}] on node [{}]",
                    routing.shard_id, allocation_id, node_id
                );
                continue;
            };
            fail_shard(
                &mut allocation,
                &existing,
                UnassignedReason::AllocationFailed,
                failed_shard.message.clone(),
                failed_shard.failure.clone(),
            );
        }

        Ok(build_result(state, allocation))
    }

    /// Disassociate copies on departed nodes, move copies that may not
    /// remain, and allocate unassigned copies
    pub fn reroute(&self, state: &ClusterState, reason: &str) -> RoutingResult {
        let mut allocation = RoutingAllocation::new(self.deciders.clone(), state, self.debug);
        self.reroute_in(&mut allocation);
        let result = build_result(state, allocation);
        if result.changed {
            info!(
                "Reroute [{}] produced routing table version {}",
                reason, result.routing_table.version
            );
        } else {
            trace!("Reroute [{}] made no changes", reason);
        }
        result
    }

    fn reroute_in(&self, allocation: &mut RoutingAllocation<'_>) {
        for shard in allocation.routing_nodes().departed() {
            // a relocation peer processed earlier may already have removed it
            if !allocation.routing_nodes().contains(&shard) {
                continue;
            }
            let node_id = shard.current_node.clone().unwrap_or_default();
            fail_shard(
                allocation,
                &shard,
                UnassignedReason::NodeLeft,
                format!("node_left [{}]", node_id),
                None,
            );
        }
        self.allocator.allocate(allocation);
    }
}

fn validate<'r>(state: &ClusterState, routing: &'r ShardRouting) -> Result<(&'r str, &'r str), AllocationError> {
    let shard = routing.shard_id.clone();
    let node_id = routing
        .current_node
        .as_deref()
        .ok_or_else(|| AllocationError::NotAssigned { shard: shard.clone() })?;
    let allocation_id = routing
        .allocation_id
        .as_deref()
        .ok_or_else(|| AllocationError::MissingAllocationId { shard: shard.clone() })?;
    if let Some(index) = state.metadata.index(&shard.index) {
        if shard.id >= index.number_of_shards {
            return Err(AllocationError::ShardOutOfRange {
                shard,
                number_of_shards: index.number_of_shards,
            });
        }
    }
    Ok((node_id, allocation_id))
}

fn fail_shard(
    allocation: &mut RoutingAllocation<'_>,
    existing: &ShardRouting,
    reason: UnassignedReason,
    message: String,
    failure: Option<String>,
) {
    allocation.mark_changed();
    let shard_id = existing.shard_id.clone();

    if existing.is_relocation_target() {
        let routing_nodes = allocation.routing_nodes_mut();
        routing_nodes.remove(existing);
        if let Some(source) = routing_nodes.relocation_source_of(existing) {
            routing_nodes.replace(&source, source.cancel_relocation());
        }
        info!("{} relocation target failed on [{}], relocation cancelled: {}", shard_id, existing.current_node.as_deref().unwrap_or_default(), message);
        return;
    }

    {
        let routing_nodes = allocation.routing_nodes_mut();
        if existing.relocating() {
            if let Some(target) = routing_nodes.relocation_target_of(existing) {
                routing_nodes.remove(&target);
            }
        }
        routing_nodes.remove(existing);
    }

    let failed_allocations = match reason {
        UnassignedReason::AllocationFailed => existing.failed_allocations() + 1,
        _ => existing.failed_allocations(),
    };
    let info = UnassignedInfo::new(reason, Some(message)).with_failure(failure, failed_allocations);
    info!("{} failed on node [{}]: {}", existing, existing.current_node.as_deref().unwrap_or_default(), info);
    let mut unassigned = existing.move_to_unassigned(info);

    if existing.primary {
        let recovering: Vec<ShardRouting> = allocation
            .routing_nodes()
            .copies(&shard_id)
            .into_iter()
            .filter(|s| !s.primary && s.initializing())
            .cloned()
            .collect();
        for replica in recovering {
            fail_shard(
                allocation,
                &replica,
                UnassignedReason::PrimaryFailed,
                format!("primary failed while replica initializing on [{}]", replica.current_node.as_deref().unwrap_or_default()),
                None,
            );
        }

        let promoted = allocation.routing_nodes().active_replica(&shard_id).cloned();
        if let Some(replica) = promoted {
            allocation.routing_nodes_mut().replace(&replica, replica.move_to_primary());
            unassigned = unassigned.move_from_primary();
            info!("{} promoted replica on [{}] to primary", shard_id, replica.current_node.as_deref().unwrap_or_default());
        }
    }

    allocation.routing_nodes_mut().add_unassigned(unassigned);
}

fn build_result(state: &ClusterState, allocation: RoutingAllocation<'_>) -> RoutingResult {
    let (routing_nodes, changed, explanations) = allocation.into_parts();
    let routing_table = if changed {
        Arc::new(routing_nodes.to_routing_table(state.routing_table.version + 1))
    } else {
        state.routing_table.clone()
    };
    RoutingResult {
        changed,
        routing_table,
        explanations,
    }
}
