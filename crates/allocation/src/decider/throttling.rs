//! Limit concurrent recoveries per node

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use cluster_core::{ClusterSettings, Settings, ShardRouting};
use tracing::{info, warn};

use super::AllocationDecider;
use crate::decision::{Decision, DecisionType};
use crate::routing_allocation::RoutingAllocation;
use crate::routing_nodes::RoutingNode;

const NAME: &str = "throttling";

pub const CONCURRENT_RECOVERIES_SETTING: &str = "cluster.routing.allocation.node_concurrent_recoveries";
pub const INITIAL_PRIMARIES_RECOVERIES_SETTING: &str =
    "cluster.routing.allocation.node_initial_primaries_recoveries";
pub const DEFAULT_CONCURRENT_RECOVERIES: u32 = 2;
pub const DEFAULT_INITIAL_PRIMARIES_RECOVERIES: u32 = 4;

/// THROTTLE when a node already has too many incoming recoveries
pub struct ThrottlingAllocationDecider {
    concurrent_recoveries: Arc<AtomicU32>,
    initial_primaries_recoveries: Arc<AtomicU32>,
}

impl ThrottlingAllocationDecider {
    pub fn new(settings: &Settings, cluster_settings: &ClusterSettings) -> Self {
        let concurrent_recoveries = Arc::new(AtomicU32::new(read_limit(
            settings,
            CONCURRENT_RECOVERIES_SETTING,
            DEFAULT_CONCURRENT_RECOVERIES,
        )));
        let initial_primaries_recoveries = Arc::new(AtomicU32::new(read_limit(
            settings,
            INITIAL_PRIMARIES_RECOVERIES_SETTING,
            DEFAULT_INITIAL_PRIMARIES_RECOVERIES,
        )));

        let recoveries = concurrent_recoveries.clone();
        let primaries = initial_primaries_recoveries.clone();
        cluster_settings.add_settings_update_consumer(
            &[CONCURRENT_RECOVERIES_SETTING, INITIAL_PRIMARIES_RECOVERIES_SETTING],
            move |snapshot| {
                let concurrent = read_limit(snapshot, CONCURRENT_RECOVERIES_SETTING, DEFAULT_CONCURRENT_RECOVERIES);
                let initial = read_limit(
                    snapshot,
                    INITIAL_PRIMARIES_RECOVERIES_SETTING,
                    DEFAULT_INITIAL_PRIMARIES_RECOVERIES,
                );
                recoveries.store(concurrent, Ordering::Release);
                primaries.store(initial, Ordering::Release);
                info!(
                    "Updated recovery throttling: concurrent_recoveries [{}], initial_primaries_recoveries [{}]",
                    concurrent, initial
                );
            },
        );

        Self {
            concurrent_recoveries,
            initial_primaries_recoveries,
        }
    }

    pub fn concurrent_recoveries(&self) -> u32 {
        self.concurrent_recoveries.load(Ordering::Acquire)
    }

    pub fn initial_primaries_recoveries(&self) -> u32 {
        self.initial_primaries_recoveries.load(Ordering::Acquire)
    }
}

fn read_limit(settings: &Settings, key: &str, default: u32) -> u32 {
    match settings.get_as(key, default) {
        Ok(value) => value,
        Err(e) => {
            warn!("Ignoring invalid setting: {}", e);
            default
        }
    }
}

impl AllocationDecider for ThrottlingAllocationDecider {
    fn name(&self) -> &'static str {
        NAME
    }

    fn can_allocate(&self, shard: &ShardRouting, node: &RoutingNode<'_>, _allocation: &RoutingAllocation<'_>) -> Decision {
        // A primary that never had an active copy recovers locally
        let fresh_primary = shard.primary
            && shard.unassigned()
            && shard
                .unassigned_info
                .as_ref()
                .is_some_and(|info| info.reason == cluster_core::UnassignedReason::IndexCreated);

        if fresh_primary {
            let limit = self.initial_primaries_recoveries();
            let current = node.initializing_primaries();
            if current as u32 >= limit {
                return Decision::single(
                    DecisionType::Throttle,
                    NAME,
                    format!(
                        "reached the limit of ongoing initial primary recoveries [{}], cluster setting [{}={}]",
                        current, INITIAL_PRIMARIES_RECOVERIES_SETTING, limit
                    ),
                );
            }
            return Decision::single(DecisionType::Yes, NAME, "below primary recovery limit");
        }

        let limit = self.concurrent_recoveries();
        let incoming = node.incoming_recoveries();
        if incoming as u32 >= limit {
            Decision::single(
                DecisionType::Throttle,
                NAME,
                format!(
                    "reached the limit of incoming shard recoveries [{}], cluster setting [{}={}]",
                    incoming, CONCURRENT_RECOVERIES_SETTING, limit
                ),
            )
        } else {
            Decision::single(DecisionType::Yes, NAME, "below shard recovery limit")
        }
    }
}
