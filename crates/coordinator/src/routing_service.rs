//! Routing service
//!
//! Schedules reroutes on the master through a normal-priority queue, so
//! placement work never holds up shard started/failed acknowledgments.
//! Reasons queued together are handled by a single reroute.

use std::sync::Arc;

use allocation::{AllocationService, RoutingResultExt};
use cluster_core::ClusterState;
use tracing::{debug, trace};

use crate::cluster::{BatchResult, ClusterService, ClusterStateTaskExecutor, MasterTaskQueue, Priority};
use crate::error::ShardStateError;

pub struct RoutingService {
    queue: MasterTaskQueue<String>,
}

impl RoutingService {
    pub fn new(cluster_service: &ClusterService, allocation_service: Arc<AllocationService>) -> Self {
        let queue = cluster_service.create_task_queue(
            "cluster_reroute",
            Priority::Normal,
            Arc::new(RerouteExecutor { allocation_service }),
        );
        Self { queue }
    }

    /// Schedule a reroute without waiting for it
    pub fn reroute(&self, reason: &str) {
        trace!("Scheduling reroute [{}]", reason);
        drop(self.queue.submit(reason.to_string()));
    }

    /// Schedule a reroute and wait until its result is committed
    pub async fn reroute_and_wait(&self, reason: &str) -> Result<(), ShardStateError> {
        self.queue.submit_and_wait(reason.to_string()).await
    }
}

struct RerouteExecutor {
    allocation_service: Arc<AllocationService>,
}

impl ClusterStateTaskExecutor<String> for RerouteExecutor {
    fn execute(&self, current: &Arc<ClusterState>, reasons: &[String]) -> BatchResult {
        let reason = reasons.join(", ");
        let result = self.allocation_service.reroute(current, &reason);
        if !result.changed() {
            return BatchResult::unchanged(current, reasons.len());
        }
        debug!("Reroute [{}] changed routing for cluster state version {}", reason, current.version);
        BatchResult {
            state: Arc::new(current.builder().routing_result(&result).build()),
            results: vec![Ok(()); reasons.len()],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::ClusterStatePublisher;
    use async_trait::async_trait;
    use cluster_core::{
        ClusterSettings, DiscoveryNode, DiscoveryNodes, IndexMetadata, Metadata, RoutingTable, Settings,
        ShardRoutingState,
    };
    use std::time::Duration;

    struct NoopPublisher;

    #[async_trait]
    impl ClusterStatePublisher for NoopPublisher {
        async fn publish(&self, _state: Arc<ClusterState>) -> Result<(), ShardStateError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_reroute_allocates_unassigned() {
        let local = DiscoveryNode::new("n1", "10.0.0.1:9300");
        let mut nodes = DiscoveryNodes::new();
        nodes.add(local.clone());
        nodes.set_master(Some("n1".into()));
        let metadata = Metadata::new().with_index(IndexMetadata::new("idx", 3, 0));
        let mut routing = RoutingTable::new();
        routing.add_as_new(&metadata.indices["idx"]);
        let state = ClusterState::empty("test")
            .builder()
            .version(1)
            .nodes(nodes)
            .metadata(metadata)
            .routing_table(Arc::new(routing))
            .build();

        let cluster_service = Arc::new(ClusterService::new(
            local,
            Settings::empty(),
            Arc::new(ClusterSettings::default()),
            state,
            Arc::new(NoopPublisher),
        ));
        let allocation = Arc::new(AllocationService::with_defaults(&Settings::empty(), &ClusterSettings::default()));
        let routing_service = RoutingService::new(&cluster_service, allocation);
        cluster_service.start();

        tokio::time::timeout(Duration::from_secs(5), routing_service.reroute_and_wait("test"))
            .await
            .unwrap()
            .unwrap();
        let state = cluster_service.state();
        assert_eq!(state.version, 2);
        assert_eq!(state.routing_table.shards_with_state(ShardRoutingState::Initializing).len(), 3);

        // nothing left to do: the next reroute commits no new state
        routing_service.reroute_and_wait("again").await.unwrap();
        assert_eq!(cluster_service.state().version, 2);
        cluster_service.close();
    }
}
