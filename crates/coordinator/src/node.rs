//! Node assembly
//!
//! Wires the services of one cluster node together: cluster service,
//! transport endpoint, allocation service, routing service and the
//! cluster actions. Every node registers the master-side handlers; they
//! only do work while the node is the elected master.

use std::sync::Arc;

use allocation::{AllocationService, DebugMode};
use cluster_core::{ClusterSettings, ClusterState, DiscoveryNode, Settings};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::action::{ClusterSettingsAction, ShardStateAction};
use crate::cluster::{ClusterService, ClusterStatePublisher};
use crate::routing_service::RoutingService;
use crate::transport::{Transport, TransportService};

pub struct Node {
    local_node: DiscoveryNode,
    cluster_service: Arc<ClusterService>,
    transport_service: Arc<TransportService>,
    allocation_service: Arc<AllocationService>,
    routing_service: Arc<RoutingService>,
    shard_state_action: Arc<ShardStateAction>,
    settings_action: ClusterSettingsAction,
    runner: Mutex<Option<JoinHandle<()>>>,
}

impl Node {
    pub fn new(
        local_node: DiscoveryNode,
        node_settings: Settings,
        initial_state: ClusterState,
        transport: Arc<dyn Transport>,
        publisher: Arc<dyn ClusterStatePublisher>,
    ) -> Self {
        let effective = node_settings.merged_with(&initial_state.metadata.persistent_settings);
        let cluster_settings = Arc::new(ClusterSettings::new(effective.clone()));

        let debug_mode = match effective.get("cluster.routing.allocation.debug") {
            Some("true") => DebugMode::On,
            Some("exclude_yes_decisions") => DebugMode::ExcludeYesDecisions,
            _ => DebugMode::Off,
        };
        let allocation_service =
            Arc::new(AllocationService::with_defaults(&effective, &cluster_settings).with_debug_mode(debug_mode));

        let cluster_service = Arc::new(ClusterService::new(
            local_node.clone(),
            node_settings,
            cluster_settings,
            initial_state,
            publisher,
        ));
        let transport_service = Arc::new(TransportService::new(local_node.clone(), transport));

        let routing_service = Arc::new(RoutingService::new(&cluster_service, allocation_service.clone()));
        ShardStateAction::register_handlers(
            &transport_service,
            &cluster_service,
            allocation_service.clone(),
            routing_service.clone(),
        );
        let settings_action = ClusterSettingsAction::new(&cluster_service, routing_service.clone());
        let shard_state_action = Arc::new(ShardStateAction::new(transport_service.clone(), cluster_service.clone()));

        debug!("Assembled node [{}] at {}", local_node.id, local_node.address);
        Self {
            local_node,
            cluster_service,
            transport_service,
            allocation_service,
            routing_service,
            shard_state_action,
            settings_action,
            runner: Mutex::new(None),
        }
    }

    pub fn local_node(&self) -> &DiscoveryNode {
        &self.local_node
    }

    pub fn id(&self) -> &str {
        &self.local_node.id
    }

    pub fn cluster_service(&self) -> &Arc<ClusterService> {
        &self.cluster_service
    }

    pub fn transport_service(&self) -> &Arc<TransportService> {
        &self.transport_service
    }

    pub fn allocation_service(&self) -> &Arc<AllocationService> {
        &self.allocation_service
    }

    pub fn routing_service(&self) -> &Arc<RoutingService> {
        &self.routing_service
    }

    pub fn shard_state_action(&self) -> &Arc<ShardStateAction> {
        &self.shard_state_action
    }

    pub fn settings_action(&self) -> &ClusterSettingsAction {
        &self.settings_action
    }

    pub fn state(&self) -> Arc<ClusterState> {
        self.cluster_service.state()
    }

    pub fn is_master(&self) -> bool {
        self.cluster_service.is_master()
    }

    /// Start the cluster service runner; a second call is a no-op
    pub fn start(&self) {
        let mut runner = self.runner.lock();
        if runner.is_none() {
            *runner = Some(self.cluster_service.start());
            info!("Node [{}] started", self.local_node.id);
        }
    }

    /// Close the cluster service and wait for its runner to stop
    pub async fn close(&self) {
        self.cluster_service.close();
        let runner = self.runner.lock().take();
        if let Some(handle) = runner {
            let _ = handle.await;
        }
        info!("Node [{}] closed", self.local_node.id);
    }
}
