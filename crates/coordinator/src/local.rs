//! In-process multi-node cluster
//!
//! Builds nodes from a `Config`, connects them through a
//! `LocalTransportHub` and bootstraps the first cluster state with the
//! configured indices unassigned. Masters are installed by publishing
//! states; there is no election.

use std::collections::BTreeMap;
use std::sync::Arc;

use cluster_core::{
    ClusterState, ClusterStats, DiscoveryNode, DiscoveryNodes, IndexMetadata, Metadata, NodeRole, RoutingTable,
    Settings, ShardId, ShardRoutingState,
};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::config::{Config, ConfigError};
use crate::error::ShardStateError;
use crate::node::Node;
use crate::transport::LocalTransportHub;

pub struct LocalCluster {
    hub: Arc<LocalTransportHub>,
    nodes: BTreeMap<String, Arc<Node>>,
}

impl LocalCluster {
    /// Build every node with the same bootstrap state. The first
    /// master-eligible node is installed as master.
    pub fn new(config: &Config) -> Result<Self, ConfigError> {
        config.validate()?;

        let mut discovery = DiscoveryNodes::new();
        for node in &config.nodes {
            discovery.add(discovery_node(node));
        }
        let master = config.nodes.iter().find(|n| n.master).map(|n| n.id.clone());
        discovery.set_master(master);

        let persistent: Settings = config.allocation.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        let mut metadata = Metadata {
            persistent_settings: persistent,
            ..Metadata::default()
        };
        let mut routing_table = RoutingTable::new();
        for index in &config.indices {
            if metadata.has_index(&index.name) {
                return Err(ConfigError::Invalid(format!("duplicate index [{}]", index.name)));
            }
            let settings: Settings = index.settings.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
            let index_metadata = IndexMetadata::new(index.name.clone(), index.shards, index.replicas).with_settings(settings);
            routing_table.add_as_new(&index_metadata);
            metadata.put_index(index_metadata);
        }

        let initial = ClusterState::empty(config.cluster.name.clone())
            .builder()
            .version(1)
            .nodes(discovery)
            .metadata(metadata)
            .routing_table(Arc::new(routing_table))
            .build();

        let hub = LocalTransportHub::new();
        let mut nodes = BTreeMap::new();
        for node_config in &config.nodes {
            let local = initial
                .nodes
                .get(&node_config.id)
                .cloned()
                .ok_or_else(|| ConfigError::Invalid(format!("unknown node [{}]", node_config.id)))?;
            let node = Arc::new(Node::new(
                local,
                Settings::empty(),
                initial.clone(),
                hub.clone(),
                hub.publisher(node_config.id.clone()),
            ));
            hub.register(node.transport_service(), node.cluster_service());
            nodes.insert(node_config.id.clone(), node);
        }

        info!(
            "Bootstrapped cluster [{}] with {} nodes and {} indices",
            initial.cluster_name,
            nodes.len(),
            initial.metadata.indices.len()
        );
        Ok(Self { hub, nodes })
    }

    /// Start every node's cluster service
    pub fn start(&self) {
        for node in self.nodes.values() {
            node.start();
        }
    }

    pub fn hub(&self) -> &Arc<LocalTransportHub> {
        &self.hub
    }

    pub fn node(&self, node_id: &str) -> Option<&Arc<Node>> {
        self.nodes.get(node_id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Arc<Node>> {
        self.nodes.values()
    }

    /// The newest state applied on any node
    pub fn state(&self) -> Arc<ClusterState> {
        self.nodes
            .values()
            .map(|n| n.state())
            .max_by_key(|s| s.version)
            .unwrap_or_else(|| Arc::new(ClusterState::empty("empty")))
    }

    /// The node that is master in the newest state
    pub fn master(&self) -> Option<&Arc<Node>> {
        let state = self.state();
        state.nodes.master_node_id().and_then(|id| self.nodes.get(id))
    }

    pub fn stats(&self) -> ClusterStats {
        self.state().stats()
    }

    /// Install `master` (or no master) on the given nodes by publishing a
    /// newer state to them. Every node when `targets` is `None`.
    pub fn set_master(&self, master: Option<&str>, targets: Option<&[&str]>) -> Arc<ClusterState> {
        let current = self.state();
        let mut nodes = (*current.nodes).clone();
        nodes.set_master(master.map(str::to_string));
        let state = Arc::new(current.builder().incr_version().nodes(nodes).build());

        let all: Vec<&str> = self.nodes.keys().map(String::as_str).collect();
        let targets = targets.unwrap_or(&all);
        let applied = self.hub.publish_to(targets, state.clone());
        info!(
            "Installed master [{}] at version {} on {} nodes",
            master.unwrap_or("none"),
            state.version,
            applied
        );
        state
    }

    /// Remove a node from the cluster state and reroute its copies
    pub fn remove_node(&self, node_id: &str) -> Arc<ClusterState> {
        self.hub.disconnect(node_id);
        let current = self.state();
        let mut nodes = (*current.nodes).clone();
        nodes.remove(node_id);
        let state = Arc::new(current.builder().incr_version().nodes(nodes).build());
        let targets: Vec<&str> = self
            .nodes
            .keys()
            .map(String::as_str)
            .filter(|id| *id != node_id)
            .collect();
        self.hub.publish_to(&targets, state.clone());
        info!("Node [{}] left the cluster at version {}", node_id, state.version);
        state
    }

    fn require_master(&self) -> Result<&Arc<Node>, ShardStateError> {
        self.master()
            .ok_or_else(|| ShardStateError::Remote("no master in the cluster state".to_string()))
    }

    pub async fn reroute(&self, reason: &str) -> Result<(), ShardStateError> {
        self.require_master()?.routing_service().reroute_and_wait(reason).await
    }

    pub async fn update_settings(&self, settings: Settings) -> Result<(), ShardStateError> {
        self.require_master()?.settings_action().update_settings(settings).await
    }

    /// Let every node report the copies it is initializing as started.
    /// Returns how many reports were acknowledged.
    pub async fn start_initializing_shards(&self) -> Result<usize, ShardStateError> {
        let state = self.state();
        let mut reports = JoinSet::new();
        for shard in state.routing_table.shards_with_state(ShardRoutingState::Initializing) {
            let Some(node) = shard.current_node.as_deref().and_then(|id| self.nodes.get(id)) else {
                continue;
            };
            let Some(index) = state.metadata.index(&shard.shard_id.index) else {
                continue;
            };
            let action = node.shard_state_action().clone();
            let shard = shard.clone();
            let index_uuid = index.uuid.clone();
            reports.spawn(async move { action.shard_started(&shard, &index_uuid, "after recovery").await });
        }

        let mut acknowledged = 0;
        while let Some(joined) = reports.join_next().await {
            match joined {
                Ok(Ok(())) => acknowledged += 1,
                Ok(Err(e)) => return Err(e),
                Err(e) => warn!("Shard started report task failed: {}", e),
            }
        }
        debug!("{} shard started reports acknowledged", acknowledged);
        Ok(acknowledged)
    }

    /// Let the node holding the primary (or else any assigned copy) of
    /// `shard_id` report it as failed. Returns false when no copy is
    /// assigned.
    pub async fn fail_shard(&self, shard_id: &ShardId, message: &str, failure: Option<String>) -> Result<bool, ShardStateError> {
        let state = self.state();
        let Some(table) = state.routing_table.shard_routing_table(shard_id) else {
            return Ok(false);
        };
        let copy = table
            .assigned_shards()
            .find(|s| s.primary)
            .or_else(|| table.assigned_shards().next())
            .cloned();
        let Some(copy) = copy else {
            return Ok(false);
        };
        let Some(node) = copy.current_node.as_deref().and_then(|id| self.nodes.get(id)) else {
            return Ok(false);
        };
        let index_uuid = state
            .metadata
            .index(&shard_id.index)
            .map(|i| i.uuid.clone())
            .unwrap_or_else(|| cluster_core::INDEX_UUID_NA_VALUE.to_string());
        node.shard_state_action()
            .shard_failed(&copy, &index_uuid, message, failure)
            .await?;
        Ok(true)
    }

    pub async fn close(&self) {
        for node in self.nodes.values() {
            node.close().await;
        }
    }
}

fn discovery_node(config: &crate::config::NodeConfig) -> DiscoveryNode {
    let mut roles = Vec::new();
    if config.master {
        roles.push(NodeRole::Master);
    }
    if config.data {
        roles.push(NodeRole::Data);
    }
    config
        .attributes
        .iter()
        .fold(DiscoveryNode::new(config.id.clone(), config.address.clone()), |node, (k, v)| {
            node.with_attribute(k.clone(), v.clone())
        })
        .with_roles(roles)
}
