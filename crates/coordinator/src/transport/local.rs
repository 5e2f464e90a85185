//! In-process transport
//!
//! Routes requests between `TransportService`s living in the same process
//! and delivers committed cluster states to every connected node. Payloads
//! still go through the wire codec. Nodes can be disconnected and commits
//! made to fail, which is how tests simulate master churn.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use cluster_core::{ClusterState, DiscoveryNode, NodeId};
use parking_lot::RwLock;
use tracing::{debug, trace, warn};

use super::{Transport, TransportService};
use crate::cluster::{ClusterService, ClusterStatePublisher};
use crate::error::ShardStateError;

/// Registry of in-process nodes
#[derive(Default)]
pub struct LocalTransportHub {
    endpoints: RwLock<HashMap<NodeId, Weak<TransportService>>>,
    appliers: RwLock<HashMap<NodeId, Weak<ClusterService>>>,
    disconnected: RwLock<HashSet<NodeId>>,
    fail_commits: AtomicUsize,
    round_trips: AtomicUsize,
}

impl LocalTransportHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make a node reachable. Only weak references are kept, so dropping
    /// a node unregisters it.
    pub fn register(&self, transport: &Arc<TransportService>, cluster_service: &Arc<ClusterService>) {
        let node_id = transport.local_node().id.clone();
        self.endpoints.write().insert(node_id.clone(), Arc::downgrade(transport));
        self.appliers.write().insert(node_id.clone(), Arc::downgrade(cluster_service));
        debug!("Registered node [{}] with local transport hub", node_id);
    }

    /// Cut a node off: it can neither send nor receive requests or states
    pub fn disconnect(&self, node_id: &str) {
        self.disconnected.write().insert(node_id.to_string());
        debug!("Disconnected node [{}]", node_id);
    }

    pub fn reconnect(&self, node_id: &str) {
        self.disconnected.write().remove(node_id);
        debug!("Reconnected node [{}]", node_id);
    }

    pub fn is_connected(&self, node_id: &str) -> bool {
        !self.disconnected.read().contains(node_id)
    }

    /// Fail the next `count` commits with `FailedToCommit`
    pub fn fail_next_commits(&self, count: usize) {
        self.fail_commits.store(count, Ordering::SeqCst);
    }

    /// Requests that reached a handler and got a response
    pub fn round_trips(&self) -> usize {
        self.round_trips.load(Ordering::SeqCst)
    }

    fn take_commit_failure(&self) -> bool {
        self.fail_commits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn endpoint(&self, node_id: &str) -> Option<Arc<TransportService>> {
        self.endpoints.read().get(node_id).and_then(Weak::upgrade)
    }

    fn cluster_service(&self, node_id: &str) -> Option<Arc<ClusterService>> {
        self.appliers.read().get(node_id).and_then(Weak::upgrade)
    }

    /// Apply a state on the given nodes regardless of connectivity.
    /// Returns how many nodes applied it.
    pub fn publish_to(&self, node_ids: &[&str], state: Arc<ClusterState>) -> usize {
        let mut applied = 0;
        for node_id in node_ids {
            match self.cluster_service(node_id) {
                Some(service) => {
                    if service.apply_state(state.clone()) {
                        applied += 1;
                    }
                }
                None => warn!("Cannot publish cluster state to unknown node [{}]", node_id),
            }
        }
        applied
    }

    /// Apply a state on every connected node except `source`
    fn publish_from(&self, source: &str, state: Arc<ClusterState>) -> Result<(), ShardStateError> {
        if !self.is_connected(source) || self.take_commit_failure() {
            return Err(ShardStateError::FailedToCommit {
                version: state.version,
                reason: format!("node [{}] could not reach enough master nodes", source),
            });
        }

        let targets: Vec<NodeId> = self
            .appliers
            .read()
            .keys()
            .filter(|id| id.as_str() != source)
            .cloned()
            .collect();
        for node_id in targets {
            if !self.is_connected(&node_id) {
                trace!("Skipping disconnected node [{}] for version {}", node_id, state.version);
                continue;
            }
            if let Some(service) = self.cluster_service(&node_id) {
                service.apply_state(state.clone());
            }
        }
        Ok(())
    }

    /// Publisher for states committed by `node_id`
    pub fn publisher(self: &Arc<Self>, node_id: impl Into<NodeId>) -> Arc<LocalPublisher> {
        Arc::new(LocalPublisher {
            hub: self.clone(),
            node_id: node_id.into(),
        })
    }
}

#[async_trait]
impl Transport for LocalTransportHub {
    async fn send_request(
        &self,
        from: &DiscoveryNode,
        to: &DiscoveryNode,
        action: &str,
        payload: Bytes,
    ) -> Result<Bytes, ShardStateError> {
        if !self.is_connected(&from.id) || !self.is_connected(&to.id) {
            return Err(ShardStateError::ConnectTransport(to.id.clone()));
        }
        let endpoint = self
            .endpoint(&to.id)
            .ok_or_else(|| ShardStateError::ConnectTransport(to.id.clone()))?;

        trace!("[{}] -> [{}] {}", from.id, to.id, action);
        let response = endpoint.handle_inbound(action, payload).await;
        self.round_trips.fetch_add(1, Ordering::SeqCst);

        // the target may have been cut off while the request was in flight
        if !self.is_connected(&to.id) {
            return Err(ShardStateError::NodeDisconnected(to.id.clone()));
        }
        Ok(response)
    }
}

/// Cluster state publisher of one node
pub struct LocalPublisher {
    hub: Arc<LocalTransportHub>,
    node_id: NodeId,
}

#[async_trait]
impl ClusterStatePublisher for LocalPublisher {
    async fn publish(&self, state: Arc<ClusterState>) -> Result<(), ShardStateError> {
        self.hub.publish_from(&self.node_id, state)
    }
}
