//! Cluster state observer
//!
//! Waits for the next applied cluster state that satisfies a predicate,
//! without blocking a thread. There is no timeout: the wait ends when a
//! matching state arrives or the node closes.

use std::sync::Arc;

use cluster_core::ClusterState;
use tokio::sync::watch;
use tracing::trace;

use super::service::ClusterService;
use crate::error::ShardStateError;

/// True when `new` has a master and either the master differs from the
/// one in `previous` or the state is newer
pub fn master_changed(previous: &ClusterState, new: &ClusterState) -> bool {
    match new.nodes.master_node_id() {
        None => false,
        Some(master) => previous.nodes.master_node_id() != Some(master) || new.version > previous.version,
    }
}

/// Cluster state observer
pub struct ClusterStateObserver {
    states: watch::Receiver<Arc<ClusterState>>,
    closed: watch::Receiver<bool>,
    last_observed: Arc<ClusterState>,
}

impl ClusterStateObserver {
    /// Start observing from the service's current state
    pub fn new(cluster_service: &ClusterService) -> Self {
        let mut states = cluster_service.subscribe();
        let last_observed = states.borrow_and_update().clone();
        Self {
            states,
            closed: cluster_service.subscribe_closed(),
            last_observed,
        }
    }

    /// The state this observer last handed out
    pub fn observed_state(&self) -> Arc<ClusterState> {
        self.last_observed.clone()
    }

    /// Wait for a state other than the last observed one for which
    /// `predicate(last_observed, new)` holds. A state applied after
    /// `observed_state` was taken but before this call counts.
    pub async fn wait_for_next_change<P>(&mut self, predicate: P) -> Result<Arc<ClusterState>, ShardStateError>
    where
        P: Fn(&ClusterState, &ClusterState) -> bool,
    {
        loop {
            let latest = self.states.borrow_and_update().clone();
            if !latest.same_state(&self.last_observed) && predicate(&self.last_observed, &latest) {
                trace!(
                    "Observed cluster state version {} after version {}",
                    latest.version,
                    self.last_observed.version
                );
                self.last_observed = latest.clone();
                return Ok(latest);
            }

            if *self.closed.borrow_and_update() {
                return Err(ShardStateError::NodeClosed);
            }

            tokio::select! {
                changed = self.states.changed() => {
                    if changed.is_err() {
                        return Err(ShardStateError::NodeClosed);
                    }
                }
                changed = self.closed.changed() => {
                    if changed.is_err() {
                        return Err(ShardStateError::NodeClosed);
                    }
                }
            }
        }
    }
}
