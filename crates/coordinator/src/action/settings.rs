//! Cluster settings update action
//!
//! Persistent cluster settings are stored in the cluster metadata. Every
//! node re-applies them to its live `ClusterSettings` when it applies the
//! committed state; the master then reroutes so that changed allocation
//! settings take effect.

use std::sync::Arc;

use cluster_core::{ClusterState, Metadata, Settings};
use tracing::{debug, info};

use crate::cluster::{BatchResult, ClusterService, ClusterStateTaskExecutor, MasterTaskQueue, Priority};
use crate::error::ShardStateError;
use crate::routing_service::RoutingService;

/// Master-local entry point for persistent settings updates
pub struct ClusterSettingsAction {
    queue: MasterTaskQueue<Settings>,
}

impl ClusterSettingsAction {
    pub fn new(cluster_service: &ClusterService, routing_service: Arc<RoutingService>) -> Self {
        let queue = cluster_service.create_task_queue(
            "cluster_update_settings",
            Priority::High,
            Arc::new(SettingsUpdateExecutor { routing_service }),
        );
        Self { queue }
    }

    /// Merge `settings` into the persistent cluster settings. An empty
    /// value removes the key.
    pub async fn update_settings(&self, settings: Settings) -> Result<(), ShardStateError> {
        debug!("Submitting cluster settings update for {} keys", settings.len());
        self.queue.submit_and_wait(settings).await
    }
}

pub struct SettingsUpdateExecutor {
    routing_service: Arc<RoutingService>,
}

fn merge_persistent(current: &Settings, update: &Settings) -> Settings {
    let mut builder = Settings::builder().put_all(current);
    for (key, value) in update.iter() {
        builder = if value.is_empty() {
            builder.remove(key)
        } else {
            builder.put(key, value)
        };
    }
    builder.build()
}

impl ClusterStateTaskExecutor<Settings> for SettingsUpdateExecutor {
    fn execute(&self, current: &Arc<ClusterState>, tasks: &[Settings]) -> BatchResult {
        let persistent = tasks
            .iter()
            .fold(current.metadata.persistent_settings.clone(), |acc, update| merge_persistent(&acc, update));
        if persistent == current.metadata.persistent_settings {
            return BatchResult::unchanged(current, tasks.len());
        }

        for key in current.metadata.persistent_settings.changed_keys(&persistent) {
            info!("Updating persistent cluster setting [{}] to [{}]", key, persistent.get(&key).unwrap_or(""));
        }
        let metadata = Metadata {
            persistent_settings: persistent,
            ..(*current.metadata).clone()
        };
        BatchResult {
            state: Arc::new(current.builder().metadata(metadata).build()),
            results: vec![Ok(()); tasks.len()],
        }
    }

    fn cluster_state_published(&self, _state: &Arc<ClusterState>) {
        self.routing_service.reroute("reroute after cluster update settings");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_persistent_settings() {
        let current = Settings::builder()
            .put("cluster.routing.allocation.exclude.rack", "r1")
            .put("cluster.routing.allocation.node_concurrent_recoveries", "2")
            .build();
        let update = Settings::builder()
            .put("cluster.routing.allocation.exclude.rack", "")
            .put("cluster.routing.allocation.node_concurrent_recoveries", "4")
            .build();

        let merged = merge_persistent(&current, &update);
        assert_eq!(merged.get("cluster.routing.allocation.exclude.rack"), None);
        assert_eq!(merged.get("cluster.routing.allocation.node_concurrent_recoveries"), Some("4"));
        assert_eq!(merged.len(), 1);
    }
}
