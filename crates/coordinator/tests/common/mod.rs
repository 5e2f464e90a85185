// Shared helpers for coordinator integration tests

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cluster_core::{ClusterState, ShardRouting, ShardRoutingState};
use coordinator::{Config, LocalCluster, ShardStateError, ShardStateListener};
use parking_lot::Mutex;
use tracing::Level;

pub const WAIT: Duration = Duration::from_secs(10);

pub fn init_logging() {
    let _ = tracing_subscriber::fmt().with_max_level(Level::DEBUG).with_test_writer().try_init();
}

pub fn start_cluster(yaml: &str) -> LocalCluster {
    init_logging();
    let config = Config::from_yaml(yaml).unwrap();
    let cluster = LocalCluster::new(&config).unwrap();
    cluster.start();
    cluster
}

/// Reroute and start shards until nothing is initializing or unassigned
/// (or `rounds` is exhausted)
pub async fn allocate_all(cluster: &LocalCluster, rounds: usize) {
    for _ in 0..rounds {
        cluster.reroute("test").await.unwrap();
        let stats = cluster.stats();
        if stats.initializing_shards == 0 && stats.unassigned_shards == 0 {
            return;
        }
        cluster.start_initializing_shards().await.unwrap();
    }
}

/// Poll the newest cluster state until `predicate` holds
pub async fn wait_for_state<P>(cluster: &LocalCluster, predicate: P) -> Arc<ClusterState>
where
    P: Fn(&ClusterState) -> bool,
{
    tokio::time::timeout(WAIT, async {
        loop {
            let state = cluster.state();
            if predicate(&state) {
                return state;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap()
}

pub fn shards_in(state: &ClusterState, shard_state: ShardRoutingState) -> Vec<ShardRouting> {
    state
        .routing_table
        .shards_with_state(shard_state)
        .into_iter()
        .cloned()
        .collect()
}

/// Listener counting its callbacks
#[derive(Default)]
pub struct RecordingListener {
    successes: AtomicUsize,
    failures: Mutex<Vec<ShardStateError>>,
}

impl RecordingListener {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn successes(&self) -> usize {
        self.successes.load(Ordering::SeqCst)
    }

    pub fn failures(&self) -> Vec<ShardStateError> {
        self.failures.lock().clone()
    }
}

impl ShardStateListener for RecordingListener {
    fn on_success(&self) {
        self.successes.fetch_add(1, Ordering::SeqCst);
    }

    fn on_failure(&self, error: ShardStateError) {
        self.failures.lock().push(error);
    }
}
