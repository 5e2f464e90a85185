mod common;

use std::time::Duration;

use cluster_core::ShardRoutingState;
use common::{shards_in, start_cluster, RecordingListener, WAIT};

const CLUSTER: &str = r#"
nodes:
  - id: m1
    data: false
  - id: m2
    data: false
  - id: data-a
    master: false
indices:
  - name: idx
    shards: 1
    replicas: 0
"#;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_started_report_follows_new_master() {
    let cluster = start_cluster(CLUSTER);
    cluster.reroute("initial").await.unwrap();

    let state = cluster.state();
    assert_eq!(state.nodes.master_node_id().map(String::as_str), Some("m1"));
    let initializing = shards_in(&state, ShardRoutingState::Initializing);
    assert_eq!(initializing.len(), 1);
    let copy = initializing[0].clone();
    let index_uuid = state.metadata.indices["idx"].uuid.clone();

    // m1 is demoted and m2 elected, but data-a has not heard about it yet
    cluster.set_master(Some("m2"), Some(&["m1", "m2"]));
    let data_node = cluster.node("data-a").unwrap();
    assert_eq!(
        data_node.state().nodes.master_node_id().map(String::as_str),
        Some("m1")
    );

    let round_trips = cluster.hub().round_trips();
    let listener = RecordingListener::new();
    let report = data_node.shard_state_action().shard_started_with_listener(
        copy.clone(),
        index_uuid,
        "after recovery".to_string(),
        listener.clone(),
    );

    // the stale master answers with a not-master error
    tokio::time::timeout(WAIT, async {
        while cluster.hub().round_trips() == round_trips {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(listener.successes(), 0);
    assert!(listener.failures().is_empty());

    // once data-a learns about m2 the report is resent there
    let newest = cluster.node("m2").unwrap().state();
    cluster.hub().publish_to(&["data-a"], newest);

    tokio::time::timeout(WAIT, report).await.unwrap().unwrap();
    assert_eq!(listener.successes(), 1);
    assert!(listener.failures().is_empty());
    assert_eq!(cluster.hub().round_trips(), round_trips + 2);

    let state = cluster.node("m2").unwrap().state();
    let started = shards_in(&state, ShardRoutingState::Started);
    assert_eq!(started.len(), 1);
    assert_eq!(started[0].allocation_id, copy.allocation_id);
    assert_eq!(data_node.state().version, state.version);
    assert!(!cluster.node("m1").unwrap().is_master());

    cluster.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_report_waits_while_no_master() {
    let cluster = start_cluster(CLUSTER);
    cluster.reroute("initial").await.unwrap();
    let state = cluster.state();
    let copy = shards_in(&state, ShardRoutingState::Initializing).remove(0);

    cluster.set_master(None, None);
    let data_node = cluster.node("data-a").unwrap();
    let action = data_node.shard_state_action().clone();
    let report = tokio::spawn(async move { action.shard_started(&copy, "_na_", "after recovery").await });

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!report.is_finished());

    cluster.set_master(Some("m2"), None);
    tokio::time::timeout(WAIT, report).await.unwrap().unwrap().unwrap();
    assert_eq!(shards_in(&cluster.state(), ShardRoutingState::Started).len(), 1);

    cluster.close().await;
}
