mod common;

use std::sync::Arc;

use cluster_core::{ShardRouting, ShardRoutingState};
use common::{shards_in, start_cluster, WAIT};
use coordinator::ShardStateError;
use tokio::task::JoinSet;

const CLUSTER: &str = r#"
nodes:
  - id: n1
  - id: n2
  - id: n3
indices:
  - name: idx
    shards: 4
    replicas: 0
"#;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_malformed_report_fails_alone() {
    let cluster = Arc::new(start_cluster(CLUSTER));
    cluster.reroute("initial").await.unwrap();
    let state = cluster.state();
    let index_uuid = state.metadata.indices["idx"].uuid.clone();
    let mut copies = shards_in(&state, ShardRoutingState::Initializing);
    assert_eq!(copies.len(), 4);
    copies.sort_by_key(|s| s.shard_id.id);

    // shard 2 is reported without an allocation id
    let mut reports: Vec<ShardRouting> = copies.clone();
    reports[2].allocation_id = None;

    let reporter = cluster.node("n1").unwrap().shard_state_action().clone();
    let mut tasks = JoinSet::new();
    for report in reports {
        let reporter = reporter.clone();
        let index_uuid = index_uuid.clone();
        tasks.spawn(async move {
            let result = reporter.shard_started(&report, &index_uuid, "after recovery").await;
            (report.shard_id.id, result)
        });
    }

    let mut outcomes = Vec::new();
    tokio::time::timeout(WAIT, async {
        while let Some(joined) = tasks.join_next().await {
            outcomes.push(joined.unwrap());
        }
    })
    .await
    .unwrap();
    outcomes.sort_by_key(|(id, _)| *id);

    for (id, result) in &outcomes {
        if *id == 2 {
            match result {
                Err(ShardStateError::Remote(reason)) => assert!(reason.contains("allocation id"), "{}", reason),
                other => panic!("unexpected outcome for shard 2: {:?}", other),
            }
        } else {
            assert_eq!(result, &Ok(()), "shard {}", id);
        }
    }

    let state = cluster.state();
    let mut started: Vec<u32> = shards_in(&state, ShardRoutingState::Started)
        .into_iter()
        .map(|s| s.shard_id.id)
        .collect();
    started.sort_unstable();
    assert_eq!(started, vec![0, 1, 3]);
    let still_initializing = shards_in(&state, ShardRoutingState::Initializing);
    assert_eq!(still_initializing.len(), 1);
    assert_eq!(still_initializing[0].allocation_id, copies[2].allocation_id);

    cluster.close().await;
}
