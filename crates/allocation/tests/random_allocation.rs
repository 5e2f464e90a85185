//! Random decisions and random failures must never break routing invariants

use std::sync::Arc;

use allocation::{
    AllocationDecider, AllocationDeciders, AllocationService, BalancedShardsAllocator, Decision, DecisionType,
    FailedShard, RoutingAllocation, RoutingNode, RoutingResultExt,
};
use allocation::decider::{ReplicaAfterPrimaryActiveAllocationDecider, SameShardAllocationDecider};
use cluster_core::{
    ClusterSettings, ClusterState, DiscoveryNode, DiscoveryNodes, IndexMetadata, Metadata, RoutingTable, Settings,
    ShardRouting, ShardRoutingState,
};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

struct RandomAllocationDecider {
    rng: Mutex<StdRng>,
}

impl RandomAllocationDecider {
    fn new(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    fn random_decision(&self) -> Decision {
        match self.rng.lock().random_range(0..10) {
            0..=5 => Decision::YES,
            6..=7 => Decision::THROTTLE,
            _ => Decision::NO,
        }
    }
}

impl AllocationDecider for RandomAllocationDecider {
    fn name(&self) -> &'static str {
        "random"
    }

    fn can_allocate(&self, _shard: &ShardRouting, _node: &RoutingNode<'_>, _allocation: &RoutingAllocation<'_>) -> Decision {
        self.random_decision()
    }

    fn can_remain(&self, _shard: &ShardRouting, _node: &RoutingNode<'_>, _allocation: &RoutingAllocation<'_>) -> Decision {
        // mostly stay put so relocations stay rare
        match self.random_decision().kind() {
            DecisionType::No if self.rng.lock().random_bool(0.2) => Decision::NO,
            _ => Decision::YES,
        }
    }
}

fn initial_state(num_nodes: usize, indices: &[(&str, u32, u32)]) -> ClusterState {
    let mut nodes = DiscoveryNodes::new();
    for i in 0..num_nodes {
        nodes.add(DiscoveryNode::new(format!("node{}", i), format!("127.0.0.{}:9300", i + 1)));
    }
    nodes.set_master(Some("node0".to_string()));

    let mut metadata = Metadata::new();
    let mut routing = RoutingTable::new();
    for (name, shards, replicas) in indices {
        let index = IndexMetadata::new(*name, *shards, *replicas);
        routing.add_as_new(&index);
        metadata.put_index(index);
    }
    ClusterState::empty("random")
        .builder()
        .nodes(nodes)
        .metadata(metadata)
        .routing_table(Arc::new(routing))
        .build()
}

fn service(seed: u64) -> AllocationService {
    let cluster_settings = ClusterSettings::default();
    let deciders = AllocationDeciders::new(vec![
        Arc::new(SameShardAllocationDecider),
        Arc::new(ReplicaAfterPrimaryActiveAllocationDecider),
        Arc::new(RandomAllocationDecider::new(seed)),
    ]);
    AllocationService::new(
        Arc::new(deciders),
        BalancedShardsAllocator::new(&Settings::empty(), &cluster_settings),
    )
}

fn assert_valid(state: &ClusterState) {
    let problems = state.routing_table.validate(&state.metadata);
    assert!(problems.is_empty(), "routing invariants violated: {:?}", problems);
}

#[test]
fn test_random_decisions_keep_routing_valid() {
    let service = service(7);
    let mut rng = StdRng::seed_from_u64(11);
    let mut state = initial_state(4, &[("logs", 3, 1), ("metrics", 2, 2)]);

    for round in 0..60 {
        let result = service.reroute(&state, "random round");
        state = state.builder().incr_version().routing_result(&result).build();
        assert_valid(&state);

        let initializing: Vec<ShardRouting> = state
            .routing_table
            .shards_with_state(ShardRoutingState::Initializing)
            .into_iter()
            .cloned()
            .collect();
        let (failed, started): (Vec<_>, Vec<_>) = initializing.into_iter().partition(|_| rng.random_bool(0.1));

        if !failed.is_empty() {
            let failed: Vec<_> = failed
                .into_iter()
                .map(|routing| FailedShard::new(routing, format!("random failure in round {}", round), None))
                .collect();
            let result = service.apply_failed_shards(&state, &failed).unwrap();
            state = state.builder().incr_version().routing_result(&result).build();
            assert_valid(&state);
        }

        if !started.is_empty() {
            let result = service.apply_started_shards(&state, &started, false).unwrap();
            state = state.builder().incr_version().routing_result(&result).build();
            assert_valid(&state);
        }
    }

    // reported twice, no effect the second time
    let active: Vec<ShardRouting> = state.routing_table.all_shards().filter(|s| s.active()).cloned().collect();
    let result = service.apply_started_shards(&state, &active, false).unwrap();
    assert!(!result.changed());
}

#[test]
fn test_started_and_failed_for_same_copy_converge() {
    let service = service(3);
    let mut state = initial_state(2, &[("idx", 1, 1)]);
    for _ in 0..20 {
        let result = service.reroute(&state, "bootstrap");
        state = state.builder().incr_version().routing_result(&result).build();
        if !state.routing_table.shards_with_state(ShardRoutingState::Initializing).is_empty() {
            break;
        }
    }
    let copy = state
        .routing_table
        .shards_with_state(ShardRoutingState::Initializing)
        .first()
        .map(|s| (*s).clone())
        .expect("random decider never allowed an allocation");

    // started then failed
    let started = service.apply_started_shards(&state, &[copy.clone()], false).unwrap();
    let a = state.builder().incr_version().routing_result(&started).build();
    let failed = service
        .apply_failed_shards(&a, &[FailedShard::new(copy.clone(), "late failure", None)])
        .unwrap();
    let a = a.builder().incr_version().routing_result(&failed).build();
    assert_valid(&a);

    // failed then started
    let failed = service
        .apply_failed_shards(&state, &[FailedShard::new(copy.clone(), "failure", None)])
        .unwrap();
    let b = state.builder().incr_version().routing_result(&failed).build();
    let started = service.apply_started_shards(&b, &[copy], false).unwrap();
    assert!(!started.changed());
    assert_valid(&b);
}
