//! Mutable, node-centric view of the routing table
//!
//! Built from a `ClusterState` at the start of an allocation pass. Copies
//! are grouped by the node they are assigned to; copies on nodes that are
//! no longer data nodes of the cluster stay grouped under their old node
//! id until the pass disassociates them.

use std::collections::BTreeMap;

use cluster_core::{ClusterState, DiscoveryNode, NodeId, RoutingTable, ShardId, ShardRouting};

/// Read-only view of one live data node and the copies it holds
#[derive(Debug, Clone, Copy)]
pub struct RoutingNode<'a> {
    node: &'a DiscoveryNode,
    shards: &'a [ShardRouting],
}

impl<'a> RoutingNode<'a> {
    pub fn node(&self) -> &'a DiscoveryNode {
        self.node
    }

    pub fn node_id(&self) -> &'a str {
        &self.node.id
    }

    pub fn shards(&self) -> &'a [ShardRouting] {
        self.shards
    }

    /// Number of copies on the node, relocation targets included
    pub fn size(&self) -> usize {
        self.shards.len()
    }

    pub fn num_shards_of_index(&self, index: &str) -> usize {
        self.shards
            .iter()
            .filter(|s| s.shard_id.index == index)
            .count()
    }

    /// The copy of `shard_id` on this node, if any
    pub fn copy_of(&self, shard_id: &ShardId) -> Option<&'a ShardRouting> {
        self.shards.iter().find(|s| &s.shard_id == shard_id)
    }

    /// Copies currently recovering onto this node
    pub fn incoming_recoveries(&self) -> usize {
        self.shards.iter().filter(|s| s.initializing()).count()
    }

    /// Fresh primaries initializing on this node (not relocation targets)
    pub fn initializing_primaries(&self) -> usize {
        self.shards
            .iter()
            .filter(|s| s.primary && s.initializing() && !s.is_relocation_target())
            .count()
    }
}

/// Routing nodes
#[derive(Debug, Clone)]
pub struct RoutingNodes {
    /// Live data nodes
    live: BTreeMap<NodeId, DiscoveryNode>,
    /// Assigned copies by node id (live or departed)
    assigned: BTreeMap<NodeId, Vec<ShardRouting>>,
    unassigned: Vec<ShardRouting>,
}

impl RoutingNodes {
    pub fn new(state: &ClusterState) -> Self {
        let live: BTreeMap<NodeId, DiscoveryNode> = state
            .nodes
            .data_nodes()
            .map(|node| (node.id.clone(), node.clone()))
            .collect();

        let mut assigned: BTreeMap<NodeId, Vec<ShardRouting>> = BTreeMap::new();
        let mut unassigned = Vec::new();
        for shard in state.routing_table.all_shards() {
            match &shard.current_node {
                Some(node_id) => assigned
                    .entry(node_id.clone())
                    .or_default()
                    .push(shard.clone()),
                None => unassigned.push(shard.clone()),
            }
        }

        Self {
            live,
            assigned,
            unassigned,
        }
    }

    pub fn routing_node(&self, node_id: &str) -> Option<RoutingNode<'_>> {
        self.live.get(node_id).map(|node| RoutingNode {
            node,
            shards: self
                .assigned
                .get(node_id)
                .map(Vec::as_slice)
                .unwrap_or(&[]),
        })
    }

    /// All live data nodes, ordered by id
    pub fn routing_nodes(&self) -> impl Iterator<Item = RoutingNode<'_>> {
        self.live.keys().filter_map(|id| self.routing_node(id))
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        self.live.keys().cloned().collect()
    }

    pub fn unassigned(&self) -> &[ShardRouting] {
        &self.unassigned
    }

    pub fn take_unassigned(&mut self) -> Vec<ShardRouting> {
        std::mem::take(&mut self.unassigned)
    }

    pub fn add_unassigned(&mut self, shard: ShardRouting) {
        debug_assert!(shard.unassigned(), "{} is assigned", shard);
        self.unassigned.push(shard);
    }

    /// Copies assigned to nodes that are no longer live data nodes
    pub fn departed(&self) -> Vec<ShardRouting> {
        self.assigned
            .iter()
            .filter(|(node_id, _)| !self.live.contains_key(*node_id))
            .flat_map(|(_, shards)| shards.iter().cloned())
            .collect()
    }

    /// Find the assigned copy with this allocation id on this node
    pub fn get(&self, node_id: &str, shard_id: &ShardId, allocation_id: &str) -> Option<&ShardRouting> {
        self.assigned.get(node_id)?.iter().find(|s| {
            &s.shard_id == shard_id && s.allocation_id.as_deref() == Some(allocation_id)
        })
    }

    /// Whether this exact assignment is still present
    pub fn contains(&self, shard: &ShardRouting) -> bool {
        match (&shard.current_node, &shard.allocation_id) {
            (Some(node_id), Some(allocation_id)) => self.get(node_id, &shard.shard_id, allocation_id).is_some(),
            _ => false,
        }
    }

    /// Every assigned copy of a shard
    pub fn copies(&self, shard_id: &ShardId) -> Vec<&ShardRouting> {
        self.assigned
            .values()
            .flat_map(|shards| shards.iter())
            .filter(|s| &s.shard_id == shard_id)
            .collect()
    }

    pub fn active_primary(&self, shard_id: &ShardId) -> Option<&ShardRouting> {
        self.copies(shard_id)
            .into_iter()
            .find(|s| s.primary && s.active())
    }

    /// An active replica on a live node, preferring ones that are not
    /// relocating
    pub fn active_replica(&self, shard_id: &ShardId) -> Option<&ShardRouting> {
        let candidates: Vec<_> = self
            .copies(shard_id)
            .into_iter()
            .filter(|s| !s.primary && s.active())
            .filter(|s| s.current_node.as_ref().is_some_and(|n| self.live.contains_key(n)))
            .collect();
        candidates
            .iter()
            .find(|s| s.started())
            .or_else(|| candidates.first())
            .copied()
    }

    /// Initializing target paired with a relocating source
    pub fn relocation_target_of(&self, source: &ShardRouting) -> Option<ShardRouting> {
        let target_node = source.relocating_node.as_ref()?;
        self.assigned
            .get(target_node)?
            .iter()
            .find(|s| {
                s.shard_id == source.shard_id
                    && s.is_relocation_target()
                    && s.relocating_node == source.current_node
            })
            .cloned()
    }

    /// Relocating source paired with an initializing target
    pub fn relocation_source_of(&self, target: &ShardRouting) -> Option<ShardRouting> {
        let source_node = target.relocating_node.as_ref()?;
        self.assigned
            .get(source_node)?
            .iter()
            .find(|s| {
                s.shard_id == target.shard_id
                    && s.relocating()
                    && s.relocating_node == target.current_node
            })
            .cloned()
    }

    pub fn add_assigned(&mut self, shard: ShardRouting) {
        if let Some(node_id) = shard.current_node.clone() {
            self.assigned.entry(node_id).or_default().push(shard);
        }
    }

    /// Replace `current` (matched by node and allocation id) with `updated`
    /// on the same node
    pub fn replace(&mut self, current: &ShardRouting, updated: ShardRouting) -> bool {
        let Some(slot) = self.position_mut(current) else {
            return false;
        };
        *slot = updated;
        true
    }

    pub fn remove(&mut self, shard: &ShardRouting) -> bool {
        let Some(node_id) = shard.current_node.as_ref() else {
            return false;
        };
        let Some(shards) = self.assigned.get_mut(node_id) else {
            return false;
        };
        let before = shards.len();
        shards.retain(|s| !s.is_same_allocation(shard));
        let removed = shards.len() != before;
        if shards.is_empty() {
            self.assigned.remove(node_id);
        }
        removed
    }

    fn position_mut(&mut self, shard: &ShardRouting) -> Option<&mut ShardRouting> {
        let node_id = shard.current_node.as_ref()?;
        self.assigned
            .get_mut(node_id)?
            .iter_mut()
            .find(|s| s.is_same_allocation(shard))
    }

    /// Assign an unassigned copy to a node with a fresh allocation id
    pub fn initialize(&mut self, shard: &ShardRouting, node_id: &str) -> ShardRouting {
        let initialized = shard.initialize(node_id.to_string(), new_allocation_id());
        self.add_assigned(initialized.clone());
        initialized
    }

    /// Start relocating a started copy; returns the new target copy
    pub fn relocate(&mut self, shard: &ShardRouting, target_node: &str) -> ShardRouting {
        let source = shard.relocate(target_node.to_string());
        let target = source.build_target_relocating_shard(new_allocation_id());
        self.replace(shard, source);
        self.add_assigned(target.clone());
        target
    }

    /// Copies assigned across all nodes (live and departed)
    pub fn assigned_count(&self) -> usize {
        self.assigned.values().map(Vec::len).sum()
    }

    pub fn to_routing_table(&self, version: u64) -> RoutingTable {
        let assigned = self.assigned.values().flat_map(|shards| shards.iter().cloned());
        RoutingTable::from_shards(version, assigned.chain(self.unassigned.iter().cloned()))
    }
}

fn new_allocation_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
