//! Routing table definitions
//!
//! Maps every shard copy of every index to its node and lifecycle state.
//! A relocation shows up as two entries: the `Relocating` source and the
//! `Initializing` target on the destination node.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

use crate::metadata::{IndexMetadata, Metadata};
use crate::shard::{ShardId, ShardRouting, ShardRoutingState, UnassignedInfo, UnassignedReason};

/// All copies of one shard
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexShardRoutingTable {
    pub shard_id: ShardId,
    pub shards: Vec<ShardRouting>,
}

impl IndexShardRoutingTable {
    pub fn new(shard_id: ShardId) -> Self {
        Self {
            shard_id,
            shards: Vec::new(),
        }
    }

    /// The primary copy (ignoring relocation targets)
    pub fn primary_shard(&self) -> Option<&ShardRouting> {
        self.shards
            .iter()
            .find(|s| s.primary && !s.is_relocation_target())
    }

    pub fn replica_shards(&self) -> impl Iterator<Item = &ShardRouting> {
        self.shards.iter().filter(|s| !s.primary)
    }

    pub fn active_shards(&self) -> impl Iterator<Item = &ShardRouting> {
        self.shards.iter().filter(|s| s.active())
    }

    pub fn assigned_shards(&self) -> impl Iterator<Item = &ShardRouting> {
        self.shards.iter().filter(|s| s.assigned_to_node())
    }

    pub fn get_by_allocation_id(&self, allocation_id: &str) -> Option<&ShardRouting> {
        self.shards
            .iter()
            .find(|s| s.allocation_id.as_deref() == Some(allocation_id))
    }
}

/// All shards of one index
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexRoutingTable {
    pub index: String,
    pub shards: BTreeMap<u32, IndexShardRoutingTable>,
}

impl IndexRoutingTable {
    pub fn new(index: impl Into<String>) -> Self {
        Self {
            index: index.into(),
            shards: BTreeMap::new(),
        }
    }

    pub fn shard(&self, id: u32) -> Option<&IndexShardRoutingTable> {
        self.shards.get(&id)
    }
}

/// Routing table
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingTable {
    /// Incremented on every change
    pub version: u64,
    pub indices: BTreeMap<String, IndexRoutingTable>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a table from a flat list of copies
    pub fn from_shards(version: u64, shards: impl IntoIterator<Item = ShardRouting>) -> Self {
        let mut table = Self {
            version,
            indices: BTreeMap::new(),
        };
        for shard in shards {
            table.insert(shard);
        }
        table
    }

    fn insert(&mut self, shard: ShardRouting) {
        let index = self
            .indices
            .entry(shard.shard_id.index.clone())
            .or_insert_with(|| IndexRoutingTable::new(shard.shard_id.index.clone()));
        index
            .shards
            .entry(shard.shard_id.id)
            .or_insert_with(|| IndexShardRoutingTable::new(shard.shard_id.clone()))
            .shards
            .push(shard);
    }

    /// Add all copies of a new index as unassigned
    pub fn add_as_new(&mut self, index: &IndexMetadata) {
        for id in 0..index.number_of_shards {
            let shard_id = ShardId::new(index.name.clone(), id);
            for copy in 0..=index.number_of_replicas {
                let info = UnassignedInfo::new(UnassignedReason::IndexCreated, None);
                self.insert(ShardRouting::new_unassigned(shard_id.clone(), copy == 0, info));
            }
        }
        self.version += 1;
    }

    pub fn index(&self, name: &str) -> Option<&IndexRoutingTable> {
        self.indices.get(name)
    }

    pub fn shard_routing_table(&self, shard_id: &ShardId) -> Option<&IndexShardRoutingTable> {
        self.indices.get(&shard_id.index)?.shards.get(&shard_id.id)
    }

    pub fn all_shards(&self) -> impl Iterator<Item = &ShardRouting> {
        self.indices
            .values()
            .flat_map(|index| index.shards.values())
            .flat_map(|shard| shard.shards.iter())
    }

    pub fn shards_with_state(&self, state: ShardRoutingState) -> Vec<&ShardRouting> {
        self.all_shards().filter(|s| s.state == state).collect()
    }

    pub fn unassigned_count(&self) -> usize {
        self.all_shards().filter(|s| s.unassigned()).count()
    }

    pub fn has_unassigned(&self) -> bool {
        self.all_shards().any(|s| s.unassigned())
    }

    /// Check the table's structural invariants against the metadata.
    ///
    /// Returns a description of every violation found; an empty list means
    /// the table is consistent.
    pub fn validate(&self, metadata: &Metadata) -> Vec<String> {
        let mut problems = Vec::new();

        for name in self.indices.keys() {
            if !metadata.has_index(name) {
                problems.push(format!("index [{}] has routing but no metadata", name));
            }
        }

        for index_meta in metadata.indices.values() {
            let Some(index_table) = self.indices.get(&index_meta.name) else {
                problems.push(format!("index [{}] has no routing table", index_meta.name));
                continue;
            };
            for id in 0..index_meta.number_of_shards {
                let Some(shard_table) = index_table.shards.get(&id) else {
                    problems.push(format!("[{}][{}] missing from routing table", index_meta.name, id));
                    continue;
                };
                validate_shard(shard_table, index_meta, &mut problems);
            }
        }

        problems
    }
}

fn validate_shard(table: &IndexShardRoutingTable, index: &IndexMetadata, problems: &mut Vec<String>) {
    let shard_id = &table.shard_id;
    let copies: Vec<_> = table
        .shards
        .iter()
        .filter(|s| !s.is_relocation_target())
        .collect();

    let expected = index.number_of_replicas as usize + 1;
    if copies.len() != expected {
        problems.push(format!(
            "{} has {} copies, expected {}",
            shard_id,
            copies.len(),
            expected
        ));
    }

    let primaries = copies.iter().filter(|s| s.primary).count();
    if primaries != 1 {
        problems.push(format!("{} has {} primaries", shard_id, primaries));
    }

    let mut nodes = HashSet::new();
    for shard in &table.shards {
        match (shard.state, &shard.current_node, &shard.allocation_id) {
            (ShardRoutingState::Unassigned, None, None) => {}
            (ShardRoutingState::Unassigned, _, _) => {
                problems.push(format!("unassigned copy still has an assignment: {}", shard));
            }
            (_, Some(node), Some(_)) => {
                if !nodes.insert(node.clone()) {
                    problems.push(format!("{} has two copies on node [{}]", shard_id, node));
                }
            }
            _ => problems.push(format!("assigned copy without node or allocation id: {}", shard)),
        }

        if shard.relocating() && !has_relocation_peer(table, shard) {
            problems.push(format!("relocating source has no target: {}", shard));
        }
        if shard.is_relocation_target() && !has_relocation_peer(table, shard) {
            problems.push(format!("relocation target has no source: {}", shard));
        }
    }
}

fn has_relocation_peer(table: &IndexShardRoutingTable, shard: &ShardRouting) -> bool {
    table.shards.iter().any(|other| {
        other.current_node == shard.relocating_node
            && other.relocating_node == shard.current_node
            && (other.relocating() || other.is_relocation_target())
            && other.relocating() != shard.relocating()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_as_new() {
        let index = IndexMetadata::new("idx", 2, 1);
        let mut table = RoutingTable::new();
        table.add_as_new(&index);

        assert_eq!(table.version, 1);
        assert_eq!(table.unassigned_count(), 4);
        let shard0 = table.shard_routing_table(&ShardId::new("idx", 0)).unwrap();
        assert!(shard0.primary_shard().is_some());
        assert_eq!(shard0.replica_shards().count(), 1);

        let metadata = Metadata::new().with_index(index);
        assert!(table.validate(&metadata).is_empty());
    }

    #[test]
    fn test_validate_detects_two_primaries() {
        let index = IndexMetadata::new("idx", 1, 1);
        let shard_id = ShardId::new("idx", 0);
        let info = UnassignedInfo::new(UnassignedReason::IndexCreated, None);
        let table = RoutingTable::from_shards(
            1,
            vec![
                ShardRouting::new_unassigned(shard_id.clone(), true, info.clone()),
                ShardRouting::new_unassigned(shard_id, true, info),
            ],
        );
        let problems = table.validate(&Metadata::new().with_index(index));
        assert_eq!(problems.len(), 1);
        assert!(problems[0].contains("2 primaries"));
    }

    #[test]
    fn test_validate_relocation_pair() {
        let index = IndexMetadata::new("idx", 1, 0);
        let shard_id = ShardId::new("idx", 0);
        let info = UnassignedInfo::new(UnassignedReason::IndexCreated, None);
        let source = ShardRouting::new_unassigned(shard_id, true, info)
            .initialize("n1".into(), "a1".into())
            .move_to_started()
            .relocate("n2".into());
        let target = source.build_target_relocating_shard("a2".into());
        let metadata = Metadata::new().with_index(index);

        let paired = RoutingTable::from_shards(1, vec![source.clone(), target]);
        assert!(paired.validate(&metadata).is_empty());

        let orphan = RoutingTable::from_shards(1, vec![source]);
        assert_eq!(orphan.validate(&metadata).len(), 1);
    }
}
