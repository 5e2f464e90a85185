//! Discovery node definitions

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Node ID
pub type NodeId = String;

/// Node role
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    /// Eligible to be elected master
    Master,
    /// Holds shard copies
    Data,
}

impl std::fmt::Display for NodeRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeRole::Master => write!(f, "master"),
            NodeRole::Data => write!(f, "data"),
        }
    }
}

/// A node as seen by cluster discovery
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryNode {
    /// Node ID
    pub id: NodeId,
    /// Human readable name
    pub name: String,
    /// Transport address (host:port)
    pub address: String,
    /// Custom attributes (rack, zone, ...) used by allocation filters
    pub attributes: BTreeMap<String, String>,
    /// Node roles
    pub roles: BTreeSet<NodeRole>,
}

impl DiscoveryNode {
    /// Create a master-eligible data node
    pub fn new(id: impl Into<NodeId>, address: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            address: address.into(),
            attributes: BTreeMap::new(),
            roles: [NodeRole::Master, NodeRole::Data].into_iter().collect(),
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn with_roles(mut self, roles: impl IntoIterator<Item = NodeRole>) -> Self {
        self.roles = roles.into_iter().collect();
        self
    }

    /// Host part of the transport address
    pub fn host(&self) -> &str {
        match self.address.rsplit_once(':') {
            Some((host, _)) => host,
            None => &self.address,
        }
    }

    pub fn is_data_node(&self) -> bool {
        self.roles.contains(&NodeRole::Data)
    }

    pub fn is_master_eligible(&self) -> bool {
        self.roles.contains(&NodeRole::Master)
    }
}

impl std::fmt::Display for DiscoveryNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{{{}}}{{{}}}", self.name, self.address)
    }
}

/// The set of nodes in the cluster plus the currently elected master
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryNodes {
    nodes: BTreeMap<NodeId, DiscoveryNode>,
    master_node_id: Option<NodeId>,
}

impl DiscoveryNodes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a node
    pub fn add(&mut self, node: DiscoveryNode) {
        self.nodes.insert(node.id.clone(), node);
    }

    /// Remove a node; clears the master if it was the removed node
    pub fn remove(&mut self, node_id: &str) -> Option<DiscoveryNode> {
        if self.master_node_id.as_deref() == Some(node_id) {
            self.master_node_id = None;
        }
        self.nodes.remove(node_id)
    }

    /// Set the elected master (must be a known node)
    pub fn set_master(&mut self, node_id: Option<NodeId>) -> bool {
        match node_id {
            Some(id) if !self.nodes.contains_key(&id) => false,
            other => {
                self.master_node_id = other;
                true
            }
        }
    }

    pub fn get(&self, node_id: &str) -> Option<&DiscoveryNode> {
        self.nodes.get(node_id)
    }

    pub fn contains(&self, node_id: &str) -> bool {
        self.nodes.contains_key(node_id)
    }

    pub fn master_node_id(&self) -> Option<&NodeId> {
        self.master_node_id.as_ref()
    }

    pub fn master_node(&self) -> Option<&DiscoveryNode> {
        self.master_node_id.as_ref().and_then(|id| self.nodes.get(id))
    }

    /// Whether the given node is the elected master in this view
    pub fn is_master(&self, node_id: &str) -> bool {
        self.master_node_id.as_deref() == Some(node_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &DiscoveryNode> {
        self.nodes.values()
    }

    pub fn data_nodes(&self) -> impl Iterator<Item = &DiscoveryNode> {
        self.nodes.values().filter(|n| n.is_data_node())
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
