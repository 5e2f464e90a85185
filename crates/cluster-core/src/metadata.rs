//! Index and cluster metadata

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::settings::Settings;

/// Index UUID placeholder meaning "unknown, skip the stale check"
pub const INDEX_UUID_NA_VALUE: &str = "_na_";

/// Index metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexMetadata {
    /// Index name
    pub name: String,
    /// Unique per incarnation of the index (changes on delete/recreate)
    pub uuid: String,
    pub number_of_shards: u32,
    pub number_of_replicas: u32,
    /// Index-scoped settings (`index.routing.allocation.*`, ...)
    #[serde(default)]
    pub settings: Settings,
}

impl IndexMetadata {
    /// Create index metadata with a fresh UUID
    pub fn new(name: impl Into<String>, number_of_shards: u32, number_of_replicas: u32) -> Self {
        Self {
            name: name.into(),
            uuid: uuid::Uuid::new_v4().to_string(),
            number_of_shards,
            number_of_replicas,
            settings: Settings::empty(),
        }
    }

    pub fn with_settings(mut self, settings: Settings) -> Self {
        self.settings = settings;
        self
    }

    /// Total number of shard copies (primaries and replicas)
    pub fn total_copies(&self) -> u32 {
        self.number_of_shards * (self.number_of_replicas + 1)
    }
}

/// Cluster-wide metadata
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    /// Persistent cluster settings applied on every node
    pub persistent_settings: Settings,
    pub indices: BTreeMap<String, IndexMetadata>,
}

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_index(mut self, index: IndexMetadata) -> Self {
        self.put_index(index);
        self
    }

    pub fn put_index(&mut self, index: IndexMetadata) {
        self.indices.insert(index.name.clone(), index);
    }

    pub fn index(&self, name: &str) -> Option<&IndexMetadata> {
        self.indices.get(name)
    }

    pub fn has_index(&self, name: &str) -> bool {
        self.indices.contains_key(name)
    }
}
