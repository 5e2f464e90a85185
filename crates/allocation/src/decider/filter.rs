//! Attribute filters
//!
//! Cluster-wide filters come from `cluster.routing.allocation.{require,include,exclude}.<attr>`
//! and are rebuilt whenever those settings change. Index filters come from
//! `index.routing.allocation.{require,include,exclude}.<attr>` in the
//! index metadata. A copy may only live on a node that passes both layers.
//!
//! Besides custom node attributes the filters understand `_id`, `_name`
//! and `_host`. Values are comma separated and may contain `*` wildcards.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use cluster_core::{ClusterSettings, DiscoveryNode, Settings, ShardRouting};
use parking_lot::RwLock;
use tracing::{info, warn};

use super::AllocationDecider;
use crate::decision::{Decision, DecisionType};
use crate::routing_allocation::RoutingAllocation;
use crate::routing_nodes::RoutingNode;

const NAME: &str = "filter";

const CLUSTER_PREFIX: &str = "cluster.routing.allocation";
const INDEX_PREFIX: &str = "index.routing.allocation";

/// How the per-attribute results of a filter set combine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpType {
    /// Every attribute must match
    And,
    /// Any attribute matching is enough
    Or,
}

/// A set of attribute filters, each with one or more accepted values
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryNodeFilters {
    op: OpType,
    filters: BTreeMap<String, Vec<String>>,
}

impl DiscoveryNodeFilters {
    /// Build from settings already stripped of their prefix. Returns `None`
    /// when no attribute has a non-empty value.
    pub fn build(op: OpType, settings: &Settings) -> Option<Self> {
        let filters: BTreeMap<String, Vec<String>> = settings
            .iter()
            .filter_map(|(attr, value)| {
                let values: Vec<String> = value
                    .split(',')
                    .map(str::trim)
                    .filter(|v| !v.is_empty())
                    .map(str::to_string)
                    .collect();
                (!values.is_empty()).then(|| (attr.to_string(), values))
            })
            .collect();

        if filters.is_empty() {
            None
        } else {
            Some(Self { op, filters })
        }
    }

    pub fn matches(&self, node: &DiscoveryNode) -> bool {
        for (attr, values) in &self.filters {
            let matched = match node_value(node, attr) {
                Some(actual) => values.iter().any(|v| simple_match(v, actual)),
                None => false,
            };
            match self.op {
                OpType::And if !matched => return false,
                OpType::Or if matched => return true,
                _ => {}
            }
        }
        self.op == OpType::And
    }
}

impl fmt::Display for DiscoveryNodeFilters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (attr, values)) in self.filters.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{}:\"{}\"", attr, values.join(","))?;
        }
        Ok(())
    }
}

fn node_value<'a>(node: &'a DiscoveryNode, attr: &str) -> Option<&'a str> {
    match attr {
        "_id" => Some(node.id.as_str()),
        "_name" => Some(node.name.as_str()),
        "_host" | "_ip" => Some(node.host()),
        other => node.attributes.get(other).map(String::as_str),
    }
}

/// Glob match supporting `*` anywhere in the pattern
fn simple_match(pattern: &str, value: &str) -> bool {
    let Some(first_star) = pattern.find('*') else {
        return pattern == value;
    };
    let (prefix, rest) = pattern.split_at(first_star);
    let Some(mut remaining) = value.strip_prefix(prefix) else {
        return false;
    };

    let parts: Vec<&str> = rest.split('*').collect();
    // rest starts with '*', so parts[0] is empty
    let last = parts.len() - 1;
    for (i, part) in parts.iter().enumerate().skip(1) {
        if part.is_empty() {
            continue;
        }
        if i == last {
            return remaining.len() >= part.len() && remaining.ends_with(part);
        }
        match remaining.find(part) {
            Some(pos) => remaining = &remaining[pos + part.len()..],
            None => return false,
        }
    }
    true
}

/// One generation of require/include/exclude filters under a prefix
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterSet {
    pub require: Option<DiscoveryNodeFilters>,
    pub include: Option<DiscoveryNodeFilters>,
    pub exclude: Option<DiscoveryNodeFilters>,
}

impl FilterSet {
    fn from_settings(settings: &Settings, prefix: &str) -> Self {
        let group = |kind: &str, op| DiscoveryNodeFilters::build(op, &settings.by_prefix(&format!("{}.{}.", prefix, kind)));
        Self {
            require: group("require", OpType::And),
            include: group("include", OpType::And),
            exclude: group("exclude", OpType::Or),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.require.is_none() && self.include.is_none() && self.exclude.is_none()
    }

    /// Explanation of the first filter the node violates, if any
    fn violation(&self, node: &DiscoveryNode, scope: &str, prefix: &str) -> Option<String> {
        if let Some(require) = &self.require {
            if !require.matches(node) {
                return Some(format!(
                    "node does not match {} setting [{}.require] filters [{}]",
                    scope, prefix, require
                ));
            }
        }
        if let Some(include) = &self.include {
            if !include.matches(node) {
                return Some(format!(
                    "node does not match {} setting [{}.include] filters [{}]",
                    scope, prefix, include
                ));
            }
        }
        if let Some(exclude) = &self.exclude {
            if exclude.matches(node) {
                return Some(format!(
                    "node matches {} setting [{}.exclude] filters [{}]",
                    scope, prefix, exclude
                ));
            }
        }
        None
    }
}

/// Require/include/exclude filtering at cluster and index scope
pub struct FilterAllocationDecider {
    cluster_filters: Arc<RwLock<Arc<FilterSet>>>,
}

impl FilterAllocationDecider {
    pub fn new(settings: &Settings, cluster_settings: &ClusterSettings) -> Self {
        let initial = FilterSet::from_settings(settings, CLUSTER_PREFIX);
        let cluster_filters = Arc::new(RwLock::new(Arc::new(initial)));

        let target = cluster_filters.clone();
        cluster_settings.add_settings_update_consumer(
            &[
                "cluster.routing.allocation.require.",
                "cluster.routing.allocation.include.",
                "cluster.routing.allocation.exclude.",
            ],
            move |snapshot| {
                let next = Arc::new(FilterSet::from_settings(snapshot, CLUSTER_PREFIX));
                info!(
                    "Updated cluster allocation filters: require [{}], include [{}], exclude [{}]",
                    describe(&next.require),
                    describe(&next.include),
                    describe(&next.exclude)
                );
                *target.write() = next;
            },
        );

        Self { cluster_filters }
    }

    /// The current cluster filter generation
    pub fn cluster_filters(&self) -> Arc<FilterSet> {
        self.cluster_filters.read().clone()
    }

    fn should_filter(&self, shard: &ShardRouting, node: &RoutingNode<'_>, allocation: &RoutingAllocation<'_>) -> Decision {
        let node = node.node();

        match allocation.metadata().index(&shard.shard_id.index) {
            Some(index) => {
                let index_filters = FilterSet::from_settings(&index.settings, INDEX_PREFIX);
                if let Some(reason) = index_filters.violation(node, "index", INDEX_PREFIX) {
                    return Decision::single(DecisionType::No, NAME, reason);
                }
            }
            None => warn!("No metadata for index of {} while filtering", shard.shard_id),
        }

        // One generation per call; a concurrent update swaps the Arc
        let cluster = self.cluster_filters();
        if let Some(reason) = cluster.violation(node, "cluster", CLUSTER_PREFIX) {
            return Decision::single(DecisionType::No, NAME, reason);
        }

        Decision::single(DecisionType::Yes, NAME, "node passes include/exclude/require filters")
    }
}

fn describe(filters: &Option<DiscoveryNodeFilters>) -> String {
    filters.as_ref().map(|f| f.to_string()).unwrap_or_default()
}

impl AllocationDecider for FilterAllocationDecider {
    fn name(&self) -> &'static str {
        NAME
    }

    fn can_allocate(&self, shard: &ShardRouting, node: &RoutingNode<'_>, allocation: &RoutingAllocation<'_>) -> Decision {
        self.should_filter(shard, node, allocation)
    }

    fn can_remain(&self, shard: &ShardRouting, node: &RoutingNode<'_>, allocation: &RoutingAllocation<'_>) -> Decision {
        self.should_filter(shard, node, allocation)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use crate::routing_allocation::DebugMode;
    use crate::AllocationDeciders;
    use cluster_core::IndexMetadata;

    fn decide(
        decider: &FilterAllocationDecider,
        state: &cluster_core::ClusterState,
        node_id: &str,
    ) -> Decision {
        let deciders = Arc::new(AllocationDeciders::new(Vec::new()));
        let allocation = RoutingAllocation::new(deciders, state, DebugMode::Off);
        let shard = allocation.routing_nodes().unassigned()[0].clone();
        let node = allocation.routing_nodes().routing_node(node_id).unwrap();
        decider.can_allocate(&shard, &node, &allocation)
    }

    #[test]
    fn test_simple_match() {
        assert!(simple_match("r1", "r1"));
        assert!(!simple_match("r1", "r2"));
        assert!(simple_match("r*", "rack1"));
        assert!(simple_match("*1", "rack1"));
        assert!(simple_match("*ck*", "rack1"));
        assert!(simple_match("r*c*1", "rack1"));
        assert!(!simple_match("r*x*", "rack1"));
        assert!(!simple_match("ab*ba", "aba"));
        assert!(simple_match("*", ""));
    }

    #[test]
    fn test_no_filters_is_yes() {
        let cluster_settings = ClusterSettings::default();
        let decider = FilterAllocationDecider::new(&Settings::empty(), &cluster_settings);
        let state = make_state(
            vec![make_node("n1").with_attribute("rack", "r1")],
            vec![IndexMetadata::new("idx", 1, 0)],
        );
        assert!(decider.cluster_filters().is_empty());
        assert_eq!(decide(&decider, &state, "n1").kind(), DecisionType::Yes);
    }

    #[test]
    fn test_cluster_exclude_after_settings_update() {
        let cluster_settings = ClusterSettings::default();
        let decider = FilterAllocationDecider::new(&Settings::empty(), &cluster_settings);
        let state = make_state(
            vec![
                make_node("n1").with_attribute("rack", "r1"),
                make_node("n2").with_attribute("rack", "r2"),
            ],
            vec![IndexMetadata::new("idx", 1, 0), IndexMetadata::new("other", 2, 1)],
        );

        let update = Settings::builder()
            .put("cluster.routing.allocation.exclude.rack", "r1")
            .build();
        assert_eq!(cluster_settings.apply_settings(update), 1);

        let first = decide(&decider, &state, "n1");
        let second = decide(&decider, &state, "n1");
        assert_eq!(first, second);
        assert_eq!(first.kind(), DecisionType::No);
        let reason = first.explanation().unwrap();
        assert!(reason.contains("[cluster.routing.allocation.exclude]"), "{}", reason);
        assert!(reason.contains("rack:\"r1\""), "{}", reason);

        assert_eq!(decide(&decider, &state, "n2").kind(), DecisionType::Yes);
    }

    #[test]
    fn test_include_ands_attributes_and_ors_values() {
        let settings = Settings::builder()
            .put("cluster.routing.allocation.include.rack", "r1,r2")
            .put("cluster.routing.allocation.include.zone", "z*")
            .build();
        let cluster_settings = ClusterSettings::new(settings.clone());
        let decider = FilterAllocationDecider::new(&settings, &cluster_settings);
        let state = make_state(
            vec![
                make_node("n1").with_attribute("rack", "r2").with_attribute("zone", "z1"),
                make_node("n2").with_attribute("rack", "r2"),
                make_node("n3").with_attribute("rack", "r3").with_attribute("zone", "z1"),
            ],
            vec![IndexMetadata::new("idx", 1, 0)],
        );

        assert_eq!(decide(&decider, &state, "n1").kind(), DecisionType::Yes);
        assert_eq!(decide(&decider, &state, "n2").kind(), DecisionType::No);
        assert_eq!(decide(&decider, &state, "n3").kind(), DecisionType::No);
    }

    #[test]
    fn test_index_require_by_node_id() {
        let cluster_settings = ClusterSettings::default();
        let decider = FilterAllocationDecider::new(&Settings::empty(), &cluster_settings);
        let index = IndexMetadata::new("idx", 1, 0).with_settings(
            Settings::builder()
                .put("index.routing.allocation.require._id", "n2")
                .build(),
        );
        let state = make_state(vec![make_node("n1"), make_node("n2")], vec![index]);

        let decision = decide(&decider, &state, "n1");
        assert_eq!(decision.kind(), DecisionType::No);
        assert!(decision
            .explanation()
            .unwrap()
            .contains("index setting [index.routing.allocation.require]"));
        assert_eq!(decide(&decider, &state, "n2").kind(), DecisionType::Yes);
    }

    #[test]
    fn test_cluster_scope_not_relaxed_by_index_scope() {
        let settings = Settings::builder()
            .put("cluster.routing.allocation.exclude._name", "n1")
            .build();
        let cluster_settings = ClusterSettings::new(settings.clone());
        let decider = FilterAllocationDecider::new(&settings, &cluster_settings);
        let index = IndexMetadata::new("idx", 1, 0).with_settings(
            Settings::builder()
                .put("index.routing.allocation.include._name", "n1")
                .build(),
        );
        let state = make_state(vec![make_node("n1"), make_node("n2")], vec![index]);

        assert_eq!(decide(&decider, &state, "n1").kind(), DecisionType::No);
        assert_eq!(decide(&decider, &state, "n2").kind(), DecisionType::No);
    }

    #[test]
    fn test_clearing_setting_removes_filter() {
        let settings = Settings::builder()
            .put("cluster.routing.allocation.exclude.rack", "r1")
            .build();
        let cluster_settings = ClusterSettings::new(settings.clone());
        let decider = FilterAllocationDecider::new(&settings, &cluster_settings);
        assert!(decider.cluster_filters().exclude.is_some());

        cluster_settings.apply_settings(Settings::empty());
        assert!(decider.cluster_filters().is_empty());
    }
}
