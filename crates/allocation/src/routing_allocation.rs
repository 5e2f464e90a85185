//! Per-pass allocation context

use std::sync::Arc;

use cluster_core::{ClusterState, DiscoveryNodes, Metadata};

use crate::decider::AllocationDeciders;
use crate::routing_nodes::RoutingNodes;

/// How much detail deciders record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DebugMode {
    /// Stop at the first NO, keep no explanations
    #[default]
    Off,
    /// Run every decider and keep every decision
    On,
    /// Run every decider but drop YES decisions from the result
    ExcludeYesDecisions,
}

/// State shared by the deciders and the allocator for one pass
pub struct RoutingAllocation<'a> {
    deciders: Arc<AllocationDeciders>,
    routing_nodes: RoutingNodes,
    state: &'a ClusterState,
    debug: DebugMode,
    explanations: Vec<String>,
    changed: bool,
}

impl<'a> RoutingAllocation<'a> {
    pub fn new(deciders: Arc<AllocationDeciders>, state: &'a ClusterState, debug: DebugMode) -> Self {
        Self {
            deciders,
            routing_nodes: RoutingNodes::new(state),
            state,
            debug,
            explanations: Vec::new(),
            changed: false,
        }
    }

    pub fn deciders(&self) -> &Arc<AllocationDeciders> {
        &self.deciders
    }

    pub fn routing_nodes(&self) -> &RoutingNodes {
        &self.routing_nodes
    }

    /// Mutable routing; callers must `mark_changed` when they mutate it
    pub fn routing_nodes_mut(&mut self) -> &mut RoutingNodes {
        &mut self.routing_nodes
    }

    pub fn state(&self) -> &'a ClusterState {
        self.state
    }

    pub fn metadata(&self) -> &'a Metadata {
        &self.state.metadata
    }

    pub fn nodes(&self) -> &'a DiscoveryNodes {
        &self.state.nodes
    }

    pub fn debug_mode(&self) -> DebugMode {
        self.debug
    }

    pub fn set_debug_mode(&mut self, debug: DebugMode) {
        self.debug = debug;
    }

    pub fn debug_decision(&self) -> bool {
        self.debug != DebugMode::Off
    }

    pub fn add_explanation(&mut self, explanation: impl Into<String>) {
        if self.debug_decision() {
            self.explanations.push(explanation.into());
        }
    }

    pub fn explanations(&self) -> &[String] {
        &self.explanations
    }

    pub fn mark_changed(&mut self) {
        self.changed = true;
    }

    pub fn changed(&self) -> bool {
        self.changed
    }

    pub(crate) fn into_parts(self) -> (RoutingNodes, bool, Vec<String>) {
        (self.routing_nodes, self.changed, self.explanations)
    }
}
