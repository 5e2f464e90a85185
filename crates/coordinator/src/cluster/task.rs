//! Batched cluster state tasks

use std::fmt;
use std::sync::Arc;

use cluster_core::ClusterState;

use crate::error::ShardStateError;

/// Outcome reported to the submitter of one task
pub type TaskResult = Result<(), ShardStateError>;

/// Queue priority; the runner always drains the highest non-empty queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    Normal,
    High,
    Urgent,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Priority::Normal => write!(f, "NORMAL"),
            Priority::High => write!(f, "HIGH"),
            Priority::Urgent => write!(f, "URGENT"),
        }
    }
}

/// Result of running one batch against a base state
#[derive(Debug, Clone)]
pub struct BatchResult {
    /// The new state, or the base state itself when nothing changed
    pub state: Arc<ClusterState>,
    /// One entry per task, in submission order
    pub results: Vec<TaskResult>,
}

impl BatchResult {
    pub fn unchanged(current: &Arc<ClusterState>, tasks: usize) -> Self {
        Self {
            state: current.clone(),
            results: vec![Ok(()); tasks],
        }
    }
}

/// Computes a new cluster state for a batch of tasks of one kind
pub trait ClusterStateTaskExecutor<T>: Send + Sync {
    /// Apply every task to `current`. Must not fail as a whole; failures
    /// are reported per task.
    fn execute(&self, current: &Arc<ClusterState>, tasks: &[T]) -> BatchResult;

    /// Called after a state produced by this executor was committed
    fn cluster_state_published(&self, _state: &Arc<ClusterState>) {}
}
