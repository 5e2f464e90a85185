//! Cluster service
//!
//! Holds the node's current cluster state, serializes state updates
//! through prioritized master task queues, and lets callers observe
//! state changes.

mod observer;
mod pending;
mod publisher;
mod queue;
mod service;
mod task;

pub use observer::{master_changed, ClusterStateObserver};
pub use pending::PendingTasks;
pub use publisher::ClusterStatePublisher;
pub use queue::MasterTaskQueue;
pub use service::ClusterService;
pub use task::{BatchResult, ClusterStateTaskExecutor, Priority, TaskResult};
