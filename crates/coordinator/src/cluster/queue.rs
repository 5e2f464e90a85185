//! Master task queues

use std::sync::Arc;

use cluster_core::ClusterState;
use tokio::sync::{oneshot, watch, Notify};
use tracing::trace;

use super::pending::PendingTasks;
use super::task::{BatchResult, ClusterStateTaskExecutor, Priority, TaskResult};
use crate::error::ShardStateError;

/// A batch that has been computed but not yet committed
pub(crate) struct ExecutedBatch {
    pub state: Arc<ClusterState>,
    pub tasks: usize,
    completion: Box<dyn FnOnce(Result<Arc<ClusterState>, ShardStateError>, bool) + Send>,
}

impl ExecutedBatch {
    /// Resolve every task of the batch. `changed` is true when `Ok`
    /// carries a newly committed state.
    pub fn complete(self, outcome: Result<Arc<ClusterState>, ShardStateError>, changed: bool) {
        (self.completion)(outcome, changed)
    }
}

/// Type-erased view of a queue used by the cluster service runner
pub(crate) trait BatchSource: Send + Sync {
    fn source(&self) -> &'static str;
    fn priority(&self) -> Priority;
    fn has_pending(&self) -> bool;
    fn execute(&self, current: &Arc<ClusterState>) -> Option<ExecutedBatch>;
    fn fail_all(&self, error: &ShardStateError) -> usize;
}

pub(crate) struct QueueInner<T> {
    source: &'static str,
    priority: Priority,
    executor: Arc<dyn ClusterStateTaskExecutor<T>>,
    pending: PendingTasks<T>,
    wakeup: Arc<Notify>,
    closed: watch::Receiver<bool>,
}

impl<T> QueueInner<T> {
    pub fn new(
        source: &'static str,
        priority: Priority,
        executor: Arc<dyn ClusterStateTaskExecutor<T>>,
        wakeup: Arc<Notify>,
        closed: watch::Receiver<bool>,
    ) -> Self {
        Self {
            source,
            priority,
            executor,
            pending: PendingTasks::new(),
            wakeup,
            closed,
        }
    }
}

impl<T: Send + 'static> BatchSource for QueueInner<T> {
    fn source(&self) -> &'static str {
        self.source
    }

    fn priority(&self) -> Priority {
        self.priority
    }

    fn has_pending(&self) -> bool {
        self.pending.queued() > 0
    }

    fn execute(&self, current: &Arc<ClusterState>) -> Option<ExecutedBatch> {
        let drained = self.pending.drain();
        if drained.is_empty() {
            return None;
        }
        let (ids, tasks): (Vec<u64>, Vec<T>) = drained.into_iter().unzip();
        trace!("[{}] executing batch of {} tasks", self.source, tasks.len());

        let BatchResult { state, mut results } = self.executor.execute(current, &tasks);
        let source = self.source;
        results.resize_with(ids.len(), || {
            Err(ShardStateError::Remote(format!("[{}] executor returned no result for task", source)))
        });

        let pending = self.pending.clone();
        let executor = self.executor.clone();
        let completion = move |outcome: Result<Arc<ClusterState>, ShardStateError>, changed: bool| match outcome {
            Ok(published) => {
                for (id, result) in ids.into_iter().zip(results) {
                    pending.complete(id, result);
                }
                if changed {
                    executor.cluster_state_published(&published);
                }
            }
            Err(error) => {
                for id in ids {
                    pending.complete(id, Err(error.clone()));
                }
            }
        };

        Some(ExecutedBatch {
            state,
            tasks: tasks.len(),
            completion: Box::new(completion),
        })
    }

    fn fail_all(&self, error: &ShardStateError) -> usize {
        self.pending.fail_all(error)
    }
}

/// Submission handle for one kind of master task
pub struct MasterTaskQueue<T> {
    inner: Arc<QueueInner<T>>,
}

impl<T> Clone for MasterTaskQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Send + 'static> MasterTaskQueue<T> {
    pub(crate) fn new(inner: Arc<QueueInner<T>>) -> Self {
        Self { inner }
    }

    pub fn source(&self) -> &'static str {
        self.inner.source
    }

    pub fn priority(&self) -> Priority {
        self.inner.priority
    }

    /// Queue a task; the receiver resolves once its batch is committed
    pub fn submit(&self, task: T) -> oneshot::Receiver<TaskResult> {
        let (id, rx) = self.inner.pending.register(task);
        if *self.inner.closed.borrow() {
            self.inner.pending.complete(id, Err(ShardStateError::NodeClosed));
        } else {
            self.inner.wakeup.notify_one();
        }
        rx
    }

    pub async fn submit_and_wait(&self, task: T) -> TaskResult {
        match self.submit(task).await {
            Ok(result) => result,
            Err(_) => Err(ShardStateError::NodeClosed),
        }
    }

    /// Tasks waiting for the next batch
    pub fn queued(&self) -> usize {
        self.inner.pending.queued()
    }
}
