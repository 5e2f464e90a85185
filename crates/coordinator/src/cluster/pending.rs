//! Pending task tracker
//!
//! Tracks tasks waiting for the next batch and the channel each
//! submitter waits on. Responses are completed individually once the
//! batch that contained the task was committed (or failed).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use super::task::TaskResult;
use crate::error::ShardStateError;

struct Inner<T> {
    tasks: Vec<(u64, T)>,
    /// task_id -> result_sender
    responses: HashMap<u64, oneshot::Sender<TaskResult>>,
}

/// Pending task tracker
pub struct PendingTasks<T> {
    next_id: Arc<AtomicU64>,
    inner: Arc<Mutex<Inner<T>>>,
}

impl<T> Clone for PendingTasks<T> {
    fn clone(&self) -> Self {
        Self {
            next_id: self.next_id.clone(),
            inner: self.inner.clone(),
        }
    }
}

impl<T> PendingTasks<T> {
    pub fn new() -> Self {
        Self {
            next_id: Arc::new(AtomicU64::new(1)),
            inner: Arc::new(Mutex::new(Inner {
                tasks: Vec::new(),
                responses: HashMap::new(),
            })),
        }
    }

    /// Register a task, returning its id and the receiver for its result
    pub fn register(&self, task: T) -> (u64, oneshot::Receiver<TaskResult>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        let mut inner = self.inner.lock();
        inner.tasks.push((id, task));
        inner.responses.insert(id, tx);
        (id, rx)
    }

    /// Take every queued task; their responses stay registered
    pub fn drain(&self) -> Vec<(u64, T)> {
        std::mem::take(&mut self.inner.lock().tasks)
    }

    /// Complete a task and send its result
    pub fn complete(&self, id: u64, result: TaskResult) {
        if let Some(tx) = self.inner.lock().responses.remove(&id) {
            let _ = tx.send(result);
        }
    }

    /// Fail every queued and in-flight task
    pub fn fail_all(&self, error: &ShardStateError) -> usize {
        let responses = {
            let mut inner = self.inner.lock();
            inner.tasks.clear();
            std::mem::take(&mut inner.responses)
        };
        let count = responses.len();
        for (_, tx) in responses {
            let _ = tx.send(Err(error.clone()));
        }
        count
    }

    /// Number of tasks waiting for a batch
    pub fn queued(&self) -> usize {
        self.inner.lock().tasks.len()
    }
}

impl<T> Default for PendingTasks<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_complete_individually() {
        let pending = PendingTasks::new();
        let (a, rx_a) = pending.register("a");
        let (b, rx_b) = pending.register("b");
        assert_eq!(pending.queued(), 2);

        let drained = pending.drain();
        assert_eq!(drained.iter().map(|(_, t)| *t).collect::<Vec<_>>(), vec!["a", "b"]);
        assert_eq!(pending.queued(), 0);

        pending.complete(b, Err(ShardStateError::NodeClosed));
        pending.complete(a, Ok(()));
        assert_eq!(rx_a.await.unwrap(), Ok(()));
        assert_eq!(rx_b.await.unwrap(), Err(ShardStateError::NodeClosed));
    }

    #[tokio::test]
    async fn test_fail_all_covers_in_flight() {
        let pending = PendingTasks::new();
        let (_, rx_in_flight) = pending.register(1);
        pending.drain();
        let (_, rx_queued) = pending.register(2);

        assert_eq!(pending.fail_all(&ShardStateError::NodeClosed), 2);
        assert_eq!(rx_in_flight.await.unwrap(), Err(ShardStateError::NodeClosed));
        assert_eq!(rx_queued.await.unwrap(), Err(ShardStateError::NodeClosed));
    }
}
