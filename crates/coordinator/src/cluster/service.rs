//! Cluster service
//!
//! Every state update on the master goes through one runner loop, so two
//! batches never compute against the same base state. Intake is
//! concurrent: any task may submit to a queue at any time.

use std::sync::Arc;

use cluster_core::{ClusterSettings, ClusterState, DiscoveryNode, Settings};
use parking_lot::{Mutex, RwLock};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::publisher::ClusterStatePublisher;
use super::queue::{BatchSource, MasterTaskQueue, QueueInner};
use super::task::{ClusterStateTaskExecutor, Priority};
use crate::error::ShardStateError;

/// Cluster service
pub struct ClusterService {
    local_node: DiscoveryNode,
    /// Node-level settings; persistent cluster settings are layered on top
    node_settings: Settings,
    cluster_settings: Arc<ClusterSettings>,
    publisher: Arc<dyn ClusterStatePublisher>,
    state_tx: watch::Sender<Arc<ClusterState>>,
    closed_tx: watch::Sender<bool>,
    queues: RwLock<Vec<Arc<dyn BatchSource>>>,
    wakeup: Arc<Notify>,
    /// Serializes appliers so the version check and the install are atomic
    apply_lock: Mutex<()>,
}

impl ClusterService {
    pub fn new(
        local_node: DiscoveryNode,
        node_settings: Settings,
        cluster_settings: Arc<ClusterSettings>,
        initial_state: ClusterState,
        publisher: Arc<dyn ClusterStatePublisher>,
    ) -> Self {
        let (state_tx, _) = watch::channel(Arc::new(initial_state));
        let (closed_tx, _) = watch::channel(false);
        Self {
            local_node,
            node_settings,
            cluster_settings,
            publisher,
            state_tx,
            closed_tx,
            queues: RwLock::new(Vec::new()),
            wakeup: Arc::new(Notify::new()),
            apply_lock: Mutex::new(()),
        }
    }

    pub fn local_node(&self) -> &DiscoveryNode {
        &self.local_node
    }

    pub fn cluster_settings(&self) -> &Arc<ClusterSettings> {
        &self.cluster_settings
    }

    /// The last applied cluster state
    pub fn state(&self) -> Arc<ClusterState> {
        self.state_tx.borrow().clone()
    }

    pub fn is_master(&self) -> bool {
        self.state().nodes.is_master(&self.local_node.id)
    }

    pub fn is_closed(&self) -> bool {
        *self.closed_tx.borrow()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<Arc<ClusterState>> {
        self.state_tx.subscribe()
    }

    pub(crate) fn subscribe_closed(&self) -> watch::Receiver<bool> {
        self.closed_tx.subscribe()
    }

    /// Create a queue whose tasks are batched and run by `executor`
    pub fn create_task_queue<T: Send + 'static>(
        &self,
        source: &'static str,
        priority: Priority,
        executor: Arc<dyn ClusterStateTaskExecutor<T>>,
    ) -> MasterTaskQueue<T> {
        let inner = Arc::new(QueueInner::new(
            source,
            priority,
            executor,
            self.wakeup.clone(),
            self.closed_tx.subscribe(),
        ));
        self.queues.write().push(inner.clone());
        debug!("Registered master task queue [{}] with priority {}", source, priority);
        MasterTaskQueue::new(inner)
    }

    /// Install a committed state on this node.
    ///
    /// States not newer than the current one are ignored. Returns whether
    /// the state was applied. Safe to call from several threads: the
    /// installed version never goes backwards and persistent settings are
    /// re-applied in version order.
    pub fn apply_state(&self, state: Arc<ClusterState>) -> bool {
        let _guard = self.apply_lock.lock();
        let current = self.state();
        if state.version <= current.version {
            trace!(
                "Node [{}] ignoring cluster state version {} (current {})",
                self.local_node.id,
                state.version,
                current.version
            );
            return false;
        }

        if state.metadata.persistent_settings != current.metadata.persistent_settings {
            let effective = self.node_settings.merged_with(&state.metadata.persistent_settings);
            let notified = self.cluster_settings.apply_settings(effective);
            debug!(
                "Node [{}] applied persistent cluster settings, {} consumers notified",
                self.local_node.id, notified
            );
        }

        let was_master = current.nodes.is_master(&self.local_node.id);
        let is_master = state.nodes.is_master(&self.local_node.id);
        if was_master != is_master {
            info!(
                "Node [{}] {} master at cluster state version {}",
                self.local_node.id,
                if is_master { "became" } else { "is no longer" },
                state.version
            );
        }

        debug!(
            "Node [{}] applied cluster state version {} (master [{}])",
            self.local_node.id,
            state.version,
            state.nodes.master_node_id().map(String::as_str).unwrap_or("none")
        );
        let installed = self.state_tx.send_if_modified(|slot| {
            if state.version <= slot.version {
                return false;
            }
            *slot = state;
            true
        });
        if !installed {
            return false;
        }
        if is_master {
            self.wakeup.notify_one();
        }
        true
    }

    /// Spawn the batch runner
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let service = self.clone();
        tokio::spawn(async move { service.run().await })
    }

    async fn run(&self) {
        let mut closed = self.closed_tx.subscribe();
        info!("Cluster service for node [{}] started", self.local_node.id);
        loop {
            if *closed.borrow_and_update() {
                break;
            }
            match self.next_batch_source() {
                Some(queue) => self.run_batch(queue).await,
                None => {
                    tokio::select! {
                        _ = self.wakeup.notified() => {}
                        _ = closed.changed() => {}
                    }
                }
            }
        }
        info!("Cluster service for node [{}] stopped", self.local_node.id);
    }

    /// Highest-priority queue with pending tasks
    fn next_batch_source(&self) -> Option<Arc<dyn BatchSource>> {
        self.queues
            .read()
            .iter()
            .filter(|q| q.has_pending())
            .max_by_key(|q| q.priority())
            .cloned()
    }

    async fn run_batch(&self, queue: Arc<dyn BatchSource>) {
        let current = self.state();
        if !current.nodes.is_master(&self.local_node.id) {
            let failed = queue.fail_all(&ShardStateError::NotMaster(self.local_node.id.clone()));
            debug!(
                "Node [{}] is not master, failed {} [{}] tasks",
                self.local_node.id,
                failed,
                queue.source()
            );
            return;
        }

        let Some(batch) = queue.execute(&current) else {
            return;
        };

        if batch.state.same_state(&current) {
            trace!(
                "[{}] batch of {} tasks left cluster state version {} unchanged",
                queue.source(),
                batch.tasks,
                current.version
            );
            batch.complete(Ok(current), false);
            return;
        }

        let new_state = Arc::new(batch.state.builder().version(current.version + 1).build());
        debug!(
            "[{}] publishing cluster state version {} for {} tasks",
            queue.source(),
            new_state.version,
            batch.tasks
        );
        match self.publisher.publish(new_state.clone()).await {
            Ok(()) => {
                if self.apply_state(new_state.clone()) {
                    batch.complete(Ok(new_state), true);
                } else {
                    // a state of the same or a newer version won locally
                    warn!(
                        "[{}] cluster state version {} was superseded before it could be applied",
                        queue.source(),
                        new_state.version
                    );
                    batch.complete(Err(ShardStateError::NotMaster(self.local_node.id.clone())), false);
                }
            }
            Err(e) => {
                warn!(
                    "[{}] failed to publish cluster state version {}: {}",
                    queue.source(),
                    new_state.version,
                    e
                );
                batch.complete(Err(e), false);
            }
        }
    }

    /// Stop the runner, fail queued tasks and wake observers with
    /// `NodeClosed`
    pub fn close(&self) {
        if self.closed_tx.send_replace(true) {
            return;
        }
        let mut failed = 0;
        for queue in self.queues.read().iter() {
            failed += queue.fail_all(&ShardStateError::NodeClosed);
        }
        self.wakeup.notify_one();
        info!(
            "Closed cluster service for node [{}], failed {} pending tasks",
            self.local_node.id, failed
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::task::BatchResult;
    use async_trait::async_trait;
    use cluster_core::DiscoveryNodes;
    use parking_lot::Mutex;
    use std::time::Duration;

    struct RecordingPublisher {
        fail: Mutex<bool>,
        published: Mutex<Vec<u64>>,
    }

    #[async_trait]
    impl ClusterStatePublisher for RecordingPublisher {
        async fn publish(&self, state: Arc<ClusterState>) -> Result<(), ShardStateError> {
            if *self.fail.lock() {
                return Err(ShardStateError::FailedToCommit {
                    version: state.version,
                    reason: "test".into(),
                });
            }
            self.published.lock().push(state.version);
            Ok(())
        }
    }

    /// Renames the cluster to the concatenation of its tasks
    struct RenameExecutor {
        batches: Mutex<Vec<Vec<String>>>,
    }

    impl ClusterStateTaskExecutor<String> for RenameExecutor {
        fn execute(&self, current: &Arc<ClusterState>, tasks: &[String]) -> BatchResult {
            self.batches.lock().push(tasks.to_vec());
            let mut state = (**current).clone();
            state.cluster_name = tasks.join("+");
            BatchResult {
                state: Arc::new(state.builder().build()),
                results: tasks
                    .iter()
                    .map(|t| {
                        if t == "bad" {
                            Err(ShardStateError::Remote("bad task".into()))
                        } else {
                            Ok(())
                        }
                    })
                    .collect(),
            }
        }
    }

    fn make_service(master: bool) -> (Arc<ClusterService>, Arc<RecordingPublisher>) {
        let local = DiscoveryNode::new("n1", "127.0.0.1:9300");
        let mut nodes = DiscoveryNodes::new();
        nodes.add(local.clone());
        if master {
            nodes.set_master(Some("n1".into()));
        }
        let state = ClusterState::empty("test").builder().version(1).nodes(nodes).build();
        let publisher = Arc::new(RecordingPublisher {
            fail: Mutex::new(false),
            published: Mutex::new(Vec::new()),
        });
        let service = Arc::new(ClusterService::new(
            local,
            Settings::empty(),
            Arc::new(ClusterSettings::default()),
            state,
            publisher.clone(),
        ));
        (service, publisher)
    }

    #[tokio::test]
    async fn test_batches_tasks_and_publishes_once() {
        let (service, publisher) = make_service(true);
        let executor = Arc::new(RenameExecutor {
            batches: Mutex::new(Vec::new()),
        });
        let queue = service.create_task_queue("rename", Priority::High, executor.clone());

        // queued before the runner starts, so they land in one batch
        let a = queue.submit("a".to_string());
        let bad = queue.submit("bad".to_string());
        let b = queue.submit("b".to_string());
        let _runner = service.start();

        assert_eq!(a.await.unwrap(), Ok(()));
        assert!(matches!(bad.await.unwrap(), Err(ShardStateError::Remote(_))));
        assert_eq!(b.await.unwrap(), Ok(()));

        assert_eq!(executor.batches.lock().len(), 1);
        assert_eq!(*publisher.published.lock(), vec![2]);
        assert_eq!(service.state().version, 2);
        assert_eq!(service.state().cluster_name, "a+bad+b");
        service.close();
    }

    #[tokio::test]
    async fn test_not_master_fails_tasks() {
        let (service, _) = make_service(false);
        let executor = Arc::new(RenameExecutor {
            batches: Mutex::new(Vec::new()),
        });
        let queue = service.create_task_queue("rename", Priority::Normal, executor.clone());
        let _runner = service.start();

        let result = tokio::time::timeout(Duration::from_secs(5), queue.submit_and_wait("x".into()))
            .await
            .unwrap();
        assert_eq!(result, Err(ShardStateError::NotMaster("n1".into())));
        assert!(executor.batches.lock().is_empty());
        service.close();
    }

    #[tokio::test]
    async fn test_failed_commit_fails_every_task() {
        let (service, publisher) = make_service(true);
        *publisher.fail.lock() = true;
        let executor = Arc::new(RenameExecutor {
            batches: Mutex::new(Vec::new()),
        });
        let queue = service.create_task_queue("rename", Priority::Urgent, executor);
        let a = queue.submit("a".into());
        let b = queue.submit("b".into());
        let _runner = service.start();

        for rx in [a, b] {
            let result = rx.await.unwrap();
            assert!(matches!(result, Err(ShardStateError::FailedToCommit { version: 2, .. })));
        }
        assert_eq!(service.state().version, 1);
        service.close();
    }

    #[tokio::test]
    async fn test_higher_priority_queue_drains_first() {
        let (service, _) = make_service(true);
        let executor = Arc::new(RenameExecutor {
            batches: Mutex::new(Vec::new()),
        });
        let normal = service.create_task_queue("normal", Priority::Normal, executor.clone());
        let urgent = service.create_task_queue("urgent", Priority::Urgent, executor.clone());

        let n = normal.submit("normal".into());
        let u = urgent.submit("urgent".into());
        let _runner = service.start();
        n.await.unwrap().unwrap();
        u.await.unwrap().unwrap();

        let batches = executor.batches.lock();
        assert_eq!(batches[0], vec!["urgent".to_string()]);
        assert_eq!(batches[1], vec!["normal".to_string()]);
        drop(batches);
        service.close();
    }

    #[tokio::test]
    async fn test_close_fails_pending_and_new_tasks() {
        let (service, _) = make_service(true);
        let executor = Arc::new(RenameExecutor {
            batches: Mutex::new(Vec::new()),
        });
        let queue = service.create_task_queue("rename", Priority::High, executor);
        let queued = queue.submit("never-run".into());
        service.close();

        assert_eq!(queued.await.unwrap(), Err(ShardStateError::NodeClosed));
        assert_eq!(queue.submit_and_wait("late".into()).await, Err(ShardStateError::NodeClosed));
        assert!(service.is_closed());
    }

    #[test]
    fn test_apply_state_ignores_older_versions() {
        let (service, _) = make_service(true);
        let current = service.state();
        let newer = Arc::new(current.builder().incr_version().build());
        assert!(service.apply_state(newer.clone()));
        assert!(!service.apply_state(newer));
        assert!(!service.apply_state(current));
        assert_eq!(service.state().version, 2);
    }

    #[test]
    fn test_apply_state_updates_cluster_settings() {
        let (service, _) = make_service(true);
        let current = service.state();
        let mut metadata = (*current.metadata).clone();
        metadata.persistent_settings = Settings::builder()
            .put("cluster.routing.allocation.exclude.rack", "r1")
            .build();
        let next = Arc::new(current.builder().incr_version().metadata(metadata).build());
        service.apply_state(next);
        assert_eq!(
            service.cluster_settings().current().get("cluster.routing.allocation.exclude.rack"),
            Some("r1")
        );
    }

    #[test]
    fn test_concurrent_appliers_never_regress_version() {
        use std::sync::atomic::{AtomicBool, Ordering};

        let (service, _) = make_service(true);
        let base = service.state();
        let done = AtomicBool::new(false);
        std::thread::scope(|scope| {
            for parity in 0..2u64 {
                let service = &service;
                let base = &base;
                scope.spawn(move || {
                    for version in (2..20_000u64).filter(|v| v % 2 == parity) {
                        service.apply_state(Arc::new(base.builder().version(version).build()));
                    }
                });
            }
            let sampler = scope.spawn(|| {
                let mut last = 0;
                while !done.load(Ordering::Acquire) {
                    let version = service.state().version;
                    assert!(version >= last, "version went from {} to {}", last, version);
                    last = version;
                }
            });
            // the highest version is odd
            while service.state().version < 19_999 {
                std::thread::yield_now();
            }
            done.store(true, Ordering::Release);
            sampler.join().unwrap();
        });
        assert_eq!(service.state().version, 19_999);
    }

    /// Installs a competing state of the same version while publishing
    struct PreemptingPublisher {
        service: std::sync::OnceLock<Arc<ClusterService>>,
    }

    #[async_trait]
    impl ClusterStatePublisher for PreemptingPublisher {
        async fn publish(&self, state: Arc<ClusterState>) -> Result<(), ShardStateError> {
            if let Some(service) = self.service.get() {
                let competing = service.state().builder().version(state.version).build();
                service.apply_state(Arc::new(competing));
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_superseded_commit_fails_batch_as_not_master() {
        let local = DiscoveryNode::new("n1", "127.0.0.1:9300");
        let mut nodes = DiscoveryNodes::new();
        nodes.add(local.clone());
        nodes.set_master(Some("n1".into()));
        let state = ClusterState::empty("test").builder().version(1).nodes(nodes).build();
        let publisher = Arc::new(PreemptingPublisher {
            service: std::sync::OnceLock::new(),
        });
        let service = Arc::new(ClusterService::new(
            local,
            Settings::empty(),
            Arc::new(ClusterSettings::default()),
            state,
            publisher.clone(),
        ));
        let _ = publisher.service.set(service.clone());
        let executor = Arc::new(RenameExecutor {
            batches: Mutex::new(Vec::new()),
        });
        let queue = service.create_task_queue("rename", Priority::High, executor);
        let _runner = service.start();

        let result = tokio::time::timeout(Duration::from_secs(5), queue.submit_and_wait("a".into()))
            .await
            .unwrap();
        assert_eq!(result, Err(ShardStateError::NotMaster("n1".into())));
        assert!(result.unwrap_err().is_master_channel_error());
        // the competing state stays installed
        assert_eq!(service.state().version, 2);
        assert_eq!(service.state().cluster_name, "test");
        service.close();
    }
}
