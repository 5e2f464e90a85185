//! Shard state action
//!
//! Data nodes report shard copies as started or failed to the elected
//! master. The sending side keeps resending the same entry across master
//! elections until the master acknowledges it or answers with an error
//! that is not caused by master churn. The master side batches entries
//! per action into one cluster state update.

use std::fmt;
use std::sync::Arc;

use allocation::{AllocationError, AllocationService, FailedShard, RoutingResult, RoutingResultExt};
use async_trait::async_trait;
use bytes::Bytes;
use cluster_core::{
    ClusterState, ShardRouting, StreamInput, StreamOutput, WireError, Writeable, INDEX_UUID_NA_VALUE,
};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::cluster::{
    master_changed, BatchResult, ClusterService, ClusterStateObserver, ClusterStateTaskExecutor, MasterTaskQueue,
    Priority, TaskResult,
};
use crate::error::ShardStateError;
use crate::routing_service::RoutingService;
use crate::transport::{RequestHandler, TransportService};

pub const SHARD_STARTED_ACTION_NAME: &str = "internal:cluster/shard/started";
pub const SHARD_FAILED_ACTION_NAME: &str = "internal:cluster/shard/failure";

/// A started or failed report for one shard copy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardRoutingEntry {
    pub shard_routing: ShardRouting,
    /// UUID of the index the copy belongs to, `_na_` to skip the check
    pub index_uuid: String,
    pub message: String,
    pub failure: Option<String>,
}

impl ShardRoutingEntry {
    pub fn new(
        shard_routing: ShardRouting,
        index_uuid: impl Into<String>,
        message: impl Into<String>,
        failure: Option<String>,
    ) -> Self {
        Self {
            shard_routing,
            index_uuid: index_uuid.into(),
            message: message.into(),
            failure,
        }
    }

    pub fn read_from(input: &mut StreamInput) -> Result<Self, WireError> {
        Ok(Self {
            shard_routing: ShardRouting::read_from(input)?,
            index_uuid: input.read_string()?,
            message: input.read_string()?,
            failure: input.read_optional_string()?,
        })
    }

    /// Whether the entry refers to an index that no longer exists in
    /// `state`, or to an older incarnation of it
    fn is_stale(&self, state: &ClusterState) -> bool {
        match state.metadata.index(&self.shard_routing.shard_id.index) {
            None => true,
            Some(index) => self.index_uuid != INDEX_UUID_NA_VALUE && self.index_uuid != index.uuid,
        }
    }
}

impl Writeable for ShardRoutingEntry {
    fn write_to(&self, out: &mut StreamOutput) {
        self.shard_routing.write_to(out);
        out.write_string(&self.index_uuid);
        out.write_string(&self.message);
        out.write_optional_string(self.failure.as_deref());
    }
}

impl fmt::Display for ShardRoutingEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} on [{}], allocation id [{}], index uuid [{}], message [{}]",
            self.shard_routing.shard_id,
            self.shard_routing.current_node.as_deref().unwrap_or("none"),
            self.shard_routing.allocation_id.as_deref().unwrap_or("none"),
            self.index_uuid,
            self.message
        )?;
        if let Some(failure) = &self.failure {
            write!(f, ", failure [{}]", failure)?;
        }
        Ok(())
    }
}

/// Callback form of a shard state report; exactly one method is invoked
pub trait ShardStateListener: Send + Sync {
    fn on_success(&self);
    fn on_failure(&self, error: ShardStateError);
}

/// Client side of the shard started/failed actions
pub struct ShardStateAction {
    transport: Arc<TransportService>,
    cluster_service: Arc<ClusterService>,
}

impl ShardStateAction {
    pub fn new(transport: Arc<TransportService>, cluster_service: Arc<ClusterService>) -> Self {
        Self {
            transport,
            cluster_service,
        }
    }

    /// Create the master queues and register the inbound handlers
    pub fn register_handlers(
        transport: &TransportService,
        cluster_service: &ClusterService,
        allocation_service: Arc<AllocationService>,
        routing_service: Arc<RoutingService>,
    ) {
        let started_queue = cluster_service.create_task_queue(
            "shard-started",
            Priority::Urgent,
            Arc::new(ShardStartedClusterStateTaskExecutor::new(
                allocation_service.clone(),
                routing_service.clone(),
            )),
        );
        let failed_queue = cluster_service.create_task_queue(
            "shard-failed",
            Priority::High,
            Arc::new(ShardFailedClusterStateTaskExecutor::new(allocation_service, routing_service)),
        );
        transport.register_handler(
            SHARD_STARTED_ACTION_NAME,
            Arc::new(ShardEntryHandler {
                action: SHARD_STARTED_ACTION_NAME,
                queue: started_queue,
            }),
        );
        transport.register_handler(
            SHARD_FAILED_ACTION_NAME,
            Arc::new(ShardEntryHandler {
                action: SHARD_FAILED_ACTION_NAME,
                queue: failed_queue,
            }),
        );
    }

    /// Report a copy as started. Resolves once the master has committed
    /// the report, or fails with the first error not caused by master
    /// churn.
    pub async fn shard_started(
        &self,
        shard_routing: &ShardRouting,
        index_uuid: &str,
        message: &str,
    ) -> Result<(), ShardStateError> {
        let entry = ShardRoutingEntry::new(shard_routing.clone(), index_uuid, message, None);
        self.send_to_master(SHARD_STARTED_ACTION_NAME, &entry).await
    }

    /// Report a copy as failed
    pub async fn shard_failed(
        &self,
        shard_routing: &ShardRouting,
        index_uuid: &str,
        message: &str,
        failure: Option<String>,
    ) -> Result<(), ShardStateError> {
        let entry = ShardRoutingEntry::new(shard_routing.clone(), index_uuid, message, failure);
        self.send_to_master(SHARD_FAILED_ACTION_NAME, &entry).await
    }

    /// Report again a failed copy that is still in the routing table
    pub async fn resend_shard_failed(
        &self,
        shard_routing: &ShardRouting,
        index_uuid: &str,
        message: &str,
        failure: Option<String>,
    ) -> Result<(), ShardStateError> {
        info!(
            "{} resending shard failed for allocation id [{}], message [{}]",
            shard_routing.shard_id,
            shard_routing.allocation_id.as_deref().unwrap_or("none"),
            message
        );
        self.shard_failed(shard_routing, index_uuid, message, failure).await
    }

    /// `shard_started` reporting to a listener from a spawned task
    pub fn shard_started_with_listener(
        self: &Arc<Self>,
        shard_routing: ShardRouting,
        index_uuid: String,
        message: String,
        listener: Arc<dyn ShardStateListener>,
    ) -> JoinHandle<()> {
        let action = self.clone();
        tokio::spawn(async move {
            let result = action.shard_started(&shard_routing, &index_uuid, &message).await;
            notify(listener.as_ref(), result);
        })
    }

    /// `shard_failed` reporting to a listener from a spawned task
    pub fn shard_failed_with_listener(
        self: &Arc<Self>,
        shard_routing: ShardRouting,
        index_uuid: String,
        message: String,
        failure: Option<String>,
        listener: Arc<dyn ShardStateListener>,
    ) -> JoinHandle<()> {
        let action = self.clone();
        tokio::spawn(async move {
            let result = action.shard_failed(&shard_routing, &index_uuid, &message, failure).await;
            notify(listener.as_ref(), result);
        })
    }

    async fn send_to_master(&self, action: &'static str, entry: &ShardRoutingEntry) -> Result<(), ShardStateError> {
        let shard_id = &entry.shard_routing.shard_id;
        let mut observer = ClusterStateObserver::new(&self.cluster_service);
        loop {
            let state = observer.observed_state();
            let Some(master) = state.nodes.master_node().cloned() else {
                debug!("{} no master known for action [{}], waiting for new master", shard_id, action);
                observer.wait_for_next_change(master_changed).await?;
                continue;
            };

            debug!("{} sending [{}] to master [{}]: {}", shard_id, action, master.id, entry);
            match self.transport.send_request(&master, action, entry).await {
                Ok(()) => {
                    trace!("{} [{}] acknowledged by [{}]", shard_id, action, master.id);
                    return Ok(());
                }
                Err(e) if e.is_master_channel_error() => {
                    info!(
                        "{} failed to send [{}] to master [{}] ({}), waiting for new master",
                        shard_id, action, master.id, e
                    );
                    observer.wait_for_next_change(master_changed).await?;
                }
                Err(e) => {
                    warn!("{} unexpected failure while sending [{}]: {}", shard_id, action, e);
                    return Err(e);
                }
            }
        }
    }
}

fn notify(listener: &dyn ShardStateListener, result: Result<(), ShardStateError>) {
    match result {
        Ok(()) => listener.on_success(),
        Err(e) => listener.on_failure(e),
    }
}

/// Master-side handler: decode the entry and wait for its batch to commit
struct ShardEntryHandler {
    action: &'static str,
    queue: MasterTaskQueue<ShardRoutingEntry>,
}

#[async_trait]
impl RequestHandler for ShardEntryHandler {
    async fn handle(&self, request: Bytes) -> Result<(), ShardStateError> {
        let mut input = StreamInput::new(request);
        let entry = ShardRoutingEntry::read_from(&mut input)?;
        input.finish()?;
        debug!("{} received [{}]: {}", entry.shard_routing.shard_id, self.action, entry);
        self.queue.submit_and_wait(entry).await
    }
}

/// Apply a batch of entries, skipping stale ones. When the batch as a
/// whole is rejected, entries are applied one at a time against the
/// evolving state so only the offending ones fail.
fn execute_entries<F>(source: &str, current: &Arc<ClusterState>, tasks: &[ShardRoutingEntry], apply: F) -> BatchResult
where
    F: Fn(&ClusterState, &[&ShardRoutingEntry]) -> Result<RoutingResult, AllocationError>,
{
    let mut results: Vec<TaskResult> = vec![Ok(()); tasks.len()];
    let mut live = Vec::with_capacity(tasks.len());
    for (i, task) in tasks.iter().enumerate() {
        if task.is_stale(current) {
            debug!("{} [{}] ignoring stale entry: {}", task.shard_routing.shard_id, source, task);
        } else {
            live.push(i);
        }
    }
    if live.is_empty() {
        return BatchResult { state: current.clone(), results };
    }

    let entries: Vec<&ShardRoutingEntry> = live.iter().map(|&i| &tasks[i]).collect();
    let state = match apply(current.as_ref(), &entries) {
        Ok(result) => install(current, &result),
        Err(e) => {
            warn!("[{}] failed to apply batch of {} entries ({}), applying one by one", source, entries.len(), e);
            let mut state = current.clone();
            for &i in &live {
                let single = [&tasks[i]];
                match apply(state.as_ref(), &single[..]) {
                    Ok(result) => state = install(&state, &result),
                    Err(e) => {
                        warn!("{} [{}] failed to apply {}: {}", tasks[i].shard_routing.shard_id, source, tasks[i], e);
                        results[i] = Err(e.into());
                    }
                }
            }
            state
        }
    };
    BatchResult { state, results }
}

fn install(state: &Arc<ClusterState>, result: &RoutingResult) -> Arc<ClusterState> {
    if result.changed() {
        Arc::new(state.builder().routing_result(result).build())
    } else {
        state.clone()
    }
}

fn reroute_if_unassigned(routing_service: &RoutingService, state: &ClusterState, reason: &str) {
    let unassigned = state.unassigned_shard_count();
    if unassigned > 0 {
        trace!("{} unassigned shards after version {}, scheduling reroute", unassigned, state.version);
        routing_service.reroute(reason);
    }
}

/// Marks reported copies as started and allocates what it can
pub struct ShardStartedClusterStateTaskExecutor {
    allocation_service: Arc<AllocationService>,
    routing_service: Arc<RoutingService>,
}

impl ShardStartedClusterStateTaskExecutor {
    pub fn new(allocation_service: Arc<AllocationService>, routing_service: Arc<RoutingService>) -> Self {
        Self {
            allocation_service,
            routing_service,
        }
    }
}

impl ClusterStateTaskExecutor<ShardRoutingEntry> for ShardStartedClusterStateTaskExecutor {
    fn execute(&self, current: &Arc<ClusterState>, tasks: &[ShardRoutingEntry]) -> BatchResult {
        execute_entries("shard-started", current, tasks, |state, entries| {
            let started: Vec<ShardRouting> = entries.iter().map(|e| e.shard_routing.clone()).collect();
            self.allocation_service.apply_started_shards(state, &started, true)
        })
    }

    fn cluster_state_published(&self, state: &Arc<ClusterState>) {
        reroute_if_unassigned(&self.routing_service, state, "unassigned shards after shard started");
    }
}

/// Moves reported copies back to unassigned
pub struct ShardFailedClusterStateTaskExecutor {
    allocation_service: Arc<AllocationService>,
    routing_service: Arc<RoutingService>,
}

impl ShardFailedClusterStateTaskExecutor {
    pub fn new(allocation_service: Arc<AllocationService>, routing_service: Arc<RoutingService>) -> Self {
        Self {
            allocation_service,
            routing_service,
        }
    }
}

impl ClusterStateTaskExecutor<ShardRoutingEntry> for ShardFailedClusterStateTaskExecutor {
    fn execute(&self, current: &Arc<ClusterState>, tasks: &[ShardRoutingEntry]) -> BatchResult {
        execute_entries("shard-failed", current, tasks, |state, entries| {
            let failed: Vec<FailedShard> = entries
                .iter()
                .map(|e| FailedShard::new(e.shard_routing.clone(), e.message.clone(), e.failure.clone()))
                .collect();
            self.allocation_service.apply_failed_shards(state, &failed)
        })
    }

    fn cluster_state_published(&self, state: &Arc<ClusterState>) {
        reroute_if_unassigned(&self.routing_service, state, "unassigned shards after shard failures");
    }
}
