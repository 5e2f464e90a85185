//! Transport layer
//!
//! Requests are addressed by action name and carry a wire-encoded body.
//! A response is a one-byte status frame: `0` for an acknowledgment, or
//! `1` followed by an encoded `ShardStateError`.

mod local;

pub use local::{LocalPublisher, LocalTransportHub};

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use cluster_core::{DiscoveryNode, StreamInput, StreamOutput, WireError, Writeable};
use parking_lot::RwLock;
use tracing::{debug, trace};

use crate::error::ShardStateError;

/// Server side of an action
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(&self, request: Bytes) -> Result<(), ShardStateError>;
}

/// Moves request bytes to a node and brings back its response frame
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send_request(
        &self,
        from: &DiscoveryNode,
        to: &DiscoveryNode,
        action: &str,
        payload: Bytes,
    ) -> Result<Bytes, ShardStateError>;
}

pub fn encode_response(result: &Result<(), ShardStateError>) -> Bytes {
    let mut out = StreamOutput::new();
    match result {
        Ok(()) => out.write_u8(0),
        Err(error) => {
            out.write_u8(1);
            error.write_to(&mut out);
        }
    }
    out.freeze()
}

pub fn decode_response(frame: Bytes) -> Result<Result<(), ShardStateError>, WireError> {
    let mut input = StreamInput::new(frame);
    let result = match input.read_u8()? {
        0 => Ok(()),
        1 => Err(ShardStateError::read_from(&mut input)?),
        tag => return Err(WireError::InvalidTag { what: "response", tag }),
    };
    input.finish()?;
    Ok(result)
}

/// Per-node transport endpoint: sends requests and dispatches inbound
/// ones to registered handlers
pub struct TransportService {
    local_node: DiscoveryNode,
    transport: Arc<dyn Transport>,
    handlers: RwLock<HashMap<String, Arc<dyn RequestHandler>>>,
}

impl TransportService {
    pub fn new(local_node: DiscoveryNode, transport: Arc<dyn Transport>) -> Self {
        Self {
            local_node,
            transport,
            handlers: RwLock::new(HashMap::new()),
        }
    }

    pub fn local_node(&self) -> &DiscoveryNode {
        &self.local_node
    }

    pub fn register_handler(&self, action: &str, handler: Arc<dyn RequestHandler>) {
        self.handlers.write().insert(action.to_string(), handler);
        debug!("Node [{}] registered handler for [{}]", self.local_node.id, action);
    }

    /// Send a request and wait for the acknowledgment
    pub async fn send_request<R: Writeable + ?Sized>(
        &self,
        node: &DiscoveryNode,
        action: &str,
        request: &R,
    ) -> Result<(), ShardStateError> {
        let mut out = StreamOutput::new();
        request.write_to(&mut out);
        trace!(
            "Node [{}] sending [{}] to [{}] ({} bytes)",
            self.local_node.id,
            action,
            node.id,
            out.len()
        );
        let frame = self
            .transport
            .send_request(&self.local_node, node, action, out.freeze())
            .await?;
        decode_response(frame)?
    }

    /// Dispatch an inbound request, returning the encoded response frame
    pub async fn handle_inbound(&self, action: &str, payload: Bytes) -> Bytes {
        let handler = self.handlers.read().get(action).cloned();
        let result = match handler {
            Some(handler) => handler.handle(payload).await,
            None => Err(ShardStateError::ActionNotFound(action.to_string())),
        };
        encode_response(&result)
    }
}
