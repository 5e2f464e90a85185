//! Shard routing definitions
//!
//! A `ShardRouting` describes one copy (primary or replica) of one shard
//! and where it currently lives. Routing entries are values: every
//! transition returns a new entry and leaves the original untouched.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::node::NodeId;
use crate::stream::{StreamInput, StreamOutput, WireError, Writeable};

/// Shard identity: index name plus shard number
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ShardId {
    pub index: String,
    pub id: u32,
}

impl ShardId {
    pub fn new(index: impl Into<String>, id: u32) -> Self {
        Self {
            index: index.into(),
            id,
        }
    }

    pub fn read_from(input: &mut StreamInput) -> Result<Self, WireError> {
        let index = input.read_string()?;
        let id = input.read_u32()?;
        Ok(Self { index, id })
    }
}

impl Writeable for ShardId {
    fn write_to(&self, out: &mut StreamOutput) {
        out.write_string(&self.index);
        out.write_u32(self.id);
    }
}

impl std::fmt::Display for ShardId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}][{}]", self.index, self.id)
    }
}

/// Shard copy lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShardRoutingState {
    /// Not assigned to any node
    Unassigned,
    /// Assigned and recovering
    Initializing,
    /// Assigned and serving
    Started,
    /// Started and being moved to another node
    Relocating,
}

impl ShardRoutingState {
    fn tag(self) -> u8 {
        match self {
            ShardRoutingState::Unassigned => 1,
            ShardRoutingState::Initializing => 2,
            ShardRoutingState::Started => 3,
            ShardRoutingState::Relocating => 4,
        }
    }

    fn from_tag(tag: u8) -> Result<Self, WireError> {
        match tag {
            1 => Ok(ShardRoutingState::Unassigned),
            2 => Ok(ShardRoutingState::Initializing),
            3 => Ok(ShardRoutingState::Started),
            4 => Ok(ShardRoutingState::Relocating),
            tag => Err(WireError::InvalidTag {
                what: "shard routing state",
                tag,
            }),
        }
    }
}

impl std::fmt::Display for ShardRoutingState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShardRoutingState::Unassigned => write!(f, "UNASSIGNED"),
            ShardRoutingState::Initializing => write!(f, "INITIALIZING"),
            ShardRoutingState::Started => write!(f, "STARTED"),
            ShardRoutingState::Relocating => write!(f, "RELOCATING"),
        }
    }
}

/// Why a shard copy is unassigned
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnassignedReason {
    /// Fresh copy of a newly created index
    IndexCreated,
    /// The node holding the copy left the cluster
    NodeLeft,
    /// The copy failed on its node
    AllocationFailed,
    /// The primary failed and took this initializing replica with it
    PrimaryFailed,
}

impl UnassignedReason {
    fn tag(self) -> u8 {
        match self {
            UnassignedReason::IndexCreated => 1,
            UnassignedReason::NodeLeft => 2,
            UnassignedReason::AllocationFailed => 3,
            UnassignedReason::PrimaryFailed => 4,
        }
    }

    fn from_tag(tag: u8) -> Result<Self, WireError> {
        match tag {
            1 => Ok(UnassignedReason::IndexCreated),
            2 => Ok(UnassignedReason::NodeLeft),
            3 => Ok(UnassignedReason::AllocationFailed),
            4 => Ok(UnassignedReason::PrimaryFailed),
            tag => Err(WireError::InvalidTag {
                what: "unassigned reason",
                tag,
            }),
        }
    }
}

impl std::fmt::Display for UnassignedReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UnassignedReason::IndexCreated => write!(f, "INDEX_CREATED"),
            UnassignedReason::NodeLeft => write!(f, "NODE_LEFT"),
            UnassignedReason::AllocationFailed => write!(f, "ALLOCATION_FAILED"),
            UnassignedReason::PrimaryFailed => write!(f, "PRIMARY_FAILED"),
        }
    }
}

/// Current time truncated to the millisecond precision used on the wire
fn now_millis() -> DateTime<Utc> {
    let now = Utc::now();
    Utc.timestamp_millis_opt(now.timestamp_millis())
        .single()
        .unwrap_or(now)
}

/// Diagnostics attached to an unassigned (or re-initializing) copy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnassignedInfo {
    pub reason: UnassignedReason,
    pub message: Option<String>,
    pub failure: Option<String>,
    /// Consecutive failed allocation attempts
    pub failed_allocations: u32,
    pub at: DateTime<Utc>,
}

impl UnassignedInfo {
    pub fn new(reason: UnassignedReason, message: Option<String>) -> Self {
        Self {
            reason,
            message,
            failure: None,
            failed_allocations: 0,
            at: now_millis(),
        }
    }

    pub fn with_failure(mut self, failure: Option<String>, failed_allocations: u32) -> Self {
        self.failure = failure;
        self.failed_allocations = failed_allocations;
        self
    }

    pub fn read_from(input: &mut StreamInput) -> Result<Self, WireError> {
        let reason = UnassignedReason::from_tag(input.read_u8()?)?;
        let message = input.read_optional_string()?;
        let failure = input.read_optional_string()?;
        let failed_allocations = input.read_u32()?;
        let millis = input.read_i64()?;
        let at = Utc
            .timestamp_millis_opt(millis)
            .single()
            .unwrap_or_else(now_millis);
        Ok(Self {
            reason,
            message,
            failure,
            failed_allocations,
            at,
        })
    }
}

impl Writeable for UnassignedInfo {
    fn write_to(&self, out: &mut StreamOutput) {
        out.write_u8(self.reason.tag());
        out.write_optional_string(self.message.as_deref());
        out.write_optional_string(self.failure.as_deref());
        out.write_u32(self.failed_allocations);
        out.write_i64(self.at.timestamp_millis());
    }
}

impl std::fmt::Display for UnassignedInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[reason={}]", self.reason)?;
        if self.failed_allocations > 0 {
            write!(f, ", failed_attempts[{}]", self.failed_allocations)?;
        }
        if let Some(message) = &self.message {
            write!(f, ", details[{}]", message)?;
        }
        if let Some(failure) = &self.failure {
            write!(f, ", failure[{}]", failure)?;
        }
        Ok(())
    }
}

/// One copy of one shard
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardRouting {
    pub shard_id: ShardId,
    /// Node holding this copy (None when unassigned)
    pub current_node: Option<NodeId>,
    /// For a relocating source: the target node. For a relocation
    /// target: the source node.
    pub relocating_node: Option<NodeId>,
    pub primary: bool,
    pub state: ShardRoutingState,
    /// Identifies this particular assignment of the copy
    pub allocation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unassigned_info: Option<UnassignedInfo>,
}

impl ShardRouting {
    /// Create a new unassigned copy
    pub fn new_unassigned(shard_id: ShardId, primary: bool, info: UnassignedInfo) -> Self {
        Self {
            shard_id,
            current_node: None,
            relocating_node: None,
            primary,
            state: ShardRoutingState::Unassigned,
            allocation_id: None,
            unassigned_info: Some(info),
        }
    }

    pub fn unassigned(&self) -> bool {
        self.state == ShardRoutingState::Unassigned
    }

    pub fn initializing(&self) -> bool {
        self.state == ShardRoutingState::Initializing
    }

    pub fn started(&self) -> bool {
        self.state == ShardRoutingState::Started
    }

    pub fn relocating(&self) -> bool {
        self.state == ShardRoutingState::Relocating
    }

    /// Started or relocating: the copy serves requests
    pub fn active(&self) -> bool {
        self.started() || self.relocating()
    }

    pub fn assigned_to_node(&self) -> bool {
        self.current_node.is_some()
    }

    /// Initializing copy that is the target of a relocation
    pub fn is_relocation_target(&self) -> bool {
        self.initializing() && self.relocating_node.is_some()
    }

    /// Same copy, same assignment
    pub fn is_same_allocation(&self, other: &ShardRouting) -> bool {
        self.shard_id == other.shard_id
            && self.allocation_id.is_some()
            && self.allocation_id == other.allocation_id
    }

    /// Assign an unassigned copy to a node
    pub fn initialize(&self, node_id: NodeId, allocation_id: String) -> Self {
        debug_assert!(self.unassigned(), "{} is not unassigned", self);
        Self {
            shard_id: self.shard_id.clone(),
            current_node: Some(node_id),
            relocating_node: None,
            primary: self.primary,
            state: ShardRoutingState::Initializing,
            allocation_id: Some(allocation_id),
            unassigned_info: self.unassigned_info.clone(),
        }
    }

    /// Mark an initializing copy as started
    pub fn move_to_started(&self) -> Self {
        debug_assert!(self.initializing(), "{} is not initializing", self);
        Self {
            relocating_node: None,
            state: ShardRoutingState::Started,
            unassigned_info: None,
            ..self.clone()
        }
    }

    /// Begin relocating a started copy to another node
    pub fn relocate(&self, target_node: NodeId) -> Self {
        debug_assert!(self.started(), "{} is not started", self);
        Self {
            relocating_node: Some(target_node),
            state: ShardRoutingState::Relocating,
            ..self.clone()
        }
    }

    /// The initializing copy on the target node of a relocation
    pub fn build_target_relocating_shard(&self, allocation_id: String) -> Self {
        debug_assert!(self.relocating(), "{} is not relocating", self);
        Self {
            shard_id: self.shard_id.clone(),
            current_node: self.relocating_node.clone(),
            relocating_node: self.current_node.clone(),
            primary: self.primary,
            state: ShardRoutingState::Initializing,
            allocation_id: Some(allocation_id),
            unassigned_info: None,
        }
    }

    /// Abort a relocation; the source goes back to started
    pub fn cancel_relocation(&self) -> Self {
        debug_assert!(self.relocating(), "{} is not relocating", self);
        Self {
            relocating_node: None,
            state: ShardRoutingState::Started,
            ..self.clone()
        }
    }

    /// Drop the assignment and return the copy to the unassigned pool
    pub fn move_to_unassigned(&self, info: UnassignedInfo) -> Self {
        Self {
            shard_id: self.shard_id.clone(),
            current_node: None,
            relocating_node: None,
            primary: self.primary,
            state: ShardRoutingState::Unassigned,
            allocation_id: None,
            unassigned_info: Some(info),
        }
    }

    pub fn move_to_primary(&self) -> Self {
        Self {
            primary: true,
            ..self.clone()
        }
    }

    pub fn move_from_primary(&self) -> Self {
        Self {
            primary: false,
            ..self.clone()
        }
    }

    /// Number of failed allocation attempts recorded on this copy
    pub fn failed_allocations(&self) -> u32 {
        self.unassigned_info
            .as_ref()
            .map(|info| info.failed_allocations)
            .unwrap_or(0)
    }

    pub fn read_from(input: &mut StreamInput) -> Result<Self, WireError> {
        let shard_id = ShardId::read_from(input)?;
        let current_node = input.read_optional_string()?;
        let relocating_node = input.read_optional_string()?;
        let primary = input.read_bool()?;
        let state = ShardRoutingState::from_tag(input.read_u8()?)?;
        let allocation_id = input.read_optional_string()?;
        let unassigned_info = if input.read_bool()? {
            Some(UnassignedInfo::read_from(input)?)
        } else {
            None
        };
        Ok(Self {
            shard_id,
            current_node,
            relocating_node,
            primary,
            state,
            allocation_id,
            unassigned_info,
        })
    }
}

impl Writeable for ShardRouting {
    fn write_to(&self, out: &mut StreamOutput) {
        self.shard_id.write_to(out);
        out.write_optional_string(self.current_node.as_deref());
        out.write_optional_string(self.relocating_node.as_deref());
        out.write_bool(self.primary);
        out.write_u8(self.state.tag());
        out.write_optional_string(self.allocation_id.as_deref());
        out.write_optional(self.unassigned_info.as_ref());
    }
}

impl std::fmt::Display for ShardRouting {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}, node[{}], ",
            self.shard_id,
            self.current_node.as_deref().unwrap_or("null")
        )?;
        if let Some(relocating) = &self.relocating_node {
            write!(f, "relocating [{}], ", relocating)?;
        }
        write!(f, "[{}], ", if self.primary { "P" } else { "R" })?;
        if let Some(allocation_id) = &self.allocation_id {
            write!(f, "a[id={}], ", allocation_id)?;
        }
        write!(f, "s[{}]", self.state)?;
        if let Some(info) = &self.unassigned_info {
            write!(f, ", unassigned_info[{}]", info)?;
        }
        Ok(())
    }
}
