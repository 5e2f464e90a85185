//! Coordination errors

use allocation::AllocationError;
use cluster_core::{StreamInput, StreamOutput, WireError, Writeable};

/// Errors from the cluster service, transport and shard state actions
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ShardStateError {
    #[error("Node [{0}] is no longer master")]
    NotMaster(String),

    #[error("Failed to connect to node [{0}]")]
    ConnectTransport(String),

    #[error("Node [{0}] disconnected")]
    NodeDisconnected(String),

    #[error("Failed to commit cluster state version [{version}]: {reason}")]
    FailedToCommit { version: u64, reason: String },

    #[error("Node closed")]
    NodeClosed,

    #[error("No handler for action [{0}]")]
    ActionNotFound(String),

    #[error("Remote failure: {0}")]
    Remote(String),

    #[error("Allocation error: {0}")]
    Allocation(#[from] AllocationError),

    #[error("Wire error: {0}")]
    Wire(#[from] WireError),
}

impl ShardStateError {
    /// Errors caused by master churn; the request is resent once a new
    /// master is known
    pub fn is_master_channel_error(&self) -> bool {
        matches!(
            self,
            ShardStateError::NotMaster(_)
                | ShardStateError::ConnectTransport(_)
                | ShardStateError::NodeDisconnected(_)
                | ShardStateError::FailedToCommit { .. }
        )
    }

    pub fn read_from(input: &mut StreamInput) -> Result<Self, WireError> {
        let error = match input.read_u8()? {
            1 => ShardStateError::NotMaster(input.read_string()?),
            2 => ShardStateError::ConnectTransport(input.read_string()?),
            3 => ShardStateError::NodeDisconnected(input.read_string()?),
            4 => ShardStateError::FailedToCommit {
                version: input.read_u64()?,
                reason: input.read_string()?,
            },
            5 => ShardStateError::NodeClosed,
            6 => ShardStateError::ActionNotFound(input.read_string()?),
            7 => ShardStateError::Remote(input.read_string()?),
            tag => return Err(WireError::InvalidTag { what: "error", tag }),
        };
        Ok(error)
    }
}

impl Writeable for ShardStateError {
    fn write_to(&self, out: &mut StreamOutput) {
        match self {
            ShardStateError::NotMaster(node) => {
                out.write_u8(1);
                out.write_string(node);
            }
            ShardStateError::ConnectTransport(node) => {
                out.write_u8(2);
                out.write_string(node);
            }
            ShardStateError::NodeDisconnected(node) => {
                out.write_u8(3);
                out.write_string(node);
            }
            ShardStateError::FailedToCommit { version, reason } => {
                out.write_u8(4);
                out.write_u64(*version);
                out.write_string(reason);
            }
            ShardStateError::NodeClosed => out.write_u8(5),
            ShardStateError::ActionNotFound(action) => {
                out.write_u8(6);
                out.write_string(action);
            }
            ShardStateError::Remote(message) => {
                out.write_u8(7);
                out.write_string(message);
            }
            // logic errors cross the wire as opaque remote failures
            other => {
                out.write_u8(7);
                out.write_string(&other.to_string());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cluster_core::ShardId;

    fn round_trip(error: &ShardStateError) -> ShardStateError {
        let mut out = StreamOutput::new();
        error.write_to(&mut out);
        let mut input = StreamInput::new(out.freeze());
        let decoded = ShardStateError::read_from(&mut input).unwrap();
        input.finish().unwrap();
        decoded
    }

    #[test]
    fn test_master_channel_classification() {
        assert!(ShardStateError::NotMaster("n1".into()).is_master_channel_error());
        assert!(ShardStateError::ConnectTransport("n1".into()).is_master_channel_error());
        assert!(ShardStateError::FailedToCommit {
            version: 3,
            reason: "no quorum".into()
        }
        .is_master_channel_error());
        assert!(!ShardStateError::NodeClosed.is_master_channel_error());
        assert!(!ShardStateError::Remote("boom".into()).is_master_channel_error());
    }

    #[test]
    fn test_retryable_errors_survive_the_wire() {
        let error = ShardStateError::FailedToCommit {
            version: 9,
            reason: "publish timed out".into(),
        };
        assert_eq!(round_trip(&error), error);
        assert!(round_trip(&ShardStateError::NotMaster("m1".into())).is_master_channel_error());
    }

    #[test]
    fn test_allocation_error_becomes_remote() {
        let error = ShardStateError::from(AllocationError::MissingAllocationId {
            shard: ShardId::new("idx", 0),
        });
        match round_trip(&error) {
            ShardStateError::Remote(message) => assert!(message.contains("[idx][0]")),
            other => panic!("unexpected {:?}", other),
        }
    }
}
