//! Error types for cluster operations.

use std::io;

use crate::agent::AgentState;
use crate::member::MemberId;

/// Errors that can occur during cluster operations.
#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    /// The agent could not start. Wraps the error that aborted `init()`.
    #[error("cluster initialization failed: {0}")]
    Initialization(#[source] Box<ClusterError>),

    /// Discovery finished but the group is not usable, e.g. fewer members
    /// than the configured minimum.
    #[error("membership initialization failed: {0}")]
    MembershipInitialization(String),

    /// Discovery gave up after repeated transport failures.
    #[error("membership discovery failed after {attempts} attempts: {reason}")]
    MembershipFailed { attempts: u32, reason: String },

    /// Every target of a message exhausted its delivery attempts.
    #[error("message {sequence} could not be delivered to any of {} targets", failed.len())]
    MessageFailed { sequence: u64, failed: Vec<MemberId> },

    /// A member update carried an incarnation older than the stored one.
    #[error("stale incarnation for {id}: offered {offered}, stored {stored}")]
    StaleIncarnation {
        id: MemberId,
        offered: u64,
        stored: u64,
    },

    /// Operation is not valid in the agent's current lifecycle state.
    #[error("{operation} is not allowed while the agent is {state}")]
    IllegalState {
        operation: &'static str,
        state: AgentState,
    },

    /// An explicit message target is not a known member.
    #[error("member {0} is not in the directory")]
    InvalidTarget(MemberId),

    /// The event queue is full and the backpressure policy gave up.
    #[error("event queue is full")]
    Backpressure,

    /// Timeout waiting for a cluster operation.
    #[error("cluster operation timed out")]
    Timeout,

    /// Socket-level failure.
    #[error("cluster transport error: {0}")]
    Io(#[from] io::Error),

    /// Network error during cluster communication.
    #[error("cluster communication error: {0}")]
    Network(String),

    /// The transport was closed and will not produce more frames.
    #[error("transport closed")]
    TransportClosed,

    /// Encoded frame exceeds what the transport or codec accepts.
    #[error("message too large: {size} bytes (limit {limit})")]
    MessageTooLarge { size: usize, limit: usize },

    /// Configuration error.
    #[error("invalid cluster configuration: {0}")]
    Configuration(String),
}

impl ClusterError {
    /// Creates an `IllegalState` error for `operation`.
    pub fn illegal_state(operation: &'static str, state: AgentState) -> Self {
        ClusterError::IllegalState { operation, state }
    }

    /// Returns the innermost error, unwrapping `Initialization`.
    pub fn root_cause(&self) -> &ClusterError {
        match self {
            ClusterError::Initialization(inner) => inner.root_cause(),
            other => other,
        }
    }

    /// Returns true for errors that abort `init()` rather than a single
    /// operation.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.root_cause(),
            ClusterError::MembershipInitialization(_)
                | ClusterError::MembershipFailed { .. }
                | ClusterError::Configuration(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_cause_unwraps_nested_initialization() {
        let err = ClusterError::Initialization(Box::new(ClusterError::MembershipInitialization(
            "need 2 members, found 1".into(),
        )));
        assert!(matches!(
            err.root_cause(),
            ClusterError::MembershipInitialization(_)
        ));
        assert!(err.is_fatal());
        assert!(err.to_string().contains("need 2 members"));
    }

    #[test]
    fn message_failed_reports_target_count() {
        let err = ClusterError::MessageFailed {
            sequence: 7,
            failed: vec![MemberId::new("b"), MemberId::new("c")],
        };
        assert_eq!(
            err.to_string(),
            "message 7 could not be delivered to any of 2 targets"
        );
        assert!(!err.is_fatal());
    }

    #[test]
    fn illegal_state_names_operation() {
        let err = ClusterError::illegal_state("send_message", AgentState::Uninitialized);
        assert_eq!(
            err.to_string(),
            "send_message is not allowed while the agent is uninitialized"
        );
    }
}
