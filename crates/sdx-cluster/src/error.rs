//! Error types for the replication layer.

use crate::ids::{InstanceId, NodeId, ReplicaId};
use thiserror::Error;

/// Why a reroute could not pick a target.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RoutingFailure {
    #[error("computed target is this node")]
    TargetIsSelf,

    #[error("computed target is the operation's origin")]
    TargetIsOrigin,

    #[error("no reachable write replica")]
    NoCandidates,

    #[error("already rerouted {0} times")]
    HopLimit(u32),
}

/// Errors that can occur while replicating, routing or syncing.
#[derive(Error, Debug, Clone)]
pub enum ClusterError {
    #[error("Routing error for {replica}: {failure}")]
    Routing {
        replica: ReplicaId,
        failure: RoutingFailure,
    },

    #[error("Node unreachable: {node} ({reason})")]
    NodeUnreachable { node: NodeId, reason: String },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Merge protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Instance not found: {0}")]
    InstanceNotFound(InstanceId),

    #[error("Unknown CRDT type: {0}")]
    UnknownCrdtType(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Snapshot error: {0}")]
    Snapshot(String),
}

impl ClusterError {
    pub fn routing(replica: &ReplicaId, failure: RoutingFailure) -> Self {
        ClusterError::Routing {
            replica: replica.clone(),
            failure,
        }
    }

    pub fn unreachable(node: &NodeId, reason: impl Into<String>) -> Self {
        ClusterError::NodeUnreachable {
            node: node.clone(),
            reason: reason.into(),
        }
    }

    pub fn is_unreachable(&self) -> bool {
        matches!(self, ClusterError::NodeUnreachable { .. })
    }
}

impl From<serde_json::Error> for ClusterError {
    fn from(err: serde_json::Error) -> Self {
        ClusterError::Serialization(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ClusterError>;
