//! Error types for the replicated key-value store

use crate::types::NodeId;
use thiserror::Error;

/// Core error type shared by the consensus engine, the server and the client
#[derive(Error, Debug)]
pub enum RaftKvError {
    /// The node is not the leader; carries the leader it last heard from
    #[error("Not the leader (known leader: {leader_id:?})")]
    NotLeader { leader_id: Option<NodeId> },

    /// Serialization or deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Network error
    #[error("Network error: {0}")]
    Network(String),

    /// Request timed out
    #[error("Request timed out: {0}")]
    Timeout(String),

    /// Durable state could not be written or read
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// No address is known for the peer
    #[error("Unknown peer: {0}")]
    UnknownPeer(NodeId),

    /// A submitted write was not observed as applied
    #[error("Write failed: {0}")]
    WriteFailed(String),

    /// The remote side answered with a message of the wrong kind
    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl RaftKvError {
    /// Whether a client should try again, possibly against another peer
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RaftKvError::NotLeader { .. }
                | RaftKvError::Network(_)
                | RaftKvError::Timeout(_)
                | RaftKvError::Io(_)
                | RaftKvError::WriteFailed(_)
        )
    }
}

impl From<bincode::Error> for RaftKvError {
    fn from(e: bincode::Error) -> Self {
        RaftKvError::Serialization(e.to_string())
    }
}

/// Result type alias for raft-kv operations
pub type Result<T> = std::result::Result<T, RaftKvError>;
