//! Identifiers and status types shared by every crate in the workspace

use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique identifier of a cluster member
pub type NodeId = u64;

/// Logical election epoch
pub type Term = u64;

/// 0-based position in the replicated log
pub type LogIndex = u64;

/// Role of a node in the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeState {
    Follower,
    Candidate,
    Leader,
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NodeState::Follower => "follower",
            NodeState::Candidate => "candidate",
            NodeState::Leader => "leader",
        };
        f.write_str(name)
    }
}

/// Addresses of one cluster member
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub id: NodeId,
    /// Address of the Raft RPC endpoint (host:port)
    pub raft_addr: String,
    /// Address of the key-value front door (host:port)
    pub kv_addr: String,
}

impl PeerInfo {
    pub fn new(id: NodeId, raft_addr: impl Into<String>, kv_addr: impl Into<String>) -> Self {
        Self {
            id,
            raft_addr: raft_addr.into(),
            kv_addr: kv_addr.into(),
        }
    }
}

/// Point-in-time view of a node's consensus state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStatus {
    pub id: NodeId,
    pub term: Term,
    pub role: NodeState,
    pub leader_id: Option<NodeId>,
    pub commit_index: Option<LogIndex>,
    pub last_applied: Option<LogIndex>,
    pub log_len: usize,
}

impl NodeStatus {
    pub fn is_leader(&self) -> bool {
        self.role == NodeState::Leader
    }
}
