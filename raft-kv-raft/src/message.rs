//! Raft RPC messages
//!
//! Two request/response pairs are exchanged between cluster members:
//! RequestVote during elections and AppendEntries for replication and
//! heartbeats. Membership changes travel on the same connection type but
//! bypass the log.

use crate::log::LogEntry;
use raft_kv_core::{LogIndex, NodeId, PeerInfo, Term};
use serde::{Deserialize, Serialize};

/// Raft RPC request types
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RaftRequest {
    AppendEntries(AppendEntriesRequest),
    RequestVote(RequestVoteRequest),
    /// Apply a membership change locally; pass it on to the other members
    /// when `broadcast` is set
    Membership {
        change: MembershipChange,
        broadcast: bool,
    },
}

/// Raft RPC response types
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RaftResponse {
    AppendEntries(AppendEntriesResponse),
    RequestVote(RequestVoteResponse),
    /// Whether the receiver's member list changed
    Membership { changed: bool },
    Error(String),
}

/// Change to a node's member list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MembershipChange {
    AddPeer(PeerInfo),
    RemovePeer(NodeId),
}

/// AppendEntries RPC request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    pub term: Term,
    pub leader_id: NodeId,
    /// Index of the entry preceding `entries`, `None` when they start the log
    pub prev_log_index: Option<LogIndex>,
    pub prev_log_term: Option<Term>,
    /// Empty for a heartbeat
    pub entries: Vec<LogEntry>,
    pub leader_commit: Option<LogIndex>,
}

impl AppendEntriesRequest {
    /// Index of the last entry carried, or of the previous entry for a heartbeat
    pub fn last_index(&self) -> Option<LogIndex> {
        match self.entries.len() as LogIndex {
            0 => self.prev_log_index,
            n => Some(self.prev_log_index.map_or(n - 1, |prev| prev + n)),
        }
    }
}

/// AppendEntries RPC response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    pub term: Term,
    pub success: bool,
}

/// RequestVote RPC request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestVoteRequest {
    pub term: Term,
    pub candidate_id: NodeId,
    pub last_log_index: Option<LogIndex>,
    pub last_log_term: Option<Term>,
}

/// RequestVote RPC response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestVoteResponse {
    pub term: Term,
    pub vote_granted: bool,
}
