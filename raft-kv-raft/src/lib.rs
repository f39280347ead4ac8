//! Raft Consensus Implementation
//!
//! This crate provides the Raft consensus engine behind the replicated
//! key-value store, along with its TCP transport and the key-value state
//! machine it replicates.

pub mod cluster;
pub mod log;
pub mod message;
pub mod node;
pub mod progress;
pub mod raft;
pub mod state_machine;
pub mod storage;
pub mod transport;

pub use cluster::ClusterManager;
pub use log::{LogEntry, RaftLog};
pub use message::{
    AppendEntriesRequest, AppendEntriesResponse, MembershipChange, RaftRequest, RaftResponse,
    RequestVoteRequest, RequestVoteResponse,
};
pub use node::{PeerClient, RaftRpcServer, RaftServerHandle, TcpTransport};
pub use progress::{PeerProgress, ProgressTracker};
pub use raft::{Raft, RaftConfig};
pub use state_machine::{KvStateMachine, StateMachine, VersionedValue};
pub use storage::{HardState, HardStateRef, MemoryPersister, Persister};
pub use transport::Transport;
