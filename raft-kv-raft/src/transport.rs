//! Outbound RPC boundary
//!
//! The consensus core never opens sockets itself; every RequestVote and
//! AppendEntries goes through a [`Transport`]. A failed call is reported as
//! an error and retried by the task that issued it.

use crate::message::{
    AppendEntriesRequest, AppendEntriesResponse, MembershipChange, RequestVoteRequest,
    RequestVoteResponse,
};
use async_trait::async_trait;
use raft_kv_core::{NodeId, PeerInfo, RaftKvError, Result};

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Send RequestVote to `target` and wait for its answer
    async fn request_vote(
        &self,
        target: NodeId,
        request: RequestVoteRequest,
    ) -> Result<RequestVoteResponse>;

    /// Send AppendEntries to `target` and wait for its answer
    async fn append_entries(
        &self,
        target: NodeId,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse>;

    /// Learn the address of a peer added to the cluster
    fn register_peer(&self, _peer: &PeerInfo) {}

    /// Forget a peer removed from the cluster
    fn unregister_peer(&self, _id: NodeId) {}

    /// Ask `target` to apply `change` to its own member list without
    /// passing it on. Returns whether the target's list changed.
    async fn change_membership(&self, target: NodeId, _change: MembershipChange) -> Result<bool> {
        Err(RaftKvError::Network(format!(
            "membership changes cannot be sent to node {}",
            target
        )))
    }
}
