//! Cluster membership bookkeeping
//!
//! A change updates the local node's view: the peer set the consensus core
//! fans out to and the addresses the transport can reach. The node that
//! receives a change from an operator passes it on to every other member it
//! knows. Changes are not replicated through the log.

use parking_lot::RwLock;
use raft_kv_core::{NodeId, PeerInfo};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::message::MembershipChange;
use crate::node::RaftServerHandle;
use crate::raft::Raft;
use crate::state_machine::StateMachine;
use crate::transport::Transport;

/// Tracks the known members of the cluster and their addresses
pub struct ClusterManager<SM: StateMachine> {
    raft: Arc<Raft<SM>>,
    transport: Arc<dyn Transport>,
    members: RwLock<BTreeMap<NodeId, PeerInfo>>,
}

impl<SM: StateMachine> ClusterManager<SM> {
    /// `members` may include the local node
    pub fn new(raft: Arc<Raft<SM>>, transport: Arc<dyn Transport>, members: Vec<PeerInfo>) -> Self {
        let members = members.into_iter().map(|p| (p.id, p)).collect();
        Self {
            raft,
            transport,
            members: RwLock::new(members),
        }
    }

    /// Add a peer to the fan-out set. Returns false if it was already known.
    pub fn add_peer(&self, peer: PeerInfo) -> bool {
        let id = peer.id;
        if id == self.raft.id() {
            return false;
        }

        self.transport.register_peer(&peer);
        let added = self.raft.add_peer(id);
        self.members.write().insert(id, peer);
        if added {
            info!("Cluster member {} added", id);
        }
        added
    }

    /// Remove a peer from the fan-out set. Returns false if it was unknown.
    pub fn remove_peer(&self, id: NodeId) -> bool {
        let removed = self.raft.remove_peer(id);
        self.members.write().remove(&id);
        self.transport.unregister_peer(id);
        if removed {
            info!("Cluster member {} removed", id);
        }
        removed
    }

    /// Apply `change` locally and, when `broadcast` is set, forward it to the
    /// other members. Returns whether the local member list changed.
    pub fn apply_change(self: &Arc<Self>, change: MembershipChange, broadcast: bool) -> bool {
        let changed = match &change {
            MembershipChange::AddPeer(peer) => self.add_peer(peer.clone()),
            MembershipChange::RemovePeer(id) => self.remove_peer(*id),
        };
        if broadcast {
            self.broadcast(change);
        }
        changed
    }

    /// Forward `change` to every member except this node, in the background
    fn broadcast(self: &Arc<Self>, change: MembershipChange) {
        let local = self.raft.id();
        let targets: Vec<NodeId> = self
            .members
            .read()
            .keys()
            .copied()
            .filter(|&id| id != local)
            .collect();

        for target in targets {
            let transport = Arc::clone(&self.transport);
            let change = change.clone();
            tokio::spawn(async move {
                match transport.change_membership(target, change).await {
                    Ok(changed) => debug!("Node {} applied membership change (changed: {})", target, changed),
                    Err(e) => warn!("Could not forward membership change to {}: {}", target, e),
                }
            });
        }
    }

    /// RPC handle that serves consensus traffic and membership changes
    pub fn server_handle(self: &Arc<Self>) -> RaftServerHandle {
        let cluster = Arc::clone(self);
        RaftServerHandle::for_raft(Arc::clone(&self.raft))
            .with_membership(move |change, broadcast| cluster.apply_change(change, broadcast))
    }

    /// Address information for a member, the local node included
    pub fn member(&self, id: NodeId) -> Option<PeerInfo> {
        self.members.read().get(&id).cloned()
    }

    pub fn members(&self) -> Vec<PeerInfo> {
        self.members.read().values().cloned().collect()
    }

    /// Address information for the leader this node currently knows of
    pub fn leader(&self) -> Option<PeerInfo> {
        self.raft.leader_id().and_then(|id| self.member(id))
    }

    pub fn raft(&self) -> &Arc<Raft<SM>> {
        &self.raft
    }
}
