//! Key-value service on top of the consensus engine
//!
//! Reads are served from the local applied state. Writes are wrapped in a
//! command with a fresh request id, appended on the leader and acknowledged
//! once that request id shows up in the applied state.

use raft_kv_core::{KvCommand, KvRequest, KvResponse, NodeStatus, RaftKvError, Result};
use raft_kv_raft::{ClusterManager, KvStateMachine, MembershipChange, Raft};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

pub struct KvService {
    raft: Arc<Raft<KvStateMachine>>,
    cluster: Arc<ClusterManager<KvStateMachine>>,
    write_timeout: Duration,
    poll_interval: Duration,
}

impl KvService {
    pub fn new(
        cluster: Arc<ClusterManager<KvStateMachine>>,
        write_timeout: Duration,
        poll_interval: Duration,
    ) -> Self {
        Self {
            raft: Arc::clone(cluster.raft()),
            cluster,
            write_timeout,
            poll_interval,
        }
    }

    /// Value of `key` in this node's applied state
    pub fn get(&self, key: &str) -> Option<String> {
        self.raft
            .read_state_machine(|sm| sm.get(key).map(str::to_owned))
    }

    pub async fn set(&self, key: String, value: String) -> Result<()> {
        self.submit(KvCommand::set(key, value)).await
    }

    pub async fn delete(&self, key: String) -> Result<()> {
        self.submit(KvCommand::delete(key)).await
    }

    pub fn status(&self) -> NodeStatus {
        self.raft.status()
    }

    /// Append `command` and wait until it has been applied locally
    async fn submit(&self, command: KvCommand) -> Result<()> {
        let request_id = command.request_id();
        let index = self.raft.append_entry(command.encode()?)?;
        debug!("Request {} appended at index {}", request_id, index);

        let deadline = Instant::now() + self.write_timeout;
        let mut status_rx = self.raft.subscribe();
        loop {
            if self.raft.read_state_machine(|sm| sm.is_applied(&request_id)) {
                return Ok(());
            }
            if Instant::now() >= deadline {
                warn!("Request {} (index {}) not applied within {:?}", request_id, index, self.write_timeout);
                return Err(RaftKvError::WriteFailed(format!(
                    "request {} not applied within {:?}",
                    request_id, self.write_timeout
                )));
            }

            // Wake on the next status change, or re-check after the poll interval
            let wait = self.poll_interval.min(deadline - Instant::now());
            tokio::select! {
                _ = status_rx.changed() => {}
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    /// Serve one front-door request
    pub async fn handle(&self, request: KvRequest) -> KvResponse {
        let result = match request {
            KvRequest::Get { key } => {
                return match self.get(&key) {
                    Some(value) => KvResponse::Value(value),
                    None => KvResponse::NotFound,
                };
            }
            KvRequest::Status => return KvResponse::Status(self.status()),
            KvRequest::AddPeer(peer) => {
                info!("Operator adds member {} ({})", peer.id, peer.raft_addr);
                let changed = self.cluster.apply_change(MembershipChange::AddPeer(peer), true);
                return KvResponse::Membership { changed };
            }
            KvRequest::RemovePeer { id } => {
                info!("Operator removes member {}", id);
                let changed = self.cluster.apply_change(MembershipChange::RemovePeer(id), true);
                return KvResponse::Membership { changed };
            }
            KvRequest::Set { key, value } => self.set(key, value).await,
            KvRequest::Delete { key } => self.delete(key).await,
        };

        match result {
            Ok(()) => KvResponse::Ok,
            Err(RaftKvError::NotLeader { leader_id }) => KvResponse::NotLeader {
                leader_id,
                leader_addr: leader_id
                    .and_then(|id| self.cluster.member(id))
                    .map(|peer| peer.kv_addr),
            },
            Err(e) => KvResponse::Failed(e.to_string()),
        }
    }
}
