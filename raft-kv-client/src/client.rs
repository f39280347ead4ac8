//! Key-value client with leader discovery and retries

use raft_kv_core::{KvRequest, KvResponse, NodeId, NodeStatus, PeerInfo, RaftKvError, Result};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

use crate::connection::call_with_timeout;

/// Client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Deadline for one request/response exchange, writes included
    pub request_timeout: Duration,
    /// Pause before trying the next node
    pub retry_backoff: Duration,
    /// Give up after this many attempts; `None` retries forever
    pub max_attempts: Option<usize>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(10),
            retry_backoff: Duration::from_millis(500),
            max_attempts: Some(10),
        }
    }
}

/// Client for a raft-kv cluster
pub struct KvClient {
    peers: Vec<String>,
    current: AtomicUsize,
    config: ClientConfig,
}

impl KvClient {
    /// Create a client for the front-door addresses in `peers`
    pub fn new(peers: Vec<String>) -> Result<Self> {
        Self::with_config(peers, ClientConfig::default())
    }

    pub fn with_config(peers: Vec<String>, config: ClientConfig) -> Result<Self> {
        if peers.is_empty() {
            return Err(RaftKvError::Configuration(
                "at least one peer address is required".to_string(),
            ));
        }
        Ok(Self {
            peers,
            current: AtomicUsize::new(0),
            config,
        })
    }

    /// Address the next request goes to
    pub fn current_peer(&self) -> &str {
        &self.peers[self.current.load(Ordering::SeqCst) % self.peers.len()]
    }

    /// Read `key`; a missing key is `Ok(None)`
    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        match self.request(KvRequest::Get { key: key.to_string() }).await? {
            KvResponse::Value(value) => Ok(Some(value)),
            KvResponse::NotFound => Ok(None),
            other => Err(unexpected(other)),
        }
    }

    pub async fn set(&self, key: &str, value: &str) -> Result<()> {
        let request = KvRequest::Set {
            key: key.to_string(),
            value: value.to_string(),
        };
        match self.request(request).await? {
            KvResponse::Ok => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    pub async fn delete(&self, key: &str) -> Result<()> {
        match self.request(KvRequest::Delete { key: key.to_string() }).await? {
            KvResponse::Ok => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    /// Status of the node the client currently talks to
    pub async fn status(&self) -> Result<NodeStatus> {
        match self.request(KvRequest::Status).await? {
            KvResponse::Status(status) => Ok(status),
            other => Err(unexpected(other)),
        }
    }

    /// Add a cluster member. The node that takes the request forwards it to
    /// the others; returns whether that node's member list changed.
    pub async fn add_peer(&self, peer: PeerInfo) -> Result<bool> {
        match self.request(KvRequest::AddPeer(peer)).await? {
            KvResponse::Membership { changed } => Ok(changed),
            other => Err(unexpected(other)),
        }
    }

    /// Remove a cluster member, forwarded like [`KvClient::add_peer`]
    pub async fn remove_peer(&self, id: NodeId) -> Result<bool> {
        match self.request(KvRequest::RemovePeer { id }).await? {
            KvResponse::Membership { changed } => Ok(changed),
            other => Err(unexpected(other)),
        }
    }

    /// Status of every node; unreachable nodes are reported as errors
    pub async fn cluster_status(&self) -> Vec<(String, Result<NodeStatus>)> {
        let mut statuses = Vec::with_capacity(self.peers.len());
        for addr in &self.peers {
            let status = match call_with_timeout(addr, &KvRequest::Status, self.config.request_timeout).await {
                Ok(KvResponse::Status(status)) => Ok(status),
                Ok(other) => Err(unexpected(other)),
                Err(e) => Err(e),
            };
            statuses.push((addr.clone(), status));
        }
        statuses
    }

    /// Send `request`, moving between nodes until one gives a definite answer
    async fn request(&self, request: KvRequest) -> Result<KvResponse> {
        let mut attempts = 0;
        loop {
            let addr = self.current_peer().to_string();
            let error = match call_with_timeout(&addr, &request, self.config.request_timeout).await {
                Ok(KvResponse::NotLeader {
                    leader_id,
                    leader_addr,
                }) => {
                    debug!("{} is not the leader (hint: {:?})", addr, leader_addr);
                    self.redirect(leader_addr.as_deref());
                    RaftKvError::NotLeader { leader_id }
                }
                Ok(KvResponse::Failed(reason)) => {
                    warn!("Request failed on {}: {}", addr, reason);
                    self.rotate();
                    RaftKvError::WriteFailed(reason)
                }
                Ok(response) => return Ok(response),
                Err(e) if e.is_retryable() => {
                    debug!("Request to {} failed: {}", addr, e);
                    self.rotate();
                    e
                }
                Err(e) => return Err(e),
            };

            attempts += 1;
            if self.config.max_attempts.is_some_and(|max| attempts >= max) {
                return Err(error);
            }
            tokio::time::sleep(self.config.retry_backoff).await;
        }
    }

    fn rotate(&self) {
        self.current.fetch_add(1, Ordering::SeqCst);
    }

    /// Jump to the hinted leader if it is one of our peers, otherwise rotate
    fn redirect(&self, leader_addr: Option<&str>) {
        match leader_addr.and_then(|addr| self.peers.iter().position(|p| p == addr)) {
            Some(index) => self.current.store(index, Ordering::SeqCst),
            None => self.rotate(),
        }
    }
}

fn unexpected(response: KvResponse) -> RaftKvError {
    RaftKvError::UnexpectedResponse(format!("{:?}", response))
}
