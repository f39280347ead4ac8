//! Raft Node - Represents a peer in the Raft cluster
//!
//! This module handles RPC communication with other Raft nodes: a TCP client
//! per peer, the [`TcpTransport`] the consensus core sends through, and the
//! [`RaftRpcServer`] that answers inbound requests.

use async_trait::async_trait;
use parking_lot::RwLock;
use raft_kv_core::{read_frame, write_frame, NodeId, PeerInfo, RaftKvError, Result};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

use crate::message::{
    AppendEntriesRequest, AppendEntriesResponse, MembershipChange, RaftRequest, RaftResponse,
    RequestVoteRequest, RequestVoteResponse,
};
use crate::raft::Raft;
use crate::state_machine::StateMachine;
use crate::transport::Transport;

/// Represents a peer node in the Raft cluster
#[derive(Debug, Clone)]
pub struct PeerClient {
    /// Unique identifier for the peer
    pub node_id: NodeId,
    /// Network address (host:port)
    pub address: String,
    /// Request timeout
    timeout: Duration,
}

impl PeerClient {
    /// Create a new peer client
    pub fn new(node_id: NodeId, address: String) -> Self {
        Self {
            node_id,
            address,
            timeout: Duration::from_millis(500),
        }
    }

    /// Set the request timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Send an RPC request and wait for response
    async fn send_rpc(&self, request: &RaftRequest) -> Result<RaftResponse> {
        let mut stream = TcpStream::connect(&self.address)
            .await
            .map_err(|e| RaftKvError::Network(format!("Failed to connect to {}: {}", self.address, e)))?;
        stream.set_nodelay(true)?;

        write_frame(&mut stream, request).await?;
        read_frame(&mut stream).await
    }

    async fn call(&self, request: RaftRequest) -> Result<RaftResponse> {
        match tokio::time::timeout(self.timeout, self.send_rpc(&request)).await {
            Ok(result) => result,
            Err(_) => Err(RaftKvError::Timeout(format!(
                "RPC to node {} at {}",
                self.node_id, self.address
            ))),
        }
    }

    /// Send AppendEntries RPC
    pub async fn send_append_entries(
        &self,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        match self.call(RaftRequest::AppendEntries(request)).await? {
            RaftResponse::AppendEntries(response) => Ok(response),
            RaftResponse::Error(msg) => Err(RaftKvError::Network(msg)),
            other => Err(RaftKvError::UnexpectedResponse(format!("{:?}", other))),
        }
    }

    /// Send RequestVote RPC
    pub async fn send_request_vote(
        &self,
        request: RequestVoteRequest,
    ) -> Result<RequestVoteResponse> {
        match self.call(RaftRequest::RequestVote(request)).await? {
            RaftResponse::RequestVote(response) => Ok(response),
            RaftResponse::Error(msg) => Err(RaftKvError::Network(msg)),
            other => Err(RaftKvError::UnexpectedResponse(format!("{:?}", other))),
        }
    }

    /// Send a membership change for the peer to apply locally
    pub async fn send_membership_change(&self, change: MembershipChange) -> Result<bool> {
        let request = RaftRequest::Membership {
            change,
            broadcast: false,
        };
        match self.call(request).await? {
            RaftResponse::Membership { changed } => Ok(changed),
            RaftResponse::Error(msg) => Err(RaftKvError::Network(msg)),
            other => Err(RaftKvError::UnexpectedResponse(format!("{:?}", other))),
        }
    }
}

/// [`Transport`] over TCP, one short-lived connection per RPC
pub struct TcpTransport {
    peers: RwLock<HashMap<NodeId, PeerClient>>,
    timeout: Duration,
}

impl TcpTransport {
    /// Build a transport for `peers`; the local node may be included and is skipped
    pub fn new(local_id: NodeId, peers: &[PeerInfo], timeout: Duration) -> Self {
        let clients = peers
            .iter()
            .filter(|p| p.id != local_id)
            .map(|p| {
                (
                    p.id,
                    PeerClient::new(p.id, p.raft_addr.clone()).with_timeout(timeout),
                )
            })
            .collect();
        Self {
            peers: RwLock::new(clients),
            timeout,
        }
    }

    fn client(&self, target: NodeId) -> Result<PeerClient> {
        self.peers
            .read()
            .get(&target)
            .cloned()
            .ok_or(RaftKvError::UnknownPeer(target))
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn request_vote(
        &self,
        target: NodeId,
        request: RequestVoteRequest,
    ) -> Result<RequestVoteResponse> {
        self.client(target)?.send_request_vote(request).await
    }

    async fn append_entries(
        &self,
        target: NodeId,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        self.client(target)?.send_append_entries(request).await
    }

    fn register_peer(&self, peer: &PeerInfo) {
        let client = PeerClient::new(peer.id, peer.raft_addr.clone()).with_timeout(self.timeout);
        self.peers.write().insert(peer.id, client);
    }

    fn unregister_peer(&self, id: NodeId) {
        self.peers.write().remove(&id);
    }

    async fn change_membership(&self, target: NodeId, change: MembershipChange) -> Result<bool> {
        self.client(target)?.send_membership_change(change).await
    }
}

/// Raft RPC server - handles incoming RPC requests from peers
pub struct RaftRpcServer {
    listener: TcpListener,
    raft_handle: RaftServerHandle,
}

impl RaftRpcServer {
    /// Bind the listening socket
    pub async fn bind(address: &str, raft_handle: RaftServerHandle) -> Result<Self> {
        let listener = TcpListener::bind(address).await?;
        Ok(Self {
            listener,
            raft_handle,
        })
    }

    /// Address actually bound (useful with port 0)
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until the task is dropped
    pub async fn serve(self) {
        match self.listener.local_addr() {
            Ok(addr) => info!("Raft RPC server listening on {}", addr),
            Err(e) => warn!("Raft RPC server started without a local address: {}", e),
        }

        loop {
            match self.listener.accept().await {
                Ok((stream, addr)) => {
                    let handle = self.raft_handle.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, handle).await {
                            debug!("Error handling connection from {}: {}", addr, e);
                        }
                    });
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                }
            }
        }
    }
}

/// Handle a single peer connection: one request frame, one response frame
async fn handle_connection(mut stream: TcpStream, handle: RaftServerHandle) -> Result<()> {
    stream.set_nodelay(true)?;
    let request: RaftRequest = read_frame(&mut stream).await?;
    let response = handle.process_request(request);
    write_frame(&mut stream, &response).await
}

type AppendEntriesHandler = dyn Fn(AppendEntriesRequest) -> AppendEntriesResponse + Send + Sync;
type RequestVoteHandler = dyn Fn(RequestVoteRequest) -> RequestVoteResponse + Send + Sync;
type MembershipHandler = dyn Fn(MembershipChange, bool) -> bool + Send + Sync;

/// Handle for processing Raft RPC requests
#[derive(Clone)]
pub struct RaftServerHandle {
    handle_append_entries: Arc<AppendEntriesHandler>,
    handle_request_vote: Arc<RequestVoteHandler>,
    handle_membership: Option<Arc<MembershipHandler>>,
}

impl RaftServerHandle {
    /// Create a new Raft server handle
    pub fn new<F1, F2>(handle_append_entries: F1, handle_request_vote: F2) -> Self
    where
        F1: Fn(AppendEntriesRequest) -> AppendEntriesResponse + Send + Sync + 'static,
        F2: Fn(RequestVoteRequest) -> RequestVoteResponse + Send + Sync + 'static,
    {
        Self {
            handle_append_entries: Arc::new(handle_append_entries),
            handle_request_vote: Arc::new(handle_request_vote),
            handle_membership: None,
        }
    }

    /// Accept membership changes; without a handler they are refused
    pub fn with_membership<F>(mut self, handle_membership: F) -> Self
    where
        F: Fn(MembershipChange, bool) -> bool + Send + Sync + 'static,
    {
        self.handle_membership = Some(Arc::new(handle_membership));
        self
    }

    /// Route requests to a running Raft instance
    pub fn for_raft<SM: StateMachine>(raft: Arc<Raft<SM>>) -> Self {
        let append_raft = Arc::clone(&raft);
        Self::new(
            move |req| append_raft.handle_append_entries(req),
            move |req| raft.handle_request_vote(req),
        )
    }

    /// Process a Raft RPC request
    pub fn process_request(&self, request: RaftRequest) -> RaftResponse {
        match request {
            RaftRequest::AppendEntries(req) => {
                RaftResponse::AppendEntries((self.handle_append_entries)(req))
            }
            RaftRequest::RequestVote(req) => {
                RaftResponse::RequestVote((self.handle_request_vote)(req))
            }
            RaftRequest::Membership { change, broadcast } => match &self.handle_membership {
                Some(handler) => RaftResponse::Membership {
                    changed: handler(change, broadcast),
                },
                None => RaftResponse::Error("membership changes are not accepted".to_string()),
            },
        }
    }
}
