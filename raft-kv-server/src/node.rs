//! A complete key-value node: storage, consensus, Raft RPC and the client
//! front door

use raft_kv_core::Result;
use raft_kv_persistence::FilePersister;
use raft_kv_raft::{ClusterManager, KvStateMachine, Raft, RaftRpcServer, TcpTransport, Transport};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::api::KvServer;
use crate::config::NodeConfig;
use crate::kv_service::KvService;

pub struct KvNode {
    raft: Arc<Raft<KvStateMachine>>,
    cluster: Arc<ClusterManager<KvStateMachine>>,
    service: Arc<KvService>,
    raft_addr: SocketAddr,
    kv_addr: SocketAddr,
    servers: Vec<JoinHandle<()>>,
}

impl KvNode {
    /// Recover state from disk, bind both listeners and start the node
    pub async fn start(config: &NodeConfig) -> Result<Self> {
        config.validate()?;
        let me = config.self_info()?;
        let node_id = config.node.id;

        let persister = Arc::new(FilePersister::open(&config.storage.data_dir)?);
        let transport: Arc<dyn Transport> = Arc::new(TcpTransport::new(
            node_id,
            &config.cluster.peers,
            config.rpc_timeout(),
        ));
        let raft = Raft::new(
            config.to_raft_config(),
            KvStateMachine::new(),
            Arc::clone(&transport),
            persister,
        )?;

        let cluster = Arc::new(ClusterManager::new(
            Arc::clone(&raft),
            transport,
            config.cluster.peers.clone(),
        ));
        let rpc_server = RaftRpcServer::bind(&me.raft_addr, cluster.server_handle()).await?;
        let raft_addr = rpc_server.local_addr()?;
        let service = Arc::new(KvService::new(
            Arc::clone(&cluster),
            config.write_timeout(),
            config.apply_poll_interval(),
        ));
        let kv_server = KvServer::bind(&me.kv_addr, Arc::clone(&service)).await?;
        let kv_addr = kv_server.local_addr()?;

        let servers = vec![tokio::spawn(rpc_server.serve()), tokio::spawn(kv_server.serve())];
        raft.start();

        info!(
            "Node {} up: raft on {}, kv on {}, {} peers",
            node_id,
            raft_addr,
            kv_addr,
            config.cluster.peers.len() - 1
        );

        Ok(Self {
            raft,
            cluster,
            service,
            raft_addr,
            kv_addr,
            servers,
        })
    }

    pub fn raft(&self) -> &Arc<Raft<KvStateMachine>> {
        &self.raft
    }

    pub fn cluster(&self) -> &Arc<ClusterManager<KvStateMachine>> {
        &self.cluster
    }

    pub fn service(&self) -> &Arc<KvService> {
        &self.service
    }

    pub fn raft_addr(&self) -> SocketAddr {
        self.raft_addr
    }

    pub fn kv_addr(&self) -> SocketAddr {
        self.kv_addr
    }

    /// Stop serving and stop the consensus tasks. Returns once both
    /// listeners are closed.
    pub async fn shutdown(&mut self) {
        for server in &self.servers {
            server.abort();
        }
        for server in self.servers.drain(..) {
            if let Err(e) = server.await {
                if !e.is_cancelled() {
                    warn!("Server task of node {} failed: {}", self.raft.id(), e);
                }
            }
        }
        self.raft.shutdown();
        info!("Node {} stopped", self.raft.id());
    }
}
