//! TCP front door for clients
//!
//! A connection carries any number of request/response frame pairs and is
//! served until the client closes it.

use raft_kv_core::{read_frame, write_frame, KvRequest, RaftKvError, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

use crate::kv_service::KvService;

pub struct KvServer {
    listener: TcpListener,
    service: Arc<KvService>,
}

impl KvServer {
    pub async fn bind(address: &str, service: Arc<KvService>) -> Result<Self> {
        let listener = TcpListener::bind(address).await?;
        Ok(Self { listener, service })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept clients until the task is dropped
    pub async fn serve(self) {
        match self.listener.local_addr() {
            Ok(addr) => info!("KV server listening on {}", addr),
            Err(e) => warn!("KV server started without a local address: {}", e),
        }

        loop {
            match self.listener.accept().await {
                Ok((stream, addr)) => {
                    let service = Arc::clone(&self.service);
                    tokio::spawn(async move {
                        if let Err(e) = handle_client(stream, service).await {
                            debug!("Client {} disconnected with error: {}", addr, e);
                        }
                    });
                }
                Err(e) => error!("Failed to accept client: {}", e),
            }
        }
    }
}

async fn handle_client(mut stream: TcpStream, service: Arc<KvService>) -> Result<()> {
    stream.set_nodelay(true)?;
    loop {
        let request: KvRequest = match read_frame(&mut stream).await {
            Ok(request) => request,
            // Clean close between frames
            Err(RaftKvError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e),
        };
        debug!("KV request: {:?}", request);
        let response = service.handle(request).await;
        write_frame(&mut stream, &response).await?;
    }
}
