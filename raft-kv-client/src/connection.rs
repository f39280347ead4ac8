//! One request/response exchange with a node's front door

use raft_kv_core::{read_frame, write_frame, KvRequest, KvResponse, RaftKvError, Result};
use std::time::Duration;
use tokio::net::TcpStream;

/// A connection to one node
pub struct KvConnection {
    addr: String,
    stream: TcpStream,
}

impl KvConnection {
    /// Create a new connection
    pub async fn connect(addr: &str) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| RaftKvError::Network(format!("Failed to connect to {}: {}", addr, e)))?;
        stream.set_nodelay(true)?;
        Ok(Self {
            addr: addr.to_string(),
            stream,
        })
    }

    /// Send one request and wait for its response
    pub async fn call(&mut self, request: &KvRequest) -> Result<KvResponse> {
        write_frame(&mut self.stream, request).await?;
        read_frame(&mut self.stream).await
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }
}

/// Connect, send `request` and read the reply, all within `timeout`
pub async fn call_with_timeout(addr: &str, request: &KvRequest, timeout: Duration) -> Result<KvResponse> {
    let exchange = async {
        let mut conn = KvConnection::connect(addr).await?;
        conn.call(request).await
    };
    tokio::time::timeout(timeout, exchange)
        .await
        .map_err(|_| RaftKvError::Timeout(format!("request to {}", addr)))?
}
