//! Wire framing and the key-value front door protocol
//!
//! Every TCP exchange in the system is a single request frame followed by a
//! single response frame: a 4-byte big-endian length prefix and a bincode
//! payload.

use crate::error::{RaftKvError, Result};
use crate::types::{NodeId, NodeStatus, PeerInfo};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest frame accepted from the network
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Serialize `message` and write it as one length-prefixed frame
pub async fn write_frame<W, T>(writer: &mut W, message: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let payload = bincode::serialize(message)?;
    if payload.len() > MAX_FRAME_LEN {
        return Err(RaftKvError::Serialization(format!(
            "frame of {} bytes exceeds limit of {}",
            payload.len(),
            MAX_FRAME_LEN
        )));
    }

    writer.write_all(&(payload.len() as u32).to_be_bytes()).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed frame and deserialize it
pub async fn read_frame<R, T>(reader: &mut R) -> Result<T>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let length = u32::from_be_bytes(len_buf) as usize;
    if length > MAX_FRAME_LEN {
        return Err(RaftKvError::Serialization(format!(
            "frame of {} bytes exceeds limit of {}",
            length, MAX_FRAME_LEN
        )));
    }

    let mut payload = vec![0u8; length];
    reader.read_exact(&mut payload).await?;
    Ok(bincode::deserialize(&payload)?)
}

/// Requests accepted by the key-value front door
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum KvRequest {
    Get { key: String },
    Set { key: String, value: String },
    Delete { key: String },
    Status,
    /// Add a member on the receiving node, which tells the others
    AddPeer(PeerInfo),
    /// Remove a member on the receiving node, which tells the others
    RemovePeer { id: NodeId },
}

/// Responses of the key-value front door
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum KvResponse {
    Value(String),
    NotFound,
    Ok,
    /// The node cannot accept writes; points at the leader when known
    NotLeader {
        leader_id: Option<NodeId>,
        leader_addr: Option<String>,
    },
    Failed(String),
    Status(NodeStatus),
    /// Whether the receiving node's member list changed
    Membership { changed: bool },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frame_over_duplex() {
        let (mut client, mut server) = tokio::io::duplex(1024);

        let request = KvRequest::Set {
            key: "k".to_string(),
            value: "v".to_string(),
        };
        write_frame(&mut client, &request).await.unwrap();

        let received: KvRequest = read_frame(&mut server).await.unwrap();
        assert_eq!(received, request);
    }

    #[tokio::test]
    async fn test_oversized_length_prefix_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let bogus = (MAX_FRAME_LEN as u32 + 1).to_be_bytes();
        client.write_all(&bogus).await.unwrap();

        let result: Result<KvRequest> = read_frame(&mut server).await;
        assert!(matches!(result, Err(RaftKvError::Serialization(_))));
    }

    #[tokio::test]
    async fn test_truncated_frame_is_io_error() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(&10u32.to_be_bytes()).await.unwrap();
        client.write_all(&[1, 2, 3]).await.unwrap();
        drop(client);

        let result: Result<KvResponse> = read_frame(&mut server).await;
        assert!(matches!(result, Err(RaftKvError::Io(_))));
    }
}
