//! Network Module
//!
//! The transport contract the store runs on, the peer protocol, a typed RPC
//! layer with timeouts and retries, and two transports: TCP for real
//! clusters and an in-process network for tests and simulation.

pub mod protocol;
pub mod rpc;
pub mod memory;
pub mod tcp;
mod server;
mod client;
mod peers;

pub use protocol::{Envelope, ErrorCode, FrameHeader, Message, PeerEvent, Reply};
pub use rpc::PeerRpc;
pub use memory::{MemoryNetwork, MemoryTransport};
pub use tcp::TcpTransport;
pub use server::NetworkServer;
pub use client::NetworkClient;
pub use peers::{PeerState, PeerStatus, PeerTable};

use tokio::sync::{mpsc, oneshot};

use crate::atom::NodeId;
use crate::error::{Error, Result};

/// A request delivered to this node, with the channel its reply goes back on
#[derive(Debug)]
pub struct InboundRequest {
    /// Request from the peer
    pub envelope: Envelope,
    /// Reply slot
    pub reply: oneshot::Sender<Reply>,
}

/// Network transport the store is built on
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Identity of the local node on this transport
    fn local_node_id(&self) -> &str;

    /// Bring the transport up; inbound requests are delivered on `inbound`
    async fn start(&self, inbound: mpsc::Sender<InboundRequest>) -> Result<()>;

    /// Close the transport
    async fn stop(&self) -> Result<()>;

    /// Nodes currently believed reachable, excluding the local node
    async fn available_nodes(&self) -> Vec<NodeId>;

    /// Send one request and wait for its reply
    async fn request(&self, node: &str, envelope: Envelope) -> Result<Reply>;

    /// A request to `node` was abandoned by the caller before it completed
    async fn report_failure(&self, _node: &str) {}
}

/// Read a framed message from a reader
pub async fn read_message<R: tokio::io::AsyncRead + Unpin>(reader: &mut R) -> Result<Message> {
    use tokio::io::AsyncReadExt;

    // Read header
    let mut header_bytes = [0u8; FrameHeader::SIZE];
    reader.read_exact(&mut header_bytes).await?;
    let header = FrameHeader::from_bytes(&header_bytes);

    if header.length > FrameHeader::MAX_BODY {
        return Err(Error::Network(format!("Frame of {} bytes exceeds limit", header.length)));
    }

    // Read body
    let mut body = vec![0u8; header.length as usize];
    reader.read_exact(&mut body).await?;

    // Verify checksum
    let computed_checksum = crc32fast::hash(&body);
    if computed_checksum != header.checksum {
        return Err(Error::Network("Message checksum mismatch".into()));
    }

    let message = Message::deserialize(&body)?;
    Ok(message)
}

/// Write a framed message to a writer
pub async fn write_message<W: tokio::io::AsyncWrite + Unpin>(
    writer: &mut W,
    message: &Message,
) -> Result<()> {
    use tokio::io::AsyncWriteExt;

    let body = message.serialize()?;
    let header = FrameHeader::new(&body);

    writer.write_all(&header.to_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_framed_round_trip_over_duplex() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        let msg = Message::Request(Envelope::new("node-1", PeerEvent::Heartbeat));

        write_message(&mut a, &msg).await.unwrap();
        let received = read_message(&mut b).await.unwrap();
        assert_eq!(received, msg);
    }

    #[tokio::test]
    async fn test_corrupted_frame_rejected() {
        use tokio::io::AsyncWriteExt;

        let (mut a, mut b) = tokio::io::duplex(4096);
        let body = Message::Response(Reply::Ack).serialize().unwrap();
        let mut header = FrameHeader::new(&body);
        header.checksum ^= 0xdead_beef;

        a.write_all(&header.to_bytes()).await.unwrap();
        a.write_all(&body).await.unwrap();

        assert!(matches!(read_message(&mut b).await, Err(Error::Network(_))));
    }
}
