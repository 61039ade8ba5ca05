//! TCP Transport
//!
//! Static-peer transport over framed TCP connections.

use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

use super::{InboundRequest, NetworkClient, NetworkServer, PeerTable, Transport};
use super::protocol::{Envelope, Message, Reply};
use crate::atom::NodeId;
use crate::config::AtomWeaveConfig;
use crate::error::{Error, Result};

/// Transport over TCP to the peers listed in configuration
pub struct TcpTransport {
    node_id: NodeId,
    bind_address: String,
    peers: PeerTable,
    client: NetworkClient,
    server: Mutex<Option<Arc<NetworkServer>>>,
}

impl TcpTransport {
    /// Create a transport from node configuration
    pub fn new(config: &AtomWeaveConfig) -> Self {
        Self {
            node_id: config.node.id.clone(),
            bind_address: config.node.bind_address.clone(),
            peers: PeerTable::new(&config.cluster.peers, config.peer_retry()),
            client: NetworkClient::new(config.rpc.connect_timeout()),
            server: Mutex::new(None),
        }
    }

    /// Peer reachability table
    pub fn peers(&self) -> &PeerTable {
        &self.peers
    }
}

#[async_trait::async_trait]
impl Transport for TcpTransport {
    fn local_node_id(&self) -> &str {
        &self.node_id
    }

    async fn start(&self, inbound: mpsc::Sender<InboundRequest>) -> Result<()> {
        let mut slot = self.server.lock().await;
        if slot.is_some() {
            return Err(Error::Network("TCP transport already started".into()));
        }

        let server = Arc::new(NetworkServer::new(self.bind_address.clone(), inbound));
        let listener = server.bind().await?;

        let serving = Arc::clone(&server);
        tokio::spawn(async move {
            serving.serve(listener).await;
        });

        *slot = Some(server);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        if let Some(server) = self.server.lock().await.take() {
            server.stop();
        }
        self.client.close_all().await;
        Ok(())
    }

    async fn available_nodes(&self) -> Vec<NodeId> {
        self.peers.available().await
    }

    async fn request(&self, node: &str, envelope: Envelope) -> Result<Reply> {
        let address = self
            .peers
            .address(node)
            .await
            .ok_or_else(|| Error::Unreachable(node.to_string()))?;

        match self.client.send(&address, &Message::Request(envelope)).await {
            Ok(Message::Response(reply)) => {
                self.peers.record_success(node).await;
                Ok(reply)
            }
            Ok(Message::Request(_)) => Err(Error::UnexpectedReply {
                node: node.to_string(),
                expected: "Response",
            }),
            Err(e) => {
                self.peers.record_failure(node).await;
                Err(e)
            }
        }
    }

    async fn report_failure(&self, node: &str) {
        self.peers.record_failure(node).await;
    }
}
