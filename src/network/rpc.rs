//! Peer RPC
//!
//! Typed request helpers over a [`Transport`]. Every call runs under a
//! per-attempt timeout and is retried with capped exponential backoff while
//! the failure is retryable.

use std::sync::Arc;
use futures::future::join_all;

use super::Transport;
use super::protocol::{Envelope, ErrorCode, PeerEvent, Reply};
use crate::atom::{Atom, AtomHash, AtomId, NodeId};
use crate::config::RpcConfig;
use crate::error::{Error, Result};
use crate::sync::{SyncUpdate, Timestamp};

/// Typed RPC client for one node
#[derive(Clone)]
pub struct PeerRpc {
    node_id: NodeId,
    transport: Arc<dyn Transport>,
    config: RpcConfig,
}

impl PeerRpc {
    /// Create an RPC client sending as `transport.local_node_id()`
    pub fn new(transport: Arc<dyn Transport>, config: RpcConfig) -> Self {
        Self {
            node_id: transport.local_node_id().to_string(),
            transport,
            config,
        }
    }

    /// Local node id
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Nodes the transport currently considers reachable, sorted
    pub async fn available_nodes(&self) -> Vec<NodeId> {
        let mut nodes = self.transport.available_nodes().await;
        nodes.retain(|n| *n != self.node_id);
        nodes.sort();
        nodes
    }

    /// Send an event with the configured retry policy
    pub async fn call(&self, node: &str, event: PeerEvent) -> Result<Reply> {
        self.call_with_attempts(node, event, self.config.max_attempts).await
    }

    async fn call_with_attempts(&self, node: &str, event: PeerEvent, max_attempts: u32) -> Result<Reply> {
        let kind = event.type_name();
        let mut attempt = 1;

        loop {
            let envelope = Envelope::new(self.node_id.clone(), event.clone());
            let result = match tokio::time::timeout(
                self.config.request_timeout(),
                self.transport.request(node, envelope),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => {
                    // The dropped request never saw its own failure
                    self.transport.report_failure(node).await;
                    Err(Error::Timeout(node.to_string()))
                }
            };

            let error = match result {
                Ok(Reply::Rejected(reason)) => {
                    return Err(Error::Rejected { node: node.to_string(), reason });
                }
                Ok(Reply::Error { code: ErrorCode::ShuttingDown, .. }) => {
                    return Err(Error::ShuttingDown);
                }
                Ok(Reply::Error { code, message }) => {
                    return Err(Error::Rejected {
                        node: node.to_string(),
                        reason: format!("{:?}: {}", code, message),
                    });
                }
                Ok(reply) => return Ok(reply),
                Err(e) => e,
            };

            if !error.is_retryable() || attempt >= max_attempts {
                return Err(error);
            }

            let backoff = self.config.backoff(attempt);
            tracing::debug!(
                "{} to {} failed (attempt {}/{}): {}; retrying in {:?}",
                kind, node, attempt, max_attempts, error, backoff
            );
            tokio::time::sleep(backoff).await;
            attempt += 1;
        }
    }

    /// Single-attempt liveness probe
    pub async fn check_node_health(&self, node: &str) -> bool {
        match self.call_with_attempts(node, PeerEvent::Heartbeat, 1).await {
            Ok(Reply::Pong) => true,
            Ok(other) => {
                tracing::warn!("Health check of {} got {}", node, other.type_name());
                false
            }
            Err(e) => {
                tracing::debug!("Health check of {} failed: {}", node, e);
                false
            }
        }
    }

    /// Push a replica copy taken at `version`
    pub async fn send_atom_replica(&self, node: &str, atom: &Atom, version: Timestamp) -> Result<()> {
        let event = PeerEvent::ReplicaStore { atom: atom.clone(), version };
        let reply = self.call(node, event).await?;
        expect_ack(node, reply)
    }

    /// Ask a holder to drop its replica
    pub async fn send_remove_replica(&self, node: &str, atom_id: &str) -> Result<()> {
        let reply = self
            .call(node, PeerEvent::ReplicaRemove { atom_id: atom_id.to_string() })
            .await?;
        expect_ack(node, reply)
    }

    /// Fetch a peer's copy of an atom
    pub async fn request_atom(&self, node: &str, atom_id: &str) -> Result<Option<Atom>> {
        match self.call(node, PeerEvent::AtomRequest { atom_id: atom_id.to_string() }).await? {
            Reply::Atom(atom) => Ok(atom),
            _ => Err(unexpected(node, "Atom")),
        }
    }

    /// Fetch a peer's consistency hash of an atom
    pub async fn request_atom_hash(&self, node: &str, atom_id: &str) -> Result<Option<AtomHash>> {
        match self.call(node, PeerEvent::ConsistencyCheck { atom_id: atom_id.to_string() }).await? {
            Reply::Hash(hash) => Ok(hash),
            _ => Err(unexpected(node, "Hash")),
        }
    }

    /// Pull a peer's updates newer than `since`
    pub async fn request_sync(&self, node: &str, since: Timestamp) -> Result<Vec<SyncUpdate>> {
        self.exchange_updates(node, since, Vec::new()).await
    }

    /// Send our updates and pull the peer's updates newer than `since`
    pub async fn exchange_updates(
        &self,
        node: &str,
        since: Timestamp,
        updates: Vec<SyncUpdate>,
    ) -> Result<Vec<SyncUpdate>> {
        match self.call(node, PeerEvent::SyncRequest { since, updates }).await? {
            Reply::Updates(updates) => Ok(updates),
            _ => Err(unexpected(node, "Updates")),
        }
    }

    /// Push an add/update to every available node
    pub async fn broadcast_atom_update(&self, update: &SyncUpdate) -> Vec<(NodeId, Result<()>)> {
        self.broadcast(update).await
    }

    /// Push a removal to every available node
    pub async fn broadcast_atom_removal(&self, update: &SyncUpdate) -> Vec<(NodeId, Result<()>)> {
        self.broadcast(update).await
    }

    async fn broadcast(&self, update: &SyncUpdate) -> Vec<(NodeId, Result<()>)> {
        let nodes = self.available_nodes().await;
        let sends = nodes.iter().map(|node| async move {
            let result = match self.call(node, PeerEvent::AtomUpdate(update.clone())).await {
                Ok(reply) => expect_ack(node, reply),
                Err(e) => Err(e),
            };
            (node.clone(), result)
        });
        join_all(sends).await
    }

    /// Ask each node for an atom in order, returning the first copy found
    pub async fn first_copy(&self, nodes: &[NodeId], atom_id: &AtomId) -> Option<(NodeId, Atom)> {
        for node in nodes {
            match self.request_atom(node, atom_id).await {
                Ok(Some(atom)) => return Some((node.clone(), atom)),
                Ok(None) => {}
                Err(e) => tracing::debug!("Atom request to {} failed: {}", node, e),
            }
        }
        None
    }
}

fn expect_ack(node: &str, reply: Reply) -> Result<()> {
    match reply {
        Reply::Ack => Ok(()),
        _ => Err(unexpected(node, "Ack")),
    }
}

fn unexpected(node: &str, expected: &'static str) -> Error {
    Error::UnexpectedReply {
        node: node.to_string(),
        expected,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::InboundRequest;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;
    use tokio::sync::mpsc;

    /// Transport whose first `failures` requests fail with a network error
    struct FlakyTransport {
        failures: u32,
        calls: AtomicU32,
    }

    #[async_trait::async_trait]
    impl Transport for FlakyTransport {
        fn local_node_id(&self) -> &str {
            "local"
        }

        async fn start(&self, _inbound: mpsc::Sender<InboundRequest>) -> Result<()> {
            Ok(())
        }

        async fn stop(&self) -> Result<()> {
            Ok(())
        }

        async fn available_nodes(&self) -> Vec<NodeId> {
            vec!["peer".to_string(), "local".to_string()]
        }

        async fn request(&self, _node: &str, envelope: Envelope) -> Result<Reply> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                return Err(Error::Network("flaky".into()));
            }
            match envelope.event {
                PeerEvent::Heartbeat => Ok(Reply::Pong),
                PeerEvent::ConsistencyCheck { .. } => Ok(Reply::Rejected("busy".into())),
                _ => Ok(Reply::Ack),
            }
        }
    }

    fn rpc(failures: u32, max_attempts: u32) -> (PeerRpc, Arc<FlakyTransport>) {
        let transport = Arc::new(FlakyTransport { failures, calls: AtomicU32::new(0) });
        let config = RpcConfig {
            request_timeout_ms: 100,
            max_attempts,
            initial_backoff_ms: 1,
            max_backoff_ms: 5,
            ..RpcConfig::default()
        };
        (PeerRpc::new(transport.clone(), config), transport)
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let (rpc, transport) = rpc(2, 3);
        let atom = Atom::node("ConceptNode", "cat", Default::default());
        rpc.send_atom_replica("peer", &atom, 1).await.unwrap();
        assert_eq!(transport.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let (rpc, transport) = rpc(5, 3);
        let result = rpc.send_remove_replica("peer", "x").await;
        assert!(matches!(result, Err(Error::Network(_))));
        assert_eq!(transport.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_health_check_is_single_attempt() {
        let (rpc, transport) = rpc(1, 3);
        assert!(!rpc.check_node_health("peer").await);
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
        assert!(rpc.check_node_health("peer").await);
    }

    #[tokio::test]
    async fn test_rejection_is_not_retried() {
        let (rpc, transport) = rpc(0, 3);
        let result = rpc.request_atom_hash("peer", "x").await;
        assert!(matches!(result, Err(Error::Rejected { .. })));
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_wrong_reply_kind_is_an_error() {
        let (rpc, _) = rpc(0, 1);
        let result = rpc.request_sync("peer", 0).await;
        assert!(matches!(result, Err(Error::UnexpectedReply { expected: "Updates", .. })));
    }

    #[tokio::test]
    async fn test_available_nodes_never_include_self() {
        let (rpc, _) = rpc(0, 1);
        assert_eq!(rpc.available_nodes().await, vec!["peer"]);
    }

    #[tokio::test]
    async fn test_timeout_counts_as_failure() {
        #[derive(Default)]
        struct Silent {
            abandoned: AtomicU32,
        }

        #[async_trait::async_trait]
        impl Transport for Silent {
            fn local_node_id(&self) -> &str {
                "local"
            }
            async fn start(&self, _inbound: mpsc::Sender<InboundRequest>) -> Result<()> {
                Ok(())
            }
            async fn stop(&self) -> Result<()> {
                Ok(())
            }
            async fn available_nodes(&self) -> Vec<NodeId> {
                vec!["peer".into()]
            }
            async fn request(&self, _node: &str, _envelope: Envelope) -> Result<Reply> {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(Reply::Pong)
            }
            async fn report_failure(&self, _node: &str) {
                self.abandoned.fetch_add(1, Ordering::SeqCst);
            }
        }

        let config = RpcConfig { request_timeout_ms: 20, max_attempts: 2, initial_backoff_ms: 1, ..RpcConfig::default() };
        let transport = Arc::new(Silent::default());
        let rpc = PeerRpc::new(transport.clone(), config);
        let result = rpc.request_atom("peer", "x").await;
        assert!(matches!(result, Err(Error::Timeout(_))));
        assert_eq!(transport.abandoned.load(Ordering::SeqCst), 2);
    }
}
