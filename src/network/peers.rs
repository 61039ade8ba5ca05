//! Peer Table
//!
//! Tracks configured peers and their reachability for the TCP transport.
//! A peer that fails a request is taken out of the available set until
//! `retry_after` has passed, after which it is offered again.

use std::collections::HashMap;
use std::time::{Duration, Instant};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::atom::NodeId;
use crate::config::PeerConfig;

/// Peer reachability status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerStatus {
    /// Never contacted
    Unknown,
    /// Last request succeeded
    Active,
    /// Last request failed
    Offline,
}

impl std::fmt::Display for PeerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeerStatus::Unknown => write!(f, "UNKNOWN"),
            PeerStatus::Active => write!(f, "ACTIVE"),
            PeerStatus::Offline => write!(f, "OFFLINE"),
        }
    }
}

/// State of a single peer
#[derive(Debug, Clone)]
pub struct PeerState {
    /// Peer node id
    pub id: NodeId,
    /// Peer address (host:port)
    pub address: String,
    /// Current status
    pub status: PeerStatus,
    /// Last successful request
    pub last_seen: Option<Instant>,
    /// Last failed request
    pub last_failure: Option<Instant>,
    /// Failures since the last success
    pub consecutive_failures: u32,
}

impl PeerState {
    /// Create a new peer state
    pub fn new(id: NodeId, address: String) -> Self {
        Self {
            id,
            address,
            status: PeerStatus::Unknown,
            last_seen: None,
            last_failure: None,
            consecutive_failures: 0,
        }
    }

    /// Whether the peer should be offered to callers
    pub fn is_available(&self, retry_after: Duration) -> bool {
        match self.status {
            PeerStatus::Unknown | PeerStatus::Active => true,
            PeerStatus::Offline => self
                .last_failure
                .map(|t| t.elapsed() >= retry_after)
                .unwrap_or(true),
        }
    }
}

/// Configured peers and their reachability
pub struct PeerTable {
    peers: RwLock<HashMap<NodeId, PeerState>>,
    retry_after: Duration,
}

impl PeerTable {
    /// Create a peer table from configuration
    pub fn new(peers: &[PeerConfig], retry_after: Duration) -> Self {
        let peers = peers
            .iter()
            .map(|p| (p.id.clone(), PeerState::new(p.id.clone(), p.address.clone())))
            .collect();

        Self {
            peers: RwLock::new(peers),
            retry_after,
        }
    }

    /// Address of a peer
    pub async fn address(&self, id: &str) -> Option<String> {
        self.peers.read().await.get(id).map(|p| p.address.clone())
    }

    /// Get a peer's state
    pub async fn get(&self, id: &str) -> Option<PeerState> {
        self.peers.read().await.get(id).cloned()
    }

    /// Record a successful request
    pub async fn record_success(&self, id: &str) {
        let mut peers = self.peers.write().await;
        if let Some(peer) = peers.get_mut(id) {
            if peer.status != PeerStatus::Active {
                tracing::info!("Peer {} is reachable at {}", id, peer.address);
            }
            peer.status = PeerStatus::Active;
            peer.last_seen = Some(Instant::now());
            peer.consecutive_failures = 0;
        }
    }

    /// Record a failed request
    pub async fn record_failure(&self, id: &str) {
        let mut peers = self.peers.write().await;
        if let Some(peer) = peers.get_mut(id) {
            if peer.status != PeerStatus::Offline {
                tracing::warn!("Peer {} at {} marked offline", id, peer.address);
            }
            peer.status = PeerStatus::Offline;
            peer.last_failure = Some(Instant::now());
            peer.consecutive_failures += 1;
        }
    }

    /// Ids of peers currently offered to callers, sorted
    pub async fn available(&self) -> Vec<NodeId> {
        let peers = self.peers.read().await;
        let mut ids: Vec<NodeId> = peers
            .values()
            .filter(|p| p.is_available(self.retry_after))
            .map(|p| p.id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Number of configured peers
    pub async fn len(&self) -> usize {
        self.peers.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(retry_after: Duration) -> PeerTable {
        PeerTable::new(
            &[
                PeerConfig { id: "node-3".into(), address: "localhost:7703".into() },
                PeerConfig { id: "node-2".into(), address: "localhost:7702".into() },
            ],
            retry_after,
        )
    }

    #[tokio::test]
    async fn test_unknown_peers_are_available() {
        let peers = table(Duration::from_secs(5));
        assert_eq!(peers.len().await, 2);
        assert_eq!(peers.available().await, vec!["node-2", "node-3"]);
        assert_eq!(peers.address("node-2").await.as_deref(), Some("localhost:7702"));
    }

    #[tokio::test]
    async fn test_failed_peer_withheld_until_retry() {
        let peers = table(Duration::from_millis(50));
        peers.record_failure("node-2").await;
        assert_eq!(peers.available().await, vec!["node-3"]);
        assert_eq!(peers.get("node-2").await.unwrap().consecutive_failures, 1);

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(peers.available().await, vec!["node-2", "node-3"]);

        peers.record_success("node-2").await;
        let state = peers.get("node-2").await.unwrap();
        assert_eq!(state.status, PeerStatus::Active);
        assert_eq!(state.consecutive_failures, 0);
    }
}
