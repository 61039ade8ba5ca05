//! In-Process Network
//!
//! Connects any number of nodes inside one process. Used by the test suite
//! and for local simulation; supports partitioning a node away from the rest
//! and making a node accept requests but never answer them.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, oneshot};

use super::{InboundRequest, Transport};
use super::protocol::{Envelope, Reply};
use crate::atom::NodeId;
use crate::error::{Error, Result};

#[derive(Default)]
struct HubState {
    endpoints: HashMap<NodeId, mpsc::Sender<InboundRequest>>,
    partitioned: HashSet<NodeId>,
    unresponsive: HashSet<NodeId>,
}

/// Shared in-process network
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<Mutex<HubState>>,
}

impl MemoryNetwork {
    /// Create an empty network
    pub fn new() -> Self {
        Self::default()
    }

    /// Transport for a node on this network
    pub fn transport(&self, node_id: impl Into<NodeId>) -> Arc<MemoryTransport> {
        Arc::new(MemoryTransport {
            node_id: node_id.into(),
            network: self.clone(),
            registered: AtomicBool::new(false),
        })
    }

    /// Cut a node off from every other node
    pub fn partition(&self, node_id: &str) {
        tracing::info!("Partitioning {}", node_id);
        self.lock().partitioned.insert(node_id.to_string());
    }

    /// Reconnect a partitioned node
    pub fn heal(&self, node_id: &str) {
        tracing::info!("Healing {}", node_id);
        self.lock().partitioned.remove(node_id);
    }

    /// Make a node swallow requests without replying
    pub fn set_unresponsive(&self, node_id: &str, unresponsive: bool) {
        let mut state = self.lock();
        if unresponsive {
            state.unresponsive.insert(node_id.to_string());
        } else {
            state.unresponsive.remove(node_id);
        }
    }

    /// Ids of nodes whose transport is started
    pub fn registered(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self.lock().endpoints.keys().cloned().collect();
        ids.sort();
        ids
    }

    // The hub state is plain maps and sets; a poisoned lock holds nothing
    // half-updated.
    fn lock(&self) -> MutexGuard<'_, HubState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// One node's handle on a [`MemoryNetwork`]
pub struct MemoryTransport {
    node_id: NodeId,
    network: MemoryNetwork,
    /// Set while this handle owns the node's endpoint
    registered: AtomicBool,
}

#[async_trait::async_trait]
impl Transport for MemoryTransport {
    fn local_node_id(&self) -> &str {
        &self.node_id
    }

    async fn start(&self, inbound: mpsc::Sender<InboundRequest>) -> Result<()> {
        let mut state = self.network.lock();
        if state.endpoints.contains_key(&self.node_id) {
            return Err(Error::Network(format!("node {} already registered", self.node_id)));
        }
        state.endpoints.insert(self.node_id.clone(), inbound);
        self.registered.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        if self.registered.swap(false, Ordering::SeqCst) {
            self.network.lock().endpoints.remove(&self.node_id);
        }
        Ok(())
    }

    async fn available_nodes(&self) -> Vec<NodeId> {
        let state = self.network.lock();
        if state.partitioned.contains(&self.node_id) {
            return Vec::new();
        }

        let mut ids: Vec<NodeId> = state
            .endpoints
            .keys()
            .filter(|id| **id != self.node_id && !state.partitioned.contains(*id))
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    async fn request(&self, node: &str, envelope: Envelope) -> Result<Reply> {
        let (endpoint, unresponsive) = {
            let state = self.network.lock();
            if state.partitioned.contains(&self.node_id) || state.partitioned.contains(node) {
                return Err(Error::Unreachable(node.to_string()));
            }
            let endpoint = state
                .endpoints
                .get(node)
                .cloned()
                .ok_or_else(|| Error::Unreachable(node.to_string()))?;
            (endpoint, state.unresponsive.contains(node))
        };

        if unresponsive {
            // Only the caller's timeout ends this request
            std::future::pending::<()>().await;
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        endpoint
            .send(InboundRequest { envelope, reply: reply_tx })
            .await
            .map_err(|_| Error::Unreachable(node.to_string()))?;

        reply_rx
            .await
            .map_err(|_| Error::Network(format!("{} dropped the request", node)))
    }
}
