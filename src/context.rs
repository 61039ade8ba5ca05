//! Node Context
//!
//! Everything the managers of one node share. Built once by the
//! [`DistributedStore`](crate::store::DistributedStore) and handed to each
//! manager, so several nodes can live in one process.

use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};

use crate::atom::NodeId;
use crate::config::AtomWeaveConfig;
use crate::network::PeerRpc;
use crate::store::local::AtomStore;

/// Shared per-node state
pub struct NodeContext {
    /// This node's id
    pub node_id: NodeId,
    /// Node configuration
    pub config: AtomWeaveConfig,
    /// Local atom store
    pub store: Arc<dyn AtomStore>,
    /// RPC client to peers
    pub rpc: PeerRpc,
    /// Serializes local writes and replicated applies
    write_gate: Mutex<()>,
}

impl NodeContext {
    /// Create a context
    pub fn new(config: AtomWeaveConfig, store: Arc<dyn AtomStore>, rpc: PeerRpc) -> Self {
        Self {
            node_id: config.node.id.clone(),
            config,
            store,
            rpc,
            write_gate: Mutex::new(()),
        }
    }

    /// Take the single-writer gate. Never hold it across a network call.
    pub async fn write_gate(&self) -> MutexGuard<'_, ()> {
        self.write_gate.lock().await
    }
}
