//! Distributed Store
//!
//! Wraps a local [`AtomStore`] and turns it into one node of a replicated
//! cluster. Every local mutation is written locally first and only then
//! replicated and broadcast; inbound peer events are dispatched to the
//! sync, replication and consistency managers.

pub mod local;
pub mod persistence;

use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, RwLock};

use crate::atom::{Atom, AtomId, NodeId, TruthValue};
use crate::config::AtomWeaveConfig;
use crate::consistency::ConsistencyManager;
use crate::context::NodeContext;
use crate::error::{Error, Result};
use crate::network::{Envelope, ErrorCode, InboundRequest, PeerEvent, PeerRpc, Reply, Transport};
use crate::replication::ReplicationManager;
use crate::sync::{SyncManager, SyncOperation, SyncUpdate};
use crate::task::BackgroundTask;

use local::AtomStore;

/// Depth of the inbound request queue
const INBOUND_QUEUE: usize = 1024;

/// Node lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Uninitialized,
    Starting,
    Running,
    ShuttingDown,
    Stopped,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Uninitialized => "uninitialized",
            LifecycleState::Starting => "starting",
            LifecycleState::Running => "running",
            LifecycleState::ShuttingDown => "shutting-down",
            LifecycleState::Stopped => "stopped",
        }
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One node of the replicated atom store
pub struct DistributedStore {
    ctx: Arc<NodeContext>,
    transport: Arc<dyn Transport>,
    sync: Arc<SyncManager>,
    replication: Arc<ReplicationManager>,
    consistency: Arc<ConsistencyManager>,
    state: RwLock<LifecycleState>,
    dispatcher: Mutex<Option<BackgroundTask>>,
}

impl DistributedStore {
    /// Assemble a node; nothing runs until [`start`](Self::start)
    pub fn new(
        config: AtomWeaveConfig,
        transport: Arc<dyn Transport>,
        store: Arc<dyn AtomStore>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        if transport.local_node_id() != config.node.id {
            return Err(Error::Config(format!(
                "transport belongs to {}, config to {}",
                transport.local_node_id(),
                config.node.id
            )));
        }

        let rpc = PeerRpc::new(Arc::clone(&transport), config.rpc.clone());
        let ctx = Arc::new(NodeContext::new(config, store, rpc));

        let sync = Arc::new(SyncManager::new(Arc::clone(&ctx)));

        Ok(Arc::new(Self {
            replication: Arc::new(ReplicationManager::new(Arc::clone(&ctx), Arc::clone(&sync))),
            sync,
            consistency: Arc::new(ConsistencyManager::new(Arc::clone(&ctx))),
            ctx,
            transport,
            state: RwLock::new(LifecycleState::Uninitialized),
            dispatcher: Mutex::new(None),
        }))
    }

    /// Bring up the transport, then sync, replication and consistency
    ///
    /// On failure everything already started is stopped again, the node
    /// ends up `stopped` and the error is returned.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        self.transition(LifecycleState::Uninitialized, LifecycleState::Starting).await?;
        tracing::info!("Starting node {}", self.ctx.node_id);

        if let Err(e) = self.start_components().await {
            tracing::error!("Startup of {} failed: {}", self.ctx.node_id, e);
            if let Err(cleanup) = self.stop_components().await {
                tracing::warn!("Cleanup after failed startup: {}", cleanup);
            }
            *self.state.write().await = LifecycleState::Stopped;
            return Err(e);
        }

        *self.state.write().await = LifecycleState::Running;
        tracing::info!("Node {} running", self.ctx.node_id);
        Ok(())
    }

    async fn start_components(self: &Arc<Self>) -> Result<()> {
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE);
        self.transport
            .start(inbound_tx)
            .await
            .map_err(|e| Error::Startup(format!("transport: {}", e)))?;
        self.start_dispatcher(inbound_rx).await;

        self.sync.start().await?;
        self.replication.start().await?;
        self.consistency.start().await?;
        Ok(())
    }

    async fn start_dispatcher(self: &Arc<Self>, mut inbound: mpsc::Receiver<InboundRequest>) {
        let node = Arc::clone(self);
        let task = BackgroundTask::spawn("dispatcher", move |mut shutdown| async move {
            loop {
                tokio::select! {
                    request = inbound.recv() => {
                        let Some(InboundRequest { envelope, reply }) = request else {
                            break;
                        };
                        let answer = node.handle_event(envelope).await;
                        let _ = reply.send(answer);
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            tracing::debug!("Dispatcher for {} stopped", node.ctx.node_id);
        });
        *self.dispatcher.lock().await = Some(task);
    }

    /// Stop sync, replication, consistency, then the transport
    ///
    /// Every stage runs even if an earlier one fails; the first error is
    /// returned.
    pub async fn shutdown(&self) -> Result<()> {
        self.transition(LifecycleState::Running, LifecycleState::ShuttingDown).await?;
        tracing::info!("Shutting down node {}", self.ctx.node_id);

        let result = self.stop_components().await;
        *self.state.write().await = LifecycleState::Stopped;

        match &result {
            Ok(()) => tracing::info!("Node {} stopped", self.ctx.node_id),
            Err(e) => tracing::warn!("Node {} stopped with error: {}", self.ctx.node_id, e),
        }
        result
    }

    async fn stop_components(&self) -> Result<()> {
        let stages = [
            ("sync", self.sync.stop().await),
            ("replication", self.replication.stop().await),
            ("consistency", self.consistency.stop().await),
            ("transport", self.transport.stop().await),
            ("dispatcher", match self.dispatcher.lock().await.take() {
                Some(task) => task.stop().await,
                None => Ok(()),
            }),
        ];

        let mut first = None;
        for (stage, result) in stages {
            if let Err(e) = result {
                tracing::warn!("Stopping {} failed: {}", stage, e);
                first.get_or_insert(e);
            }
        }
        first.map_or(Ok(()), Err)
    }

    async fn transition(&self, from: LifecycleState, to: LifecycleState) -> Result<()> {
        let mut state = self.state.write().await;
        if *state != from {
            return Err(Error::InvalidState {
                expected: from.as_str(),
                actual: state.as_str(),
            });
        }
        *state = to;
        Ok(())
    }

    async fn ensure_running(&self) -> Result<()> {
        let state = *self.state.read().await;
        if state != LifecycleState::Running {
            return Err(Error::InvalidState {
                expected: LifecycleState::Running.as_str(),
                actual: state.as_str(),
            });
        }
        Ok(())
    }

    // ========== Local mutations ==========

    /// Create a node-shaped atom
    pub async fn add_node(&self, atom_type: &str, name: &str, truth_value: TruthValue) -> Result<Atom> {
        self.ensure_running().await?;
        let (atom, update) = {
            let _gate = self.ctx.write_gate().await;
            let atom = self.ctx.store.add_node(atom_type, name, truth_value)?;
            let update = self.sync.record_update(&atom, SyncOperation::Add).await;
            (atom, update)
        };

        self.replication.replicate_atom(&atom, update.timestamp).await;
        self.sync.broadcast_update(&update).await;
        Ok(atom)
    }

    /// Create a link-shaped atom over existing atoms
    pub async fn add_link(&self, atom_type: &str, outgoing: Vec<AtomId>, truth_value: TruthValue) -> Result<Atom> {
        self.ensure_running().await?;
        let (atom, update) = {
            let _gate = self.ctx.write_gate().await;
            let atom = self.ctx.store.add_link(atom_type, outgoing, truth_value)?;
            let update = self.sync.record_update(&atom, SyncOperation::Add).await;
            (atom, update)
        };

        self.replication.replicate_atom(&atom, update.timestamp).await;
        self.sync.broadcast_update(&update).await;
        Ok(atom)
    }

    /// Replace an existing atom in full
    pub async fn update_atom(&self, atom: Atom) -> Result<Atom> {
        self.ensure_running().await?;
        let update = {
            let _gate = self.ctx.write_gate().await;
            if self.ctx.store.get_atom(&atom.id).is_none() {
                return Err(Error::AtomNotFound(atom.id));
            }
            self.ctx.store.put_atom(atom.clone())?;
            self.sync.record_update(&atom, SyncOperation::Update).await
        };

        self.replication.refresh_replicas(&atom, update.timestamp).await;
        self.sync.broadcast_update(&update).await;
        Ok(atom)
    }

    /// Delete an atom everywhere; returns false if it did not exist locally
    pub async fn remove_atom(&self, atom_id: &str) -> Result<bool> {
        self.ensure_running().await?;
        let update: SyncUpdate = {
            let _gate = self.ctx.write_gate().await;
            if !self.ctx.store.remove_atom(atom_id)? {
                return Ok(false);
            }
            self.sync.record_removal(atom_id).await
        };

        self.consistency.forget(atom_id).await;
        self.replication.remove_replica(atom_id).await;
        self.sync.broadcast_removal(&update).await;
        Ok(true)
    }

    // ========== Reads ==========

    /// Local copy of an atom
    pub fn get_atom(&self, atom_id: &str) -> Option<Atom> {
        self.ctx.store.get_atom(atom_id)
    }

    /// Every local atom
    pub fn get_all_atoms(&self) -> Vec<Atom> {
        self.ctx.store.get_all_atoms()
    }

    pub fn node_id(&self) -> &NodeId {
        &self.ctx.node_id
    }

    pub async fn state(&self) -> LifecycleState {
        *self.state.read().await
    }

    pub fn sync(&self) -> &Arc<SyncManager> {
        &self.sync
    }

    pub fn replication(&self) -> &Arc<ReplicationManager> {
        &self.replication
    }

    pub fn consistency(&self) -> &Arc<ConsistencyManager> {
        &self.consistency
    }

    pub fn local_store(&self) -> &Arc<dyn AtomStore> {
        &self.ctx.store
    }

    // ========== Inbound ==========

    /// Answer one peer request
    pub async fn handle_event(&self, envelope: Envelope) -> Reply {
        let state = *self.state.read().await;
        if matches!(state, LifecycleState::ShuttingDown | LifecycleState::Stopped) {
            return Reply::Error {
                code: ErrorCode::ShuttingDown,
                message: format!("node {} is {}", self.ctx.node_id, state),
            };
        }

        let Envelope { event, sender, .. } = envelope;
        tracing::trace!("Handling {} from {}", event.type_name(), sender);

        match event {
            PeerEvent::Heartbeat => Reply::Pong,

            PeerEvent::AtomUpdate(update) => {
                if sender == self.ctx.node_id || update.origin == self.ctx.node_id {
                    return Reply::Ack;
                }
                if let Some(atom) = &update.payload {
                    if let Err(e) = self.consistency.validate_update(atom).await {
                        tracing::debug!("Rejected {} of {} from {}: {}", update.operation, update.atom_id, sender, e);
                        return Reply::Rejected(e.to_string());
                    }
                }
                match self.sync.apply_remote_update(&update).await {
                    Ok(_) => Reply::Ack,
                    Err(e) => invalid(e),
                }
            }

            PeerEvent::SyncRequest { since, updates } => {
                Reply::Updates(self.sync.handle_sync_request(&sender, since, updates).await)
            }

            PeerEvent::AtomRequest { atom_id } => Reply::Atom(self.ctx.store.get_atom(&atom_id)),

            PeerEvent::ConsistencyCheck { atom_id } => Reply::Hash(self.consistency.local_hash(&atom_id)),

            PeerEvent::ReplicaStore { atom, version } => {
                let atom_id = atom.id.clone();
                match self.sync.apply_replica(atom, version).await {
                    Ok(true) => Reply::Ack,
                    Ok(false) => {
                        tracing::debug!("Kept newer copy of {} over replica from {}", atom_id, sender);
                        Reply::Ack
                    }
                    Err(e) => invalid(e),
                }
            }

            PeerEvent::ReplicaRemove { atom_id } => {
                let _gate = self.ctx.write_gate().await;
                match self.ctx.store.remove_atom(&atom_id) {
                    Ok(_) => Reply::Ack,
                    Err(e) => invalid(e),
                }
            }
        }
    }
}

fn invalid(e: Error) -> Reply {
    Reply::Error {
        code: ErrorCode::Invalid,
        message: e.to_string(),
    }
}
