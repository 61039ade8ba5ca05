//! Synchronization
//!
//! Propagates local mutations to peers and pulls in updates missed while a
//! node was unreachable.
//!
//! Two paths carry updates:
//!
//! - **Push**: every local mutation is appended to the [`UpdateLog`] and
//!   immediately broadcast to the available peers.
//! - **Pull**: once at startup and then on a timer, the node exchanges
//!   "updates since the last exchange" with every peer in both directions.
//!
//! Updates carry a single timestamp and no per-origin clock, so concurrent
//! writes to one atom from two nodes resolve by last-write-wins, with equal
//! timestamps going to whichever update arrives later. Two nodes that see
//! such a pair in different orders diverge until the consistency audit
//! repairs them.

pub mod log;

pub use log::{now_millis, SyncOperation, SyncUpdate, Timestamp, UpdateLog};

use std::collections::HashMap;
use std::sync::Arc;
use futures::future::join_all;
use tokio::sync::{Mutex, RwLock};

use crate::arena::SlotTable;
use crate::atom::{Atom, NodeId};
use crate::context::NodeContext;
use crate::error::{Error, Result};
use crate::task::BackgroundTask;

/// Last applied update for one atom
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AtomVersion {
    /// Timestamp of the applied update
    pub timestamp: Timestamp,
    /// Whether the update was a removal
    pub removed: bool,
}

/// Exchange progress with one peer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PeerWatermark {
    /// Highest peer log timestamp received
    pub received: Timestamp,
    /// Highest local log timestamp delivered
    pub sent: Timestamp,
}

/// Outcome of one pull pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Peers exchanged with successfully
    pub peers_synced: usize,
    /// Peers whose exchange failed
    pub peers_failed: usize,
    /// Remote updates applied locally
    pub applied: usize,
}

/// Sync manager
pub struct SyncManager {
    ctx: Arc<NodeContext>,
    log: RwLock<UpdateLog>,
    versions: RwLock<SlotTable<AtomVersion>>,
    watermarks: RwLock<HashMap<NodeId, PeerWatermark>>,
    pass: Mutex<()>,
    timer: Mutex<Option<BackgroundTask>>,
}

impl SyncManager {
    /// Create a sync manager
    pub fn new(ctx: Arc<NodeContext>) -> Self {
        Self {
            ctx,
            log: RwLock::new(UpdateLog::new()),
            versions: RwLock::new(SlotTable::new()),
            watermarks: RwLock::new(HashMap::new()),
            pass: Mutex::new(()),
            timer: Mutex::new(None),
        }
    }

    /// Run the initial pull, then start the periodic pull
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let mut timer = self.timer.lock().await;
        if timer.is_some() {
            return Err(Error::InvalidState { expected: "stopped", actual: "running" });
        }

        let report = self.sync_with_peers().await;
        tracing::info!(
            "Initial sync: {} peers synced, {} failed, {} updates applied",
            report.peers_synced, report.peers_failed, report.applied
        );

        let manager = Arc::clone(self);
        *timer = Some(BackgroundTask::periodic("sync", self.ctx.config.sync_interval(), move || {
            let manager = Arc::clone(&manager);
            async move {
                let report = manager.sync_with_peers().await;
                if report.applied > 0 || report.peers_failed > 0 {
                    tracing::debug!(
                        "Sync pass: {} synced, {} failed, {} applied",
                        report.peers_synced, report.peers_failed, report.applied
                    );
                }
            }
        }));
        Ok(())
    }

    /// Stop the periodic pull
    pub async fn stop(&self) -> Result<()> {
        match self.timer.lock().await.take() {
            Some(task) => task.stop().await,
            None => Ok(()),
        }
    }

    /// Whether the periodic pull is scheduled
    pub async fn is_running(&self) -> bool {
        self.timer.lock().await.is_some()
    }

    // ========== Local mutations (caller holds the write gate) ==========

    /// Log a local add or update
    pub async fn record_update(&self, atom: &Atom, operation: SyncOperation) -> SyncUpdate {
        let update = self.log.write().await.append(
            atom.id.clone(),
            operation,
            Some(atom.clone()),
            self.ctx.node_id.clone(),
        );
        self.set_version(&update).await;
        update
    }

    /// Log a local removal
    pub async fn record_removal(&self, atom_id: &str) -> SyncUpdate {
        let update = self.log.write().await.append(
            atom_id.to_string(),
            SyncOperation::Remove,
            None,
            self.ctx.node_id.clone(),
        );
        self.set_version(&update).await;
        update
    }

    async fn set_version(&self, update: &SyncUpdate) {
        self.versions.write().await.insert(
            &update.atom_id,
            AtomVersion {
                timestamp: update.timestamp,
                removed: update.operation == SyncOperation::Remove,
            },
        );
    }

    // ========== Push path ==========

    /// Push a logged add/update to every available peer
    pub async fn broadcast_update(&self, update: &SyncUpdate) -> usize {
        let results = self.ctx.rpc.broadcast_atom_update(update).await;
        count_delivered(update, results)
    }

    /// Push a logged removal to every available peer
    pub async fn broadcast_removal(&self, update: &SyncUpdate) -> usize {
        let results = self.ctx.rpc.broadcast_atom_removal(update).await;
        count_delivered(update, results)
    }

    // ========== Queries ==========

    /// Local log entries strictly newer than `since`
    pub async fn get_updates_since(&self, since: Timestamp) -> Vec<SyncUpdate> {
        self.log.read().await.since(since)
    }

    /// Number of local log entries
    pub async fn log_len(&self) -> usize {
        self.log.read().await.len()
    }

    /// Last applied version of an atom
    pub async fn version(&self, atom_id: &str) -> Option<AtomVersion> {
        self.versions.read().await.get(atom_id).copied()
    }

    /// Local copy of an atom together with the timestamp of the update it
    /// came from, read under the write gate. Copies with no recorded
    /// version report 0.
    pub async fn versioned_copy(&self, atom_id: &str) -> Option<(Atom, Timestamp)> {
        let _gate = self.ctx.write_gate().await;
        let atom = self.ctx.store.get_atom(atom_id)?;
        let version = self.version(atom_id).await.map(|v| v.timestamp).unwrap_or(0);
        Some((atom, version))
    }

    /// Whether the last applied update for an atom removed it
    pub async fn is_tombstoned(&self, atom_id: &str) -> bool {
        self.version(atom_id).await.map(|v| v.removed).unwrap_or(false)
    }

    /// Exchange progress with a peer
    pub async fn watermark(&self, peer: &str) -> PeerWatermark {
        self.watermarks.read().await.get(peer).copied().unwrap_or_default()
    }

    /// Point read fallback: ask each available peer in turn
    pub async fn request_atom_sync(&self, atom_id: &str) -> Option<Atom> {
        let peers = self.ctx.rpc.available_nodes().await;
        match self.ctx.rpc.first_copy(&peers, &atom_id.to_string()).await {
            Some((node, atom)) => {
                tracing::debug!("Fetched {} from {}", atom_id, node);
                Some(atom)
            }
            None => None,
        }
    }

    // ========== Pull path ==========

    /// Exchange updates with every available peer
    pub async fn sync_with_peers(&self) -> SyncReport {
        let Ok(_pass) = self.pass.try_lock() else {
            tracing::debug!("Sync pass already running, skipping");
            return SyncReport::default();
        };

        let peers = self.ctx.rpc.available_nodes().await;
        let exchanges = peers.iter().map(|peer| self.exchange_with(peer));
        let results = join_all(exchanges).await;

        let mut report = SyncReport::default();
        for (peer, result) in peers.iter().zip(results) {
            match result {
                Ok(applied) => {
                    report.peers_synced += 1;
                    report.applied += applied;
                }
                Err(e) => {
                    report.peers_failed += 1;
                    tracing::warn!("Sync with {} failed: {}", peer, e);
                }
            }
        }
        report
    }

    async fn exchange_with(&self, peer: &str) -> Result<usize> {
        let mark = self.watermark(peer).await;
        let outgoing = self.get_updates_since(mark.sent).await;
        let sent_up_to = outgoing.last().map(|u| u.timestamp).unwrap_or(mark.sent);

        let incoming = self.ctx.rpc.exchange_updates(peer, mark.received, outgoing).await?;
        let received_up_to = incoming
            .iter()
            .map(|u| u.timestamp)
            .max()
            .unwrap_or(mark.received);

        let applied = self.process_sync_updates(incoming).await;

        let mut watermarks = self.watermarks.write().await;
        let entry = watermarks.entry(peer.to_string()).or_default();
        entry.received = entry.received.max(received_up_to);
        entry.sent = entry.sent.max(sent_up_to);
        Ok(applied)
    }

    /// Apply received updates in timestamp order; returns how many changed
    /// local state
    pub async fn process_sync_updates(&self, mut updates: Vec<SyncUpdate>) -> usize {
        updates.sort_by_key(|u| u.timestamp);

        let mut applied = 0;
        for update in &updates {
            if update.origin == self.ctx.node_id {
                continue;
            }
            match self.apply_remote_update(update).await {
                Ok(true) => applied += 1,
                Ok(false) => {}
                Err(e) => tracing::warn!(
                    "Dropping {} of {} from {}: {}",
                    update.operation, update.atom_id, update.origin, e
                ),
            }
        }
        applied
    }

    /// Apply one replicated update under the write gate. Returns false when
    /// a newer update for the atom was already applied.
    pub async fn apply_remote_update(&self, update: &SyncUpdate) -> Result<bool> {
        let _gate = self.ctx.write_gate().await;
        self.log.write().await.observe(update.timestamp);

        if let Some(current) = self.version(&update.atom_id).await {
            if update.timestamp < current.timestamp {
                tracing::trace!(
                    "Ignoring stale {} of {} ({} < {})",
                    update.operation, update.atom_id, update.timestamp, current.timestamp
                );
                return Ok(false);
            }
        }

        match update.operation {
            SyncOperation::Add | SyncOperation::Update => {
                let atom = update.payload.clone().ok_or_else(|| {
                    Error::Validation(format!("{} of {} has no payload", update.operation, update.atom_id))
                })?;
                if atom.id != update.atom_id {
                    return Err(Error::Validation(format!(
                        "payload id {} does not match {}",
                        atom.id, update.atom_id
                    )));
                }
                self.ctx.store.put_atom(atom)?;
            }
            SyncOperation::Remove => {
                self.ctx.store.remove_atom(&update.atom_id)?;
            }
        }

        self.set_version(update).await;
        Ok(true)
    }

    /// Store a replica copy taken at `version` under the write gate
    ///
    /// A replica is a redundant delivery of an update the holder already
    /// applied, so it is stored only when strictly newer than the recorded
    /// version. A removal recorded at or after `version` keeps the atom
    /// gone. Returns whether the copy was stored.
    pub async fn apply_replica(&self, atom: Atom, version: Timestamp) -> Result<bool> {
        let _gate = self.ctx.write_gate().await;
        self.log.write().await.observe(version);

        if let Some(current) = self.version(&atom.id).await {
            if version <= current.timestamp {
                tracing::trace!(
                    "Ignoring replica of {} at {} (have {}{})",
                    atom.id, version, current.timestamp,
                    if current.removed { ", removed" } else { "" }
                );
                return Ok(false);
            }
        }

        let atom_id = atom.id.clone();
        self.ctx.store.put_atom(atom)?;
        self.versions.write().await.insert(
            &atom_id,
            AtomVersion { timestamp: version, removed: false },
        );
        Ok(true)
    }

    /// Answer a peer's exchange: apply what it sent, reply with ours
    pub async fn handle_sync_request(
        &self,
        sender: &str,
        since: Timestamp,
        updates: Vec<SyncUpdate>,
    ) -> Vec<SyncUpdate> {
        if !updates.is_empty() {
            let up_to = updates.iter().map(|u| u.timestamp).max().unwrap_or(0);
            let applied = self.process_sync_updates(updates).await;
            tracing::debug!("Applied {} updates pushed by {}", applied, sender);

            let mut watermarks = self.watermarks.write().await;
            let entry = watermarks.entry(sender.to_string()).or_default();
            entry.received = entry.received.max(up_to);
        }
        self.get_updates_since(since).await
    }
}

fn count_delivered(update: &SyncUpdate, results: Vec<(NodeId, Result<()>)>) -> usize {
    let mut delivered = 0;
    for (node, result) in results {
        match result {
            Ok(()) => delivered += 1,
            Err(e) => tracing::warn!(
                "Failed to push {} of {} to {}: {}",
                update.operation, update.atom_id, node, e
            ),
        }
    }
    delivered
}
