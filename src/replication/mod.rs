//! Replication Module
//!
//! Decides which peers hold a copy of each atom and keeps the number of
//! copies at the replication factor.
//!
//! Replica sets only ever name remote nodes: the node that creates an atom
//! always keeps its own copy, and placement picks up to R *other* nodes at
//! random. Pushes are best-effort; a failed push is logged and left for the
//! periodic validation pass to repair.
//!
//! Every push carries the version of the update the copy came from, so a
//! holder that already applied a newer update keeps it.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use futures::future::join_all;
use rand::seq::SliceRandom;
use tokio::sync::{Mutex, RwLock};

use crate::arena::SlotTable;
use crate::atom::{Atom, NodeId};
use crate::context::NodeContext;
use crate::error::{Error, Result};
use crate::sync::{SyncManager, Timestamp};
use crate::task::BackgroundTask;

/// Replica placement manager
pub struct ReplicationManager {
    ctx: Arc<NodeContext>,
    sync: Arc<SyncManager>,
    replicas: RwLock<SlotTable<BTreeSet<NodeId>>>,
    pass: Mutex<()>,
    timer: Mutex<Option<BackgroundTask>>,
}

impl ReplicationManager {
    /// Create a replication manager
    pub fn new(ctx: Arc<NodeContext>, sync: Arc<SyncManager>) -> Self {
        Self {
            ctx,
            sync,
            replicas: RwLock::new(SlotTable::new()),
            pass: Mutex::new(()),
            timer: Mutex::new(None),
        }
    }

    fn factor(&self) -> usize {
        self.ctx.config.replication.factor
    }

    /// Validate once, then keep validating on a timer
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let mut timer = self.timer.lock().await;
        if timer.is_some() {
            return Err(Error::InvalidState { expected: "stopped", actual: "running" });
        }

        self.validate_existing_replicas().await;

        let manager = Arc::clone(self);
        *timer = Some(BackgroundTask::periodic(
            "replica-validation",
            self.ctx.config.validate_interval(),
            move || {
                let manager = Arc::clone(&manager);
                async move {
                    manager.validate_existing_replicas().await;
                }
            },
        ));
        Ok(())
    }

    /// Stop periodic validation
    pub async fn stop(&self) -> Result<()> {
        match self.timer.lock().await.take() {
            Some(task) => task.stop().await,
            None => Ok(()),
        }
    }

    /// Whether periodic validation is scheduled
    pub async fn is_running(&self) -> bool {
        self.timer.lock().await.is_some()
    }

    /// Place a new atom, written at `version`, on up to R random available
    /// nodes
    ///
    /// Returns the nodes that accepted the copy. The entry is recorded even
    /// when empty so that validation tops it up later.
    pub async fn replicate_atom(&self, atom: &Atom, version: Timestamp) -> BTreeSet<NodeId> {
        let available = self.ctx.rpc.available_nodes().await;
        let targets = pick(&available, self.factor());

        let holders = self.push_to(atom, version, &targets).await;
        if holders.len() < self.factor() {
            tracing::debug!(
                "Atom {} placed on {}/{} nodes",
                atom.id, holders.len(), self.factor()
            );
        }

        self.replicas.write().await.insert(&atom.id, holders.clone());
        holders
    }

    /// Push a changed atom to its current holders
    ///
    /// Holders that fail the push are dropped and replaced; an atom with no
    /// recorded holders is placed from scratch.
    pub async fn refresh_replicas(&self, atom: &Atom, version: Timestamp) -> BTreeSet<NodeId> {
        let current: Vec<NodeId> = self.replica_set(&atom.id).await.into_iter().collect();
        if current.is_empty() {
            return self.replicate_atom(atom, version).await;
        }

        let holders = self.push_to(atom, version, &current).await;
        self.replicas.write().await.insert(&atom.id, holders.clone());

        if holders.len() < self.factor() {
            self.rebalance_atom_replicas(&atom.id).await;
            return self.replica_set(&atom.id).await;
        }
        holders
    }

    /// Tell every recorded holder to drop its copy and forget the entry
    pub async fn remove_replica(&self, atom_id: &str) {
        let holders = self.replicas.write().await.remove(atom_id).unwrap_or_default();

        let removals = holders.iter().map(|node| async move {
            (node, self.ctx.rpc.send_remove_replica(node, atom_id).await)
        });
        for (node, result) in join_all(removals).await {
            if let Err(e) = result {
                tracing::warn!("Failed to remove replica of {} from {}: {}", atom_id, node, e);
            }
        }
    }

    /// Health-check every recorded holder and top up under-replicated atoms
    ///
    /// Returns the number of atoms that were rebalanced.
    pub async fn validate_existing_replicas(&self) -> usize {
        let Ok(_pass) = self.pass.try_lock() else {
            tracing::debug!("Replica validation already running, skipping");
            return 0;
        };

        let entries: Vec<(String, BTreeSet<NodeId>)> = self
            .replicas
            .read()
            .await
            .iter()
            .map(|(id, holders)| (id.to_string(), holders.clone()))
            .collect();
        if entries.is_empty() {
            return 0;
        }

        let holders: BTreeSet<&NodeId> = entries.iter().flat_map(|(_, h)| h.iter()).collect();
        let probes = holders.iter().map(|node| async move {
            (node.to_string(), self.ctx.rpc.check_node_health(node).await)
        });
        let unhealthy: HashSet<NodeId> = join_all(probes)
            .await
            .into_iter()
            .filter(|(_, healthy)| !healthy)
            .map(|(node, _)| node)
            .collect();

        if !unhealthy.is_empty() {
            tracing::info!("Dropping unhealthy replica holders: {:?}", unhealthy);
        }

        let mut rebalanced = 0;
        for (atom_id, holders) in entries {
            let healthy: BTreeSet<NodeId> = holders
                .into_iter()
                .filter(|node| !unhealthy.contains(node))
                .collect();
            let short = healthy.len() < self.factor();
            if let Some(slot) = self.replicas.write().await.get_mut(&atom_id) {
                *slot = healthy;
            }
            if short && self.rebalance_atom_replicas(&atom_id).await > 0 {
                rebalanced += 1;
            }
        }
        rebalanced
    }

    /// Add holders to an atom until it reaches R; returns how many were added
    pub async fn rebalance_atom_replicas(&self, atom_id: &str) -> usize {
        let Some((atom, version)) = self.sync.versioned_copy(atom_id).await else {
            // Removed locally since it was placed
            self.replicas.write().await.remove(atom_id);
            return 0;
        };

        let current = self.replica_set(atom_id).await;
        let needed = self.factor().saturating_sub(current.len());
        if needed == 0 {
            return 0;
        }

        let candidates: Vec<NodeId> = self
            .ctx
            .rpc
            .available_nodes()
            .await
            .into_iter()
            .filter(|node| !current.contains(node))
            .collect();
        let targets = pick(&candidates, needed);
        if targets.is_empty() {
            return 0;
        }

        let added = self.push_to(&atom, version, &targets).await;
        let mut replicas = self.replicas.write().await;
        match replicas.get_mut(atom_id) {
            Some(holders) => holders.extend(added.iter().cloned()),
            None => {
                replicas.insert(atom_id, added.clone());
            }
        }

        if !added.is_empty() {
            tracing::info!("Rebalanced {}: added {:?}", atom_id, added);
        }
        added.len()
    }

    /// Nodes recorded as holding an atom
    pub async fn replica_set(&self, atom_id: &str) -> BTreeSet<NodeId> {
        self.replicas.read().await.get(atom_id).cloned().unwrap_or_default()
    }

    /// Number of atoms with a replica entry
    pub async fn replica_count(&self) -> usize {
        self.replicas.read().await.len()
    }

    async fn push_to(&self, atom: &Atom, version: Timestamp, nodes: &[NodeId]) -> BTreeSet<NodeId> {
        let pushes = nodes.iter().map(|node| async move {
            (node, self.ctx.rpc.send_atom_replica(node, atom, version).await)
        });

        let mut accepted = BTreeSet::new();
        for (node, result) in join_all(pushes).await {
            match result {
                Ok(()) => {
                    accepted.insert(node.clone());
                }
                Err(e) => tracing::warn!("Failed to replicate {} to {}: {}", atom.id, node, e),
            }
        }
        accepted
    }
}

/// Up to `count` distinct nodes chosen at random
fn pick(nodes: &[NodeId], count: usize) -> Vec<NodeId> {
    let mut rng = rand::thread_rng();
    nodes.choose_multiple(&mut rng, count).cloned().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AtomWeaveConfig;
    use crate::network::{InboundRequest, MemoryNetwork, PeerRpc, Reply, Transport};
    use crate::atom::TruthValue;
    use crate::store::local::{AtomStore, MemoryAtomStore};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    /// Start a peer that acknowledges everything and counts replica pushes
    async fn peer(network: &MemoryNetwork, id: &str) -> Arc<AtomicUsize> {
        let pushes = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&pushes);
        let (tx, mut rx) = mpsc::channel::<InboundRequest>(64);
        network.transport(id).start(tx).await.unwrap();
        tokio::spawn(async move {
            while let Some(req) = rx.recv().await {
                let reply = match req.envelope.event {
                    crate::network::PeerEvent::Heartbeat => Reply::Pong,
                    crate::network::PeerEvent::ReplicaStore { .. } => {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Reply::Ack
                    }
                    _ => Reply::Ack,
                };
                let _ = req.reply.send(reply);
            }
        });
        pushes
    }

    fn manager(network: &MemoryNetwork, id: &str, factor: usize) -> ReplicationManager {
        let mut config = AtomWeaveConfig::for_node(id);
        config.replication.factor = factor;
        config.rpc.request_timeout_ms = 100;
        config.rpc.max_attempts = 1;
        let rpc = PeerRpc::new(network.transport(id), config.rpc.clone());
        let ctx = Arc::new(NodeContext::new(config, Arc::new(MemoryAtomStore::new()), rpc));
        let sync = Arc::new(SyncManager::new(Arc::clone(&ctx)));
        ReplicationManager::new(ctx, sync)
    }

    #[tokio::test]
    async fn test_replicates_to_exactly_r_other_nodes() {
        let network = MemoryNetwork::new();
        for id in ["node-b", "node-c", "node-d", "node-e"] {
            peer(&network, id).await;
        }
        let manager = manager(&network, "node-a", 3);
        // Registered, so it would be picked if placement included self
        let (tx, _rx) = mpsc::channel(1);
        network.transport("node-a").start(tx).await.unwrap();

        for _ in 0..20 {
            let atom = Atom::node("ConceptNode", "cat", TruthValue::default());
            let holders = manager.replicate_atom(&atom, 1).await;
            assert_eq!(holders.len(), 3);
            assert!(!holders.contains("node-a"));
            assert_eq!(manager.replica_set(&atom.id).await, holders);
        }
        assert_eq!(manager.replica_count().await, 20);
    }

    #[tokio::test]
    async fn test_fewer_nodes_than_factor() {
        let network = MemoryNetwork::new();
        peer(&network, "node-b").await;
        let manager = manager(&network, "node-a", 3);

        let atom = Atom::node("ConceptNode", "cat", TruthValue::default());
        let holders = manager.replicate_atom(&atom, 1).await;
        assert_eq!(holders.into_iter().collect::<Vec<_>>(), vec!["node-b"]);
    }

    #[tokio::test]
    async fn test_failed_push_not_recorded_then_repaired() {
        let network = MemoryNetwork::new();
        peer(&network, "node-b").await;
        peer(&network, "node-c").await;
        let manager = manager(&network, "node-a", 2);

        let atom = Atom::node("ConceptNode", "cat", TruthValue::default());
        manager.ctx.store.put_atom(atom.clone()).unwrap();

        network.set_unresponsive("node-c", true);
        let holders = manager.replicate_atom(&atom, 1).await;
        assert_eq!(holders.into_iter().collect::<Vec<_>>(), vec!["node-b"]);

        network.set_unresponsive("node-c", false);
        manager.validate_existing_replicas().await;
        let healed = manager.replica_set(&atom.id).await;
        assert_eq!(healed.len(), 2);
    }

    #[tokio::test]
    async fn test_validation_drops_dead_holder_and_tops_up() {
        let network = MemoryNetwork::new();
        for id in ["node-b", "node-c", "node-d"] {
            peer(&network, id).await;
        }
        let manager = manager(&network, "node-a", 2);
        let atom = Atom::node("ConceptNode", "cat", TruthValue::default());
        manager.ctx.store.put_atom(atom.clone()).unwrap();

        let holders = manager.replicate_atom(&atom, 1).await;
        assert_eq!(holders.len(), 2);
        let dead = holders.iter().next().unwrap().clone();
        network.partition(&dead);

        assert_eq!(manager.validate_existing_replicas().await, 1);
        let after = manager.replica_set(&atom.id).await;
        assert_eq!(after.len(), 2);
        assert!(!after.contains(&dead));
    }

    #[tokio::test]
    async fn test_rebalance_pushes_recorded_version() {
        let network = MemoryNetwork::new();
        let (tx, mut rx) = mpsc::channel::<InboundRequest>(8);
        network.transport("node-b").start(tx).await.unwrap();
        let seen = tokio::spawn(async move {
            let req = rx.recv().await.unwrap();
            let version = match &req.envelope.event {
                crate::network::PeerEvent::ReplicaStore { version, .. } => Some(*version),
                _ => None,
            };
            let _ = req.reply.send(Reply::Ack);
            version
        });

        let manager = manager(&network, "node-a", 1);
        let atom = Atom::node("ConceptNode", "cat", TruthValue::default());
        let recorded = {
            let _gate = manager.ctx.write_gate().await;
            manager.ctx.store.put_atom(atom.clone()).unwrap();
            manager.sync.record_update(&atom, crate::sync::SyncOperation::Add).await
        };

        assert_eq!(manager.rebalance_atom_replicas(&atom.id).await, 1);
        assert_eq!(seen.await.unwrap(), Some(recorded.timestamp));
    }

    #[tokio::test]
    async fn test_remove_replica_clears_entry() {
        let network = MemoryNetwork::new();
        peer(&network, "node-b").await;
        let manager = manager(&network, "node-a", 1);

        let atom = Atom::node("ConceptNode", "cat", TruthValue::default());
        manager.replicate_atom(&atom, 1).await;
        manager.remove_replica(&atom.id).await;
        assert!(manager.replica_set(&atom.id).await.is_empty());
        assert_eq!(manager.replica_count().await, 0);
    }

    #[tokio::test]
    async fn test_refresh_pushes_to_current_holders() {
        let network = MemoryNetwork::new();
        let pushes_b = peer(&network, "node-b").await;
        let pushes_c = peer(&network, "node-c").await;
        let manager = manager(&network, "node-a", 1);

        let atom = Atom::node("ConceptNode", "cat", TruthValue::default());
        manager.ctx.store.put_atom(atom.clone()).unwrap();
        let holders = manager.replicate_atom(&atom, 1).await;
        let refreshed = manager
            .refresh_replicas(&atom.with_truth_value(TruthValue::new(0.5, 0.5).unwrap()), 2)
            .await;

        assert_eq!(refreshed, holders);
        let total = pushes_b.load(Ordering::SeqCst) + pushes_c.load(Ordering::SeqCst);
        assert_eq!(total, 2);
    }
}
