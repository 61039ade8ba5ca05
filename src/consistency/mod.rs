//! Consistency Audit
//!
//! Detects replicas that disagree about an atom and repairs the local copy
//! by plurality vote over the peers' copies.
//!
//! The check is strict: an atom is consistent only when every available
//! peer returns the same hash as the local copy. A peer that times out,
//! lacks the atom, or holds a different version all count as disagreement.
//! The hash covers id, type and truth value; outgoing sets are not compared.

use std::collections::HashMap;
use std::sync::Arc;
use futures::future::join_all;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;

use crate::arena::SlotTable;
use crate::atom::{consistency_hash, Atom, AtomHash, AtomId};
use crate::context::NodeContext;
use crate::error::{Error, Result};
use crate::task::BackgroundTask;

/// Last audited hash of an atom
#[derive(Debug, Clone)]
pub struct ConsistencyRecord {
    pub atom_id: AtomId,
    pub hash: AtomHash,
    /// When the hash was taken; records older than the audit interval are stale
    pub checked_at: Instant,
}

/// Result of repairing one atom
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// The winning version already matched the local copy
    Unchanged,
    /// The local copy was replaced with the version carrying this hash
    Adopted(AtomHash),
    /// No peer returned a copy; the local atom was left as is
    NoPeerVersion,
}

/// Outcome of one audit pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AuditReport {
    /// Atoms checked
    pub checked: usize,
    /// Atoms every peer agreed on
    pub consistent: usize,
    /// Atoms whose local copy was replaced
    pub repaired: usize,
    /// Atoms left as is after a failed check
    pub unresolved: usize,
}

/// Consistency manager
pub struct ConsistencyManager {
    ctx: Arc<NodeContext>,
    records: RwLock<SlotTable<ConsistencyRecord>>,
    pass: Mutex<()>,
    timer: Mutex<Option<BackgroundTask>>,
}

impl ConsistencyManager {
    /// Create a consistency manager
    pub fn new(ctx: Arc<NodeContext>) -> Self {
        Self {
            ctx,
            records: RwLock::new(SlotTable::new()),
            pass: Mutex::new(()),
            timer: Mutex::new(None),
        }
    }

    /// Start the periodic audit
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let mut timer = self.timer.lock().await;
        if timer.is_some() {
            return Err(Error::InvalidState { expected: "stopped", actual: "running" });
        }

        let manager = Arc::clone(self);
        *timer = Some(BackgroundTask::periodic("consistency-audit", self.ctx.config.audit_interval(), move || {
            let manager = Arc::clone(&manager);
            async move {
                let report = manager.run_audit().await;
                if report.checked > report.consistent {
                    tracing::info!(
                        "Audit: {}/{} consistent, {} repaired, {} unresolved",
                        report.consistent, report.checked, report.repaired, report.unresolved
                    );
                }
            }
        }));
        Ok(())
    }

    /// Stop the periodic audit
    pub async fn stop(&self) -> Result<()> {
        match self.timer.lock().await.take() {
            Some(task) => task.stop().await,
            None => Ok(()),
        }
    }

    /// Whether the periodic audit is scheduled
    pub async fn is_running(&self) -> bool {
        self.timer.lock().await.is_some()
    }

    /// Hash of the local copy, answered to peers' consistency checks
    pub fn local_hash(&self, atom_id: &str) -> Option<AtomHash> {
        self.ctx.store.get_atom(atom_id).map(|atom| consistency_hash(&atom))
    }

    /// Overwrite the record for an atom with its current hash
    pub async fn record(&self, atom: &Atom) -> AtomHash {
        let hash = consistency_hash(atom);
        self.records.write().await.insert(
            &atom.id,
            ConsistencyRecord {
                atom_id: atom.id.clone(),
                hash: hash.clone(),
                checked_at: Instant::now(),
            },
        );
        hash
    }

    /// Drop the record of a removed atom
    pub async fn forget(&self, atom_id: &str) {
        self.records.write().await.remove(atom_id);
    }

    /// Last record for an atom
    pub async fn get_record(&self, atom_id: &str) -> Option<ConsistencyRecord> {
        self.records.read().await.get(atom_id).cloned()
    }

    /// Whether every available peer holds the same version as `atom`
    pub async fn check_atom_consistency(&self, atom: &Atom) -> bool {
        let local = self.record(atom).await;

        let peers = self.ctx.rpc.available_nodes().await;
        if peers.is_empty() {
            return true;
        }

        let queries = peers.iter().map(|peer| self.ctx.rpc.request_atom_hash(peer, &atom.id));
        let answers = join_all(queries).await;

        let mut consistent = true;
        for (peer, answer) in peers.iter().zip(answers) {
            match answer {
                Ok(Some(hash)) if hash == local => {}
                Ok(Some(_)) => {
                    tracing::debug!("{} holds a different version of {}", peer, atom.id);
                    consistent = false;
                }
                Ok(None) => {
                    tracing::debug!("{} has no copy of {}", peer, atom.id);
                    consistent = false;
                }
                Err(e) => {
                    tracing::debug!("Hash request for {} to {} failed: {}", atom.id, peer, e);
                    consistent = false;
                }
            }
        }
        consistent
    }

    /// Replace the local copy with the most common peer version
    pub async fn resolve_inconsistencies(&self, atom_id: &str) -> Result<Resolution> {
        let peers = self.ctx.rpc.available_nodes().await;
        let fetches = peers.iter().map(|peer| self.ctx.rpc.request_atom(peer, atom_id));

        let mut versions = Vec::new();
        for (peer, fetched) in peers.iter().zip(join_all(fetches).await) {
            match fetched {
                Ok(Some(atom)) if atom.id == atom_id => versions.push(atom),
                Ok(Some(atom)) => tracing::warn!("{} answered {} with {}", peer, atom_id, atom.id),
                Ok(None) => {}
                Err(e) => tracing::debug!("Fetch of {} from {} failed: {}", atom_id, peer, e),
            }
        }

        let Some(winner) = plurality(versions) else {
            tracing::warn!("No peer version of {} available, leaving local copy", atom_id);
            return Ok(Resolution::NoPeerVersion);
        };
        let winning_hash = consistency_hash(&winner);

        let _gate = self.ctx.write_gate().await;
        match self.ctx.store.get_atom(atom_id) {
            None => {
                // Removed locally while the fetches were in flight
                self.forget(atom_id).await;
                return Ok(Resolution::Unchanged);
            }
            Some(local) if consistency_hash(&local) == winning_hash => {
                self.record(&local).await;
                return Ok(Resolution::Unchanged);
            }
            Some(_) => {}
        }

        self.ctx.store.put_atom(winner.clone())?;
        self.record(&winner).await;
        tracing::info!("Repaired {} to the majority version {}", atom_id, winning_hash);
        Ok(Resolution::Adopted(winning_hash))
    }

    /// Reject a write that conflicts with a recently audited version
    ///
    /// Records older than the audit interval are stale and never block.
    pub async fn validate_update(&self, atom: &Atom) -> Result<()> {
        let records = self.records.read().await;
        let Some(record) = records.get(&atom.id) else {
            return Ok(());
        };
        if record.checked_at.elapsed() >= self.ctx.config.audit_interval() {
            return Ok(());
        }
        if record.hash != consistency_hash(atom) {
            return Err(Error::Conflict { atom_id: atom.id.clone() });
        }
        Ok(())
    }

    /// Fraction of local atoms that pass the check (1.0 with no atoms)
    pub async fn consistency_score(&self) -> f64 {
        let atoms = self.ctx.store.get_all_atoms();
        if atoms.is_empty() {
            return 1.0;
        }

        let mut passing = 0;
        for atom in &atoms {
            if self.check_atom_consistency(atom).await {
                passing += 1;
            }
        }
        passing as f64 / atoms.len() as f64
    }

    /// Check every local atom and repair the ones that fail
    pub async fn run_audit(&self) -> AuditReport {
        let Ok(_pass) = self.pass.try_lock() else {
            tracing::debug!("Audit already running, skipping");
            return AuditReport::default();
        };

        let mut report = AuditReport::default();
        for atom in self.ctx.store.get_all_atoms() {
            report.checked += 1;
            if self.check_atom_consistency(&atom).await {
                report.consistent += 1;
                continue;
            }

            match self.resolve_inconsistencies(&atom.id).await {
                Ok(Resolution::Adopted(_)) => report.repaired += 1,
                Ok(Resolution::Unchanged) | Ok(Resolution::NoPeerVersion) => report.unresolved += 1,
                Err(e) => {
                    tracing::warn!("Repair of {} failed: {}", atom.id, e);
                    report.unresolved += 1;
                }
            }
        }
        report
    }
}

/// Most common version by consistency hash; ties go to the version seen first
pub fn plurality(versions: Vec<Atom>) -> Option<Atom> {
    let mut counts: HashMap<AtomHash, usize> = HashMap::new();
    let mut order: Vec<(AtomHash, Atom)> = Vec::new();

    for atom in versions {
        let hash = consistency_hash(&atom);
        let count = counts.entry(hash.clone()).or_insert(0);
        if *count == 0 {
            order.push((hash, atom));
        }
        *count += 1;
    }

    let mut best: Option<(usize, Atom)> = None;
    for (hash, atom) in order {
        let count = counts[&hash];
        if best.as_ref().map_or(true, |(top, _)| count > *top) {
            best = Some((count, atom));
        }
    }
    best.map(|(_, atom)| atom)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atom::TruthValue;
    use crate::config::AtomWeaveConfig;
    use crate::network::{InboundRequest, MemoryNetwork, PeerEvent, PeerRpc, Reply, Transport};
    use crate::store::local::{AtomStore, MemoryAtomStore};
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn version(id: &str, strength: f64) -> Atom {
        let mut atom = Atom::node("ConceptNode", "cat", TruthValue::new(strength, 0.8).unwrap());
        atom.id = id.to_string();
        atom
    }

    /// Start a peer that answers from its own store
    async fn peer(network: &MemoryNetwork, id: &str, atoms: Vec<Atom>) -> Arc<MemoryAtomStore> {
        let store = Arc::new(MemoryAtomStore::with_atoms(atoms));
        let serving = Arc::clone(&store);
        let (tx, mut rx) = mpsc::channel::<InboundRequest>(64);
        network.transport(id).start(tx).await.unwrap();
        tokio::spawn(async move {
            while let Some(req) = rx.recv().await {
                let reply = match req.envelope.event {
                    PeerEvent::ConsistencyCheck { atom_id } => {
                        Reply::Hash(serving.get_atom(&atom_id).map(|a| consistency_hash(&a)))
                    }
                    PeerEvent::AtomRequest { atom_id } => Reply::Atom(serving.get_atom(&atom_id)),
                    _ => Reply::Pong,
                };
                let _ = req.reply.send(reply);
            }
        });
        store
    }

    fn manager(network: &MemoryNetwork, atoms: Vec<Atom>) -> ConsistencyManager {
        manager_with_audit(network, atoms, 10_000)
    }

    fn manager_with_audit(network: &MemoryNetwork, atoms: Vec<Atom>, audit_ms: u64) -> ConsistencyManager {
        let mut config = AtomWeaveConfig::for_node("node-a");
        config.consistency.interval_ms = audit_ms;
        config.rpc.request_timeout_ms = 50;
        config.rpc.max_attempts = 1;
        let rpc = PeerRpc::new(network.transport("node-a"), config.rpc.clone());
        let store = Arc::new(MemoryAtomStore::with_atoms(atoms));
        ConsistencyManager::new(Arc::new(NodeContext::new(config, store, rpc)))
    }

    #[test]
    fn test_plurality_picks_most_common() {
        let a = version("x", 0.1);
        let b = version("x", 0.9);
        let winner = plurality(vec![a.clone(), a.clone(), b]).unwrap();
        assert_eq!(winner, a);

        let winner = plurality(vec![version("x", 0.9), a.clone(), a.clone()]).unwrap();
        assert_eq!(winner, a);
    }

    #[test]
    fn test_plurality_tie_goes_to_first_seen() {
        let a = version("x", 0.1);
        let b = version("x", 0.9);
        assert_eq!(plurality(vec![b.clone(), a.clone()]).unwrap(), b);
        assert_eq!(plurality(vec![a.clone(), b.clone(), b.clone(), a.clone()]).unwrap(), a);
        assert!(plurality(Vec::new()).is_none());
    }

    #[tokio::test]
    async fn test_no_peers_is_consistent() {
        let network = MemoryNetwork::new();
        let node = manager(&network, vec![version("x", 0.5)]);
        assert_eq!(node.consistency_score().await, 1.0);

        let empty = manager(&network, Vec::new());
        assert_eq!(empty.consistency_score().await, 1.0);
    }

    #[tokio::test]
    async fn test_score_drops_by_one_over_n() {
        let network = MemoryNetwork::new();
        let atoms: Vec<Atom> = (0..4).map(|i| version(&format!("atom-{}", i), 0.5)).collect();
        let peer_b = peer(&network, "node-b", atoms.clone()).await;
        peer(&network, "node-c", atoms.clone()).await;
        let manager = manager(&network, atoms.clone());

        assert_eq!(manager.consistency_score().await, 1.0);

        peer_b.put_atom(version("atom-2", 0.1)).unwrap();
        let score = manager.consistency_score().await;
        assert!((score - 0.75).abs() < 1e-9, "score {}", score);
    }

    #[tokio::test]
    async fn test_timeout_counts_as_disagreement() {
        let network = MemoryNetwork::new();
        let atom = version("x", 0.5);
        peer(&network, "node-b", vec![atom.clone()]).await;
        peer(&network, "node-c", vec![atom.clone()]).await;
        let manager = manager(&network, vec![atom.clone()]);
        assert!(manager.check_atom_consistency(&atom).await);

        network.set_unresponsive("node-c", true);
        assert!(!manager.check_atom_consistency(&atom).await);
    }

    #[tokio::test]
    async fn test_missing_copy_counts_as_disagreement() {
        let network = MemoryNetwork::new();
        let atom = version("x", 0.5);
        peer(&network, "node-b", vec![atom.clone()]).await;
        peer(&network, "node-c", Vec::new()).await;
        let manager = manager(&network, vec![atom.clone()]);
        assert!(!manager.check_atom_consistency(&atom).await);
    }

    #[tokio::test]
    async fn test_audit_adopts_majority_version() {
        let network = MemoryNetwork::new();
        let majority = version("x", 0.7);
        peer(&network, "node-b", vec![majority.clone()]).await;
        peer(&network, "node-c", vec![majority.clone()]).await;
        peer(&network, "node-d", vec![version("x", 0.2)]).await;
        let manager = manager(&network, vec![version("x", 0.1)]);

        let report = manager.run_audit().await;
        assert_eq!(report, AuditReport { checked: 1, consistent: 0, repaired: 1, unresolved: 0 });
        assert_eq!(manager.ctx.store.get_atom("x").unwrap(), majority);
        assert_eq!(manager.get_record("x").await.unwrap().hash, consistency_hash(&majority));
    }

    #[tokio::test]
    async fn test_no_peer_version_leaves_local_copy() {
        let network = MemoryNetwork::new();
        peer(&network, "node-b", Vec::new()).await;
        let local = version("x", 0.1);
        let manager = manager(&network, vec![local.clone()]);

        assert_eq!(manager.resolve_inconsistencies("x").await.unwrap(), Resolution::NoPeerVersion);
        assert_eq!(manager.ctx.store.get_atom("x").unwrap(), local);
    }

    #[tokio::test]
    async fn test_validate_update_window() {
        let network = MemoryNetwork::new();
        let manager = manager_with_audit(&network, vec![version("x", 0.5)], 50);

        let audited = version("x", 0.5);
        let conflicting = version("x", 0.9);

        // No record yet
        assert!(manager.validate_update(&conflicting).await.is_ok());

        manager.check_atom_consistency(&audited).await;
        assert!(manager.validate_update(&audited).await.is_ok());
        assert!(matches!(
            manager.validate_update(&conflicting).await,
            Err(Error::Conflict { .. })
        ));

        tokio::time::sleep(Duration::from_millis(70)).await;
        assert!(manager.validate_update(&conflicting).await.is_ok());
    }
}
