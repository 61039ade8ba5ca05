//! Update Log
//!
//! Append-only, in-memory record of this node's own mutations. Entries are
//! never modified after append and their timestamps strictly increase, so a
//! "since" query is a binary search.

use serde::{Deserialize, Serialize};

use crate::atom::{Atom, AtomId, NodeId};

/// Milliseconds since the Unix epoch
pub type Timestamp = u64;

/// Current wall-clock time as a [`Timestamp`]
pub fn now_millis() -> Timestamp {
    chrono::Utc::now().timestamp_millis().max(0) as Timestamp
}

/// Kind of mutation carried by a [`SyncUpdate`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncOperation {
    /// Atom created
    Add,
    /// Atom fully replaced
    Update,
    /// Atom deleted
    Remove,
}

impl std::fmt::Display for SyncOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncOperation::Add => write!(f, "ADD"),
            SyncOperation::Update => write!(f, "UPDATE"),
            SyncOperation::Remove => write!(f, "REMOVE"),
        }
    }
}

/// One mutation record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncUpdate {
    /// Mutated atom
    pub atom_id: AtomId,
    /// Origin-assigned timestamp
    pub timestamp: Timestamp,
    /// Mutation kind
    pub operation: SyncOperation,
    /// Full atom for add/update, absent for remove
    pub payload: Option<Atom>,
    /// Node that produced the update
    pub origin: NodeId,
}

/// Per-node append-only update log
#[derive(Debug, Default)]
pub struct UpdateLog {
    entries: Vec<SyncUpdate>,
    /// Highest timestamp seen locally or from peers
    high_water: Timestamp,
}

impl UpdateLog {
    /// Create an empty log
    pub fn new() -> Self {
        Self::default()
    }

    /// Note a timestamp observed on a replicated update so that later local
    /// writes are ordered after it
    pub fn observe(&mut self, timestamp: Timestamp) {
        self.high_water = self.high_water.max(timestamp);
    }

    /// Append a local mutation, assigning it the next timestamp
    pub fn append(
        &mut self,
        atom_id: AtomId,
        operation: SyncOperation,
        payload: Option<Atom>,
        origin: NodeId,
    ) -> SyncUpdate {
        let timestamp = now_millis().max(self.high_water + 1);
        self.high_water = timestamp;

        let update = SyncUpdate {
            atom_id,
            timestamp,
            operation,
            payload,
            origin,
        };
        self.entries.push(update.clone());
        update
    }

    /// Entries with a timestamp strictly greater than `since`
    pub fn since(&self, since: Timestamp) -> Vec<SyncUpdate> {
        let start = self.entries.partition_point(|u| u.timestamp <= since);
        self.entries[start..].to_vec()
    }

    /// Timestamp of the newest entry (0 when empty)
    pub fn last_timestamp(&self) -> Timestamp {
        self.entries.last().map(|u| u.timestamp).unwrap_or(0)
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the log is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn append(log: &mut UpdateLog, id: &str, op: SyncOperation) -> SyncUpdate {
        log.append(id.to_string(), op, None, "node-1".to_string())
    }

    #[test]
    fn test_timestamps_strictly_increase() {
        let mut log = UpdateLog::new();
        let a = append(&mut log, "x", SyncOperation::Add);
        let b = append(&mut log, "x", SyncOperation::Update);
        let c = append(&mut log, "x", SyncOperation::Remove);
        assert!(a.timestamp < b.timestamp);
        assert!(b.timestamp < c.timestamp);
        assert_eq!(log.last_timestamp(), c.timestamp);
    }

    #[test]
    fn test_since_is_strict() {
        let mut log = UpdateLog::new();
        let a = append(&mut log, "x", SyncOperation::Add);
        let b = append(&mut log, "y", SyncOperation::Add);

        assert_eq!(log.since(0).len(), 2);
        let after_a = log.since(a.timestamp);
        assert_eq!(after_a, vec![b.clone()]);
        assert!(log.since(b.timestamp).is_empty());
    }

    #[test]
    fn test_observe_orders_later_writes_after_remote() {
        let mut log = UpdateLog::new();
        let far_future = now_millis() + 60_000;
        log.observe(far_future);
        let local = append(&mut log, "x", SyncOperation::Update);
        assert!(local.timestamp > far_future);
    }
}
