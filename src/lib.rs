//! AtomWeave - Peer-Replicated Atom Store
//!
//! An eventually consistent store for a graph of typed atoms, shared by a
//! small cluster of cooperating nodes. Each node keeps a local copy of the
//! atoms it knows about and cooperates with its peers to keep those copies
//! from diverging.
//!
//! # Architecture
//!
//! Every node runs three managers behind a single facade:
//!
//! - **Replication** places each new atom on up to R other nodes and tops
//!   up replica sets when holders become unhealthy.
//! - **Sync** pushes every local mutation to peers immediately and pulls
//!   missed updates on a timer, applying them last-write-wins.
//! - **Consistency** audits that peers hold the same version of each atom
//!   and repairs divergence by plurality vote.
//!
//! The [`DistributedStore`](store::DistributedStore) facade owns startup and
//! shutdown ordering, writes locally before replicating, and dispatches
//! inbound peer events. Nodes talk over a [`Transport`](network::Transport):
//! framed TCP in production, an in-process network in tests.

pub mod arena;
pub mod atom;
pub mod config;
pub mod consistency;
pub mod context;
pub mod error;
pub mod network;
pub mod replication;
pub mod store;
pub mod sync;
pub mod task;

pub use config::AtomWeaveConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::atom::{consistency_hash, Atom, AtomHash, AtomId, NodeId, TruthValue};
    pub use crate::config::AtomWeaveConfig;
    pub use crate::error::{Error, Result};
    pub use crate::network::{MemoryNetwork, TcpTransport, Transport};
    pub use crate::store::local::{AtomStore, MemoryAtomStore};
    pub use crate::store::{DistributedStore, LifecycleState};
    pub use crate::sync::{SyncOperation, SyncUpdate};
}
