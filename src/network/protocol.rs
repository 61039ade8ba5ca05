//! Peer Protocol
//!
//! Defines the envelope exchanged between nodes and the replies to it.
//! This is an internal contract between nodes running the same build, not a
//! compatibility surface.

use serde::{Deserialize, Serialize};

use crate::atom::{Atom, AtomHash, AtomId, NodeId};
use crate::sync::{SyncUpdate, Timestamp};

/// Inbound peer event kinds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PeerEvent {
    // ========== Health ==========
    /// Liveness probe
    Heartbeat,

    // ========== Sync ==========
    /// Push of a single mutation
    AtomUpdate(SyncUpdate),

    /// Pull exchange: the sender's updates plus a request for ours since
    /// `since`. An empty `updates` is a plain pull.
    SyncRequest {
        since: Timestamp,
        updates: Vec<SyncUpdate>,
    },

    /// Point read used by the sync fallback and consistency repair
    AtomRequest { atom_id: AtomId },

    // ========== Consistency ==========
    /// Ask for the receiver's consistency hash of an atom
    ConsistencyCheck { atom_id: AtomId },

    // ========== Replication ==========
    /// Store a replica copy. `version` is the timestamp of the update the
    /// sender's copy came from; the receiver keeps a copy that is newer.
    ReplicaStore { atom: Atom, version: Timestamp },

    /// Drop a replica copy
    ReplicaRemove { atom_id: AtomId },
}

impl PeerEvent {
    /// Get the event type name (for logging)
    pub fn type_name(&self) -> &'static str {
        match self {
            PeerEvent::Heartbeat => "Heartbeat",
            PeerEvent::AtomUpdate(_) => "AtomUpdate",
            PeerEvent::SyncRequest { .. } => "SyncRequest",
            PeerEvent::AtomRequest { .. } => "AtomRequest",
            PeerEvent::ConsistencyCheck { .. } => "ConsistencyCheck",
            PeerEvent::ReplicaStore { .. } => "ReplicaStore",
            PeerEvent::ReplicaRemove { .. } => "ReplicaRemove",
        }
    }
}

/// Event plus routing metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Payload
    pub event: PeerEvent,
    /// Sender wall-clock time in milliseconds
    pub timestamp: Timestamp,
    /// Sending node
    pub sender: NodeId,
}

impl Envelope {
    /// Wrap an event sent by `sender` now
    pub fn new(sender: impl Into<NodeId>, event: PeerEvent) -> Self {
        Self {
            event,
            timestamp: crate::sync::now_millis(),
            sender: sender.into(),
        }
    }
}

/// Reply to an [`Envelope`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Reply {
    /// Heartbeat answer
    Pong,
    /// Command applied
    Ack,
    /// Update log slice
    Updates(Vec<SyncUpdate>),
    /// Consistency hash, `None` if the receiver lacks the atom
    Hash(Option<AtomHash>),
    /// Atom copy, `None` if the receiver lacks it
    Atom(Option<Atom>),
    /// Receiver refused the command
    Rejected(String),
    /// Receiver failed to process the request
    Error { code: ErrorCode, message: String },
}

impl Reply {
    /// Get the reply type name (for logging)
    pub fn type_name(&self) -> &'static str {
        match self {
            Reply::Pong => "Pong",
            Reply::Ack => "Ack",
            Reply::Updates(_) => "Updates",
            Reply::Hash(_) => "Hash",
            Reply::Atom(_) => "Atom",
            Reply::Rejected(_) => "Rejected",
            Reply::Error { .. } => "Error",
        }
    }
}

/// Error codes carried in [`Reply::Error`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    /// Receiver is not running
    ShuttingDown,
    /// Payload failed validation
    Invalid,
    /// Internal error
    Internal,
}

/// Framed wire message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    /// Request from a peer
    Request(Envelope),
    /// Reply to the previous request on the connection
    Response(Reply),
}

impl Message {
    /// Serialize message to bytes
    pub fn serialize(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize message from bytes
    pub fn deserialize(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }

    /// Get the message type name (for logging)
    pub fn type_name(&self) -> &'static str {
        match self {
            Message::Request(envelope) => envelope.event.type_name(),
            Message::Response(reply) => reply.type_name(),
        }
    }
}

/// Frame header for length-prefixed messages
#[derive(Debug, Clone, Copy)]
pub struct FrameHeader {
    /// Message length
    pub length: u32,
    /// Message checksum
    pub checksum: u32,
}

impl FrameHeader {
    /// Header size in bytes
    pub const SIZE: usize = 8;

    /// Largest body accepted from a peer
    pub const MAX_BODY: u32 = 64 * 1024 * 1024;

    /// Create a new frame header
    pub fn new(data: &[u8]) -> Self {
        Self {
            length: data.len() as u32,
            checksum: crc32fast::hash(data),
        }
    }

    /// Serialize header to bytes
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..4].copy_from_slice(&self.length.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.checksum.to_le_bytes());
        bytes
    }

    /// Deserialize header from bytes
    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        Self {
            length: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            checksum: u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
        }
    }
}
