//! Contract of the peer-replicated record store behind networked queues.
//!
//! The transport itself is a collaborator: anything that can offer an
//! append-only record log, a completion log and a peer directory per
//! namespace, with eventual delivery to every peer, can back a
//! [`NetworkQueue`](crate::queue::NetworkQueue). [`MemoryLog`] provides the
//! same semantics inside one process.

pub mod memory;

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;
use crate::queue::rank::Fraction;

pub use memory::{MemoryLog, MemoryPeer};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CompletionKind {
    Acquire,
    Release,
    Tombstone,
}

impl std::fmt::Display for CompletionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CompletionKind::Acquire => write!(f, "ACQUIRE"),
            CompletionKind::Release => write!(f, "RELEASE"),
            CompletionKind::Tombstone => write!(f, "TOMBSTONE"),
        }
    }
}

/// One version of a job, as published by some peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Record {
    pub uuid: Uuid,
    /// Serialized [`JobManifest`](crate::storage::JobManifest).
    pub manifest: String,
    pub rank: Fraction,
    /// Position in the replicated log; later entries are newer.
    pub index: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Completion {
    pub uuid: Uuid,
    pub kind: CompletionKind,
    pub completer: String,
    /// Unix seconds; zero marks an open acquisition.
    pub timestamp: i64,
    pub index: u64,
}

/// What a peer advertises about itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerStatus {
    pub name: String,
    pub profile: String,
    pub status: String,
    pub addr: Option<String>,
    pub updated: DateTime<Utc>,
}

pub trait ReplicatedLog: Send + Sync {
    /// Whether the log can currently be read and written.
    fn is_ready(&self) -> bool;

    /// Address assigned to this peer by the replication service.
    fn addr(&self) -> Option<String>;

    fn put_record(&self, ns: &str, uuid: Uuid, manifest: String, rank: Fraction) -> Result<u64>;

    fn complete(
        &self,
        ns: &str,
        uuid: Uuid,
        kind: CompletionKind,
        completer: &str,
        timestamp: i64,
    ) -> Result<u64>;

    fn records(&self, ns: &str) -> Result<Vec<Record>>;

    fn completions(&self, ns: &str) -> Result<Vec<Completion>>;

    fn set_peer_status(&self, ns: &str, status: PeerStatus) -> Result<()>;

    /// Peer statuses keyed by peer address.
    fn peers(&self, ns: &str) -> Result<HashMap<String, PeerStatus>>;
}
