//! Print queues.
//!
//! Every queue implements [`Queue`]: hand out one job/set pair at a time,
//! count finished prints down, and render a [`QueueSnapshot`] for the UI.
//!
//! # Components
//!
//! - [`LocalQueue`]: jobs owned by this process, persisted as JSON
//! - [`NetworkQueue`]: jobs shared with other printers through a
//!   [`ReplicatedLog`](crate::replication::ReplicatedLog)
//! - [`QueueKind`]: the closed set of queue variants a [`MultiQueue`] holds
//! - [`MultiQueue`]: tries its queues in order and owns the run history
//! - [`rank`]: rank arithmetic for both queue flavours

pub mod local;
pub mod multi;
pub mod network;
pub mod rank;

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{BedloopError, Result};
use crate::replication::PeerStatus;
use crate::storage::{Job, JobManifest, JobRank, Set};

pub use local::LocalQueue;
pub use multi::MultiQueue;
pub use network::NetworkQueue;

/// How a queue picks its next job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Strategy {
    /// Jobs and sets in rank order.
    #[default]
    InOrder,
    /// Fewest manual changes (e.g. material swaps) first. Not implemented.
    LeastManual,
}

impl Strategy {
    /// Returns the strategy if this build can schedule with it.
    pub fn supported(self) -> Result<Self> {
        match self {
            Strategy::InOrder => Ok(self),
            Strategy::LeastManual => Err(BedloopError::NotImplemented(
                "LEAST_MANUAL scheduling strategy".to_string(),
            )),
        }
    }
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Strategy::InOrder => write!(f, "IN_ORDER"),
            Strategy::LeastManual => write!(f, "LEAST_MANUAL"),
        }
    }
}

impl FromStr for Strategy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_uppercase().replace('-', "_").as_str() {
            "IN_ORDER" => Ok(Strategy::InOrder),
            "LEAST_MANUAL" => Ok(Strategy::LeastManual),
            other => Err(format!("unknown strategy {other}")),
        }
    }
}

/// Rank as shown to the UI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RankValue {
    Lex(String),
    Number(f64),
}

impl From<&JobRank> for RankValue {
    fn from(rank: &JobRank) -> Self {
        match rank {
            JobRank::Lex(s) => RankValue::Lex(s.clone()),
            JobRank::Fraction(f) => RankValue::Number(f.approx()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetSnapshot {
    pub id: Uuid,
    pub path: String,
    pub sd: bool,
    pub count: u32,
    pub remaining: u32,
    pub completed: u32,
    pub material_keys: Vec<Option<String>>,
    pub profile_keys: Vec<String>,
    pub rank: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub id: Uuid,
    pub name: String,
    pub count: u32,
    pub remaining: u32,
    pub draft: bool,
    pub rank: RankValue,
    pub acquired: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acquired_by: Option<String>,
    pub sets: Vec<SetSnapshot>,
}

impl From<&Job> for JobSnapshot {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id,
            name: job.name.clone(),
            count: job.count,
            remaining: job.remaining,
            draft: job.draft,
            rank: RankValue::from(&job.rank),
            acquired: job.acquired,
            acquired_by: job.acquired_by.clone(),
            sets: job
                .sets
                .iter()
                .map(|s| SetSnapshot {
                    id: s.id,
                    path: s.path.clone(),
                    sd: s.sd,
                    count: s.count,
                    remaining: s.remaining,
                    completed: s.completed,
                    material_keys: s.material_keys.clone(),
                    profile_keys: s.profile_keys.clone(),
                    rank: s.rank,
                })
                .collect(),
        }
    }
}

/// Presentation snapshot of one queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueSnapshot {
    pub name: String,
    pub strategy: Strategy,
    pub jobs: Vec<JobSnapshot>,
    pub active_set: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub addr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peers: Option<Vec<PeerStatus>>,
}

/// The scheduling contract shared by every queue.
pub trait Queue {
    fn name(&self) -> &str;

    /// Currently acquired job.
    fn get_job(&self) -> Option<&Job>;

    /// Currently acquired set.
    fn get_set(&self) -> Option<&Set>;

    /// Claims the best available job/set pair. Returns true without
    /// re-selecting if a pair is already held.
    fn acquire(&mut self) -> bool;

    /// Gives up the held pair without touching counts.
    fn release(&mut self);

    /// Records one finished print of the held set. Returns true if the held
    /// job has more work for this printer, false if the queue released it.
    /// A no-op returning false when nothing is held.
    fn decrement(&mut self) -> bool;

    fn reset_jobs(&mut self, ids: &[Uuid]) -> Result<usize>;

    fn remove_jobs(&mut self, ids: &[Uuid]) -> Result<usize>;

    fn as_dict(&self) -> QueueSnapshot;

    fn get_set_or_acquire(&mut self) -> Option<&Set> {
        if self.get_set().is_none() && !self.acquire() {
            return None;
        }
        self.get_set()
    }
}

/// Job editing shared by local and networked queues.
pub trait EditableQueue: Queue {
    /// Adds a job built from `manifest` at the end of the queue.
    fn import_job(&mut self, manifest: &JobManifest) -> Result<Uuid>;

    fn export_job(&self, id: Uuid) -> Result<JobManifest>;

    /// Replaces a job's content, keeping its position.
    fn edit_job(&mut self, id: Uuid, manifest: &JobManifest) -> Result<()>;

    /// Moves a job directly after `after`, or to the head if `None`.
    fn mv_job(&mut self, id: Uuid, after: Option<Uuid>) -> Result<()>;
}

/// A queue that a [`MultiQueue`] can hold.
pub enum QueueKind {
    Local(LocalQueue),
    Networked(NetworkQueue),
}

impl QueueKind {
    pub fn is_networked(&self) -> bool {
        matches!(self, QueueKind::Networked(_))
    }
}

impl Queue for QueueKind {
    fn name(&self) -> &str {
        match self {
            QueueKind::Local(q) => q.name(),
            QueueKind::Networked(q) => q.name(),
        }
    }

    fn get_job(&self) -> Option<&Job> {
        match self {
            QueueKind::Local(q) => q.get_job(),
            QueueKind::Networked(q) => q.get_job(),
        }
    }

    fn get_set(&self) -> Option<&Set> {
        match self {
            QueueKind::Local(q) => q.get_set(),
            QueueKind::Networked(q) => q.get_set(),
        }
    }

    fn acquire(&mut self) -> bool {
        match self {
            QueueKind::Local(q) => q.acquire(),
            QueueKind::Networked(q) => q.acquire(),
        }
    }

    fn release(&mut self) {
        match self {
            QueueKind::Local(q) => q.release(),
            QueueKind::Networked(q) => q.release(),
        }
    }

    fn decrement(&mut self) -> bool {
        match self {
            QueueKind::Local(q) => q.decrement(),
            QueueKind::Networked(q) => q.decrement(),
        }
    }

    fn reset_jobs(&mut self, ids: &[Uuid]) -> Result<usize> {
        match self {
            QueueKind::Local(q) => q.reset_jobs(ids),
            QueueKind::Networked(q) => q.reset_jobs(ids),
        }
    }

    fn remove_jobs(&mut self, ids: &[Uuid]) -> Result<usize> {
        match self {
            QueueKind::Local(q) => q.remove_jobs(ids),
            QueueKind::Networked(q) => q.remove_jobs(ids),
        }
    }

    fn as_dict(&self) -> QueueSnapshot {
        match self {
            QueueKind::Local(q) => q.as_dict(),
            QueueKind::Networked(q) => q.as_dict(),
        }
    }
}

impl EditableQueue for QueueKind {
    fn import_job(&mut self, manifest: &JobManifest) -> Result<Uuid> {
        match self {
            QueueKind::Local(q) => q.import_job(manifest),
            QueueKind::Networked(q) => q.import_job(manifest),
        }
    }

    fn export_job(&self, id: Uuid) -> Result<JobManifest> {
        match self {
            QueueKind::Local(q) => q.export_job(id),
            QueueKind::Networked(q) => q.export_job(id),
        }
    }

    fn edit_job(&mut self, id: Uuid, manifest: &JobManifest) -> Result<()> {
        match self {
            QueueKind::Local(q) => q.edit_job(id, manifest),
            QueueKind::Networked(q) => q.edit_job(id, manifest),
        }
    }

    fn mv_job(&mut self, id: Uuid, after: Option<Uuid>) -> Result<()> {
        match self {
            QueueKind::Local(q) => q.mv_job(id, after),
            QueueKind::Networked(q) => q.mv_job(id, after),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_least_manual_is_not_implemented() {
        assert!(Strategy::InOrder.supported().is_ok());
        assert!(matches!(
            Strategy::LeastManual.supported(),
            Err(BedloopError::NotImplemented(_))
        ));
    }

    #[test]
    fn test_strategy_wire_names() {
        assert_eq!(serde_json::to_string(&Strategy::InOrder).unwrap(), "\"IN_ORDER\"");
        assert_eq!("least-manual".parse::<Strategy>().unwrap(), Strategy::LeastManual);
        assert!("random".parse::<Strategy>().is_err());
    }
}
