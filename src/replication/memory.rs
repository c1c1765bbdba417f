use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use uuid::Uuid;

use crate::error::{BedloopError, Result};
use crate::queue::rank::Fraction;
use crate::replication::{Completion, CompletionKind, PeerStatus, Record, ReplicatedLog};

#[derive(Debug, Default)]
struct Namespace {
    records: Vec<Record>,
    completions: Vec<Completion>,
    peers: HashMap<String, PeerStatus>,
}

#[derive(Debug, Default)]
struct LogState {
    last_index: u64,
    namespaces: HashMap<String, Namespace>,
}

impl LogState {
    fn next_index(&mut self) -> u64 {
        self.last_index += 1;
        self.last_index
    }

    fn ns(&mut self, ns: &str) -> &mut Namespace {
        self.namespaces.entry(ns.to_string()).or_default()
    }
}

/// In-process replicated log. Every [`MemoryPeer`] connected to the same
/// `MemoryLog` observes every write immediately.
#[derive(Debug, Clone, Default)]
pub struct MemoryLog {
    state: Arc<Mutex<LogState>>,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// A handle for the peer at `addr`.
    pub fn connect(&self, addr: impl Into<String>) -> MemoryPeer {
        MemoryPeer {
            addr: addr.into(),
            state: self.state.clone(),
            online: Arc::new(AtomicBool::new(true)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MemoryPeer {
    addr: String,
    state: Arc<Mutex<LogState>>,
    online: Arc<AtomicBool>,
}

impl MemoryPeer {
    /// Simulates losing or regaining the connection to the other peers.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    fn lock(&self) -> Result<MutexGuard<'_, LogState>> {
        if !self.is_ready() {
            return Err(BedloopError::Replication(format!("{} is offline", self.addr)));
        }
        self.state
            .lock()
            .map_err(|_| BedloopError::Replication("log state poisoned".to_string()))
    }
}

impl ReplicatedLog for MemoryPeer {
    fn is_ready(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    fn addr(&self) -> Option<String> {
        Some(self.addr.clone())
    }

    fn put_record(&self, ns: &str, uuid: Uuid, manifest: String, rank: Fraction) -> Result<u64> {
        let mut state = self.lock()?;
        let index = state.next_index();
        state.ns(ns).records.push(Record {
            uuid,
            manifest,
            rank,
            index,
        });
        tracing::debug!(ns, uuid = %uuid, index, "Record appended");
        Ok(index)
    }

    fn complete(
        &self,
        ns: &str,
        uuid: Uuid,
        kind: CompletionKind,
        completer: &str,
        timestamp: i64,
    ) -> Result<u64> {
        let mut state = self.lock()?;
        let index = state.next_index();
        state.ns(ns).completions.push(Completion {
            uuid,
            kind,
            completer: completer.to_string(),
            timestamp,
            index,
        });
        tracing::debug!(ns, uuid = %uuid, kind = %kind, completer, index, "Completion appended");
        Ok(index)
    }

    fn records(&self, ns: &str) -> Result<Vec<Record>> {
        Ok(self
            .lock()?
            .namespaces
            .get(ns)
            .map(|n| n.records.clone())
            .unwrap_or_default())
    }

    fn completions(&self, ns: &str) -> Result<Vec<Completion>> {
        Ok(self
            .lock()?
            .namespaces
            .get(ns)
            .map(|n| n.completions.clone())
            .unwrap_or_default())
    }

    fn set_peer_status(&self, ns: &str, status: PeerStatus) -> Result<()> {
        let mut state = self.lock()?;
        state.ns(ns).peers.insert(self.addr.clone(), status);
        Ok(())
    }

    fn peers(&self, ns: &str) -> Result<HashMap<String, PeerStatus>> {
        Ok(self
            .lock()?
            .namespaces
            .get(ns)
            .map(|n| n.peers.clone())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_writes_are_visible_to_all_peers() {
        let log = MemoryLog::new();
        let a = log.connect("a");
        let b = log.connect("b");
        let uuid = Uuid::new_v4();

        let i1 = a.put_record("lan", uuid, "{}".into(), Fraction::new(1, 1)).unwrap();
        let i2 = a
            .complete("lan", uuid, CompletionKind::Acquire, "a", 0)
            .unwrap();
        assert!(i2 > i1);

        assert_eq!(b.records("lan").unwrap().len(), 1);
        let completions = b.completions("lan").unwrap();
        assert_eq!(completions[0].kind, CompletionKind::Acquire);
        assert_eq!(completions[0].completer, "a");
        assert!(b.records("other").unwrap().is_empty());
    }

    #[test]
    fn test_offline_peer_errors() {
        let log = MemoryLog::new();
        let a = log.connect("a");
        a.set_online(false);
        assert!(!a.is_ready());
        assert!(matches!(a.records("lan"), Err(BedloopError::Replication(_))));
        a.set_online(true);
        assert!(a.records("lan").is_ok());
    }

    #[test]
    fn test_peer_status_keyed_by_addr() {
        let log = MemoryLog::new();
        let a = log.connect("a");
        let b = log.connect("b");
        a.set_peer_status(
            "lan",
            PeerStatus {
                name: "printer-a".into(),
                profile: "MK3S".into(),
                status: "idle".into(),
                addr: a.addr(),
                updated: Utc::now(),
            },
        )
        .unwrap();

        let peers = b.peers("lan").unwrap();
        assert_eq!(peers["a"].profile, "MK3S");
    }
}
