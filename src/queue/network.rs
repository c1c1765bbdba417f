use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use crate::error::{BedloopError, Result, ValidationError};
use crate::queue::rank::{rational_intermediate, Fraction};
use crate::queue::{EditableQueue, JobSnapshot, Queue, QueueSnapshot, Strategy};
use crate::replication::{Completion, CompletionKind, PeerStatus, Record, ReplicatedLog};
use crate::storage::{FileLocator, Job, JobManifest, JobRank, Set};

/// Replicated state of one job uuid.
struct Entry {
    record: Record,
    holder: Option<String>,
    removed: bool,
}

struct Held {
    job: Job,
    set_id: Uuid,
}

/// A queue shared with other printers through a [`ReplicatedLog`].
///
/// Jobs are ordered by rational rank, highest first. A job is held by the
/// first peer whose ACQUIRE lands after the job's last RELEASE; everyone
/// else skips it until it is released.
pub struct NetworkQueue {
    name: String,
    strategy: Strategy,
    profile: String,
    peer_name: String,
    log: Arc<dyn ReplicatedLog>,
    locator: FileLocator,
    held: Option<Held>,
}

impl NetworkQueue {
    pub fn new(
        name: impl Into<String>,
        strategy: Strategy,
        profile: impl Into<String>,
        peer_name: impl Into<String>,
        log: Arc<dyn ReplicatedLog>,
        locator: FileLocator,
    ) -> Result<Self> {
        Ok(Self {
            name: name.into(),
            strategy: strategy.supported()?,
            profile: profile.into(),
            peer_name: peer_name.into(),
            log,
            locator,
            held: None,
        })
    }

    /// Name this peer signs its completions with.
    pub fn identity(&self) -> String {
        self.log.addr().unwrap_or_else(|| self.peer_name.clone())
    }

    pub fn is_ready(&self) -> bool {
        self.log.is_ready()
    }

    /// Visible jobs in queue order. Removed jobs are omitted; jobs held by
    /// a peer carry its identity in `acquired_by`.
    pub fn jobs(&self) -> Result<Vec<Job>> {
        let mut jobs = Vec::new();
        for (uuid, entry) in self.entries()? {
            if entry.removed {
                continue;
            }
            let manifest = match JobManifest::from_json(&entry.record.manifest) {
                Ok(m) => m,
                Err(e) => {
                    tracing::warn!(queue = %self.name, uuid = %uuid, error = %e, "Skipping unreadable record");
                    continue;
                }
            };
            let mut job = manifest.to_job(JobRank::Fraction(entry.record.rank));
            job.id = uuid;
            job.renumber_sets();
            job.acquired = entry.holder.is_some();
            job.acquired_by = entry.holder;
            jobs.push(job);
        }
        jobs.sort_by(|a, b| a.rank.queue_order(&b.rank).then(a.id.cmp(&b.id)));
        Ok(jobs)
    }

    fn entries(&self) -> Result<HashMap<Uuid, Entry>> {
        let mut records = self.log.records(&self.name)?;
        let mut completions = self.log.completions(&self.name)?;
        records.sort_by_key(|r| r.index);
        completions.sort_by_key(|c| c.index);

        let mut entries: HashMap<Uuid, Entry> = HashMap::new();
        for record in records {
            match entries.get_mut(&record.uuid) {
                Some(entry) => entry.record = record,
                None => {
                    entries.insert(
                        record.uuid,
                        Entry {
                            record,
                            holder: None,
                            removed: false,
                        },
                    );
                }
            }
        }
        for c in completions {
            let Some(entry) = entries.get_mut(&c.uuid) else {
                continue;
            };
            apply_completion(entry, &c);
        }
        Ok(entries)
    }

    /// Checks that a job can be shared: counts are consistent and every set
    /// names a profile some printer on the network has, lives off the SD
    /// card and resolves to a local file.
    pub fn validate(&self, manifest: &JobManifest) -> std::result::Result<(), ValidationError> {
        manifest.check_counts()?;

        let mut known = vec![self.profile.clone()];
        match self.log.peers(&self.name) {
            Ok(peers) => known.extend(peers.into_values().map(|p| p.profile)),
            Err(e) => tracing::debug!(queue = %self.name, error = %e, "Peer list unavailable"),
        }

        for set in &manifest.sets {
            if set.profiles.is_empty() {
                return Err(ValidationError::NoProfiles {
                    set_id: set.id,
                    path: set.path.clone(),
                });
            }
            if !set.profiles.iter().any(|p| known.contains(p)) {
                return Err(ValidationError::NoMatchingPrinter {
                    set_id: set.id,
                    path: set.path.clone(),
                    profiles: set.profiles.clone(),
                });
            }
            if set.sd {
                return Err(ValidationError::SdCardFile {
                    set_id: set.id,
                    path: set.path.clone(),
                });
            }
            if self.locator.resolve(&set.path, false).is_none() {
                return Err(ValidationError::MissingFile {
                    set_id: set.id,
                    path: set.path.clone(),
                });
            }
        }
        Ok(())
    }

    /// Advertises this printer's profile and state to the other peers.
    pub fn announce(&self, status: &str) {
        let status = PeerStatus {
            name: self.peer_name.clone(),
            profile: self.profile.clone(),
            status: status.to_string(),
            addr: self.log.addr(),
            updated: Utc::now(),
        };
        if let Err(e) = self.log.set_peer_status(&self.name, status) {
            tracing::debug!(queue = %self.name, error = %e, "Failed to publish peer status");
        }
    }

    fn publish(&self, job: &Job) -> Result<()> {
        let rank = job.rank.as_fraction().ok_or_else(|| {
            BedloopError::InvalidRank(format!("job {} has no rational rank", job.id))
        })?;
        let manifest = JobManifest::from_job(job).to_json()?;
        self.log.put_record(&self.name, job.id, manifest, rank)?;
        Ok(())
    }

    fn complete(&self, uuid: Uuid, kind: CompletionKind, timestamp: i64) -> Result<()> {
        self.log
            .complete(&self.name, uuid, kind, &self.identity(), timestamp)?;
        Ok(())
    }

    fn printable(&self) -> impl Fn(&Set) -> bool + '_ {
        move |s: &Set| self.locator.is_printable(&s.path, s.sd)
    }

    fn latest(&self, id: Uuid) -> Result<Option<Job>> {
        Ok(self.jobs()?.into_iter().find(|j| j.id == id))
    }

    fn holder_of(&self, uuid: Uuid) -> Option<String> {
        self.entries()
            .ok()
            .and_then(|mut e| e.remove(&uuid))
            .and_then(|e| e.holder)
    }

    fn take_job(&mut self, job: &Job) -> bool {
        let Some(set_id) = job.next_set(&self.profile, self.printable()).map(|s| s.id) else {
            return false;
        };
        if let Err(e) = self.complete(job.id, CompletionKind::Acquire, 0) {
            tracing::warn!(queue = %self.name, job = %job.name, error = %e, "Failed to publish acquisition");
            return false;
        }
        let me = self.identity();
        if self.holder_of(job.id).as_deref() != Some(me.as_str()) {
            tracing::debug!(queue = %self.name, job = %job.name, "Lost acquisition to another peer");
            return false;
        }
        self.held = Some(Held {
            job: job.clone(),
            set_id,
        });
        self.announce("printing");
        true
    }
}

/// Overlays one completion. Competing ACQUIREs resolve to the earliest in
/// log order, not the newest, so a holder is never displaced by a peer.
fn apply_completion(entry: &mut Entry, c: &Completion) {
    match c.kind {
        CompletionKind::Acquire => {
            if entry.holder.is_none() {
                entry.holder = Some(c.completer.clone());
            }
        }
        CompletionKind::Release => {
            if entry.holder.as_deref() == Some(c.completer.as_str()) {
                entry.holder = None;
            }
        }
        CompletionKind::Tombstone => {
            entry.removed = true;
            entry.holder = None;
        }
    }
}

impl Queue for NetworkQueue {
    fn name(&self) -> &str {
        &self.name
    }

    fn get_job(&self) -> Option<&Job> {
        self.held.as_ref().map(|h| &h.job)
    }

    fn get_set(&self) -> Option<&Set> {
        let held = self.held.as_ref()?;
        held.job.set(held.set_id)
    }

    fn acquire(&mut self) -> bool {
        if self.held.is_some() {
            return true;
        }
        if !self.log.is_ready() {
            return false;
        }
        let jobs = match self.jobs() {
            Ok(jobs) => jobs,
            Err(e) => {
                tracing::debug!(queue = %self.name, error = %e, "Queue unreadable");
                return false;
            }
        };
        let me = self.identity();

        // A job this peer held before a restart
        for job in jobs.iter().filter(|j| j.acquired_by.as_deref() == Some(me.as_str())) {
            match job.next_set(&self.profile, self.printable()).map(|s| s.id) {
                Some(set_id) => {
                    tracing::info!(queue = %self.name, job = %job.name, "Recovered acquired job");
                    self.held = Some(Held {
                        job: job.clone(),
                        set_id,
                    });
                    return true;
                }
                None => {
                    if let Err(e) = self.complete(job.id, CompletionKind::Release, Utc::now().timestamp()) {
                        tracing::warn!(queue = %self.name, error = %e, "Failed to release stale job");
                    }
                }
            }
        }

        for job in jobs.iter().filter(|j| j.acquired_by.is_none()) {
            if self.take_job(job) {
                tracing::debug!(queue = %self.name, job = %job.name, "Acquired");
                return true;
            }
        }
        false
    }

    fn release(&mut self) {
        let Some(held) = self.held.take() else {
            return;
        };
        if let Err(e) = self.complete(held.job.id, CompletionKind::Release, Utc::now().timestamp()) {
            tracing::warn!(queue = %self.name, job = %held.job.name, error = %e, "Failed to publish release");
        }
        self.announce("idle");
    }

    fn decrement(&mut self) -> bool {
        let Some(mut held) = self.held.take() else {
            return false;
        };
        // Count down the newest record so edits made by peers survive
        match self.latest(held.job.id) {
            Ok(Some(job)) => held.job = job,
            Ok(None) => {
                tracing::info!(queue = %self.name, job = %held.job.name, "Held job was removed by a peer");
                self.announce("idle");
                return false;
            }
            Err(e) => {
                tracing::debug!(queue = %self.name, error = %e, "Queue unreadable, counting down held copy");
            }
        }
        let locator = &self.locator;
        let next = held.job.decrement_set(held.set_id, &self.profile, |s| {
            locator.is_printable(&s.path, s.sd)
        });
        if let Err(e) = self.publish(&held.job) {
            tracing::warn!(queue = %self.name, job = %held.job.name, error = %e, "Failed to publish progress");
        }

        match next {
            Ok(Some(next)) => {
                held.set_id = next;
                self.held = Some(held);
                true
            }
            Ok(None) => {
                self.held = Some(held);
                self.release();
                false
            }
            Err(e) => {
                tracing::warn!(queue = %self.name, error = %e, "Decrement of missing set");
                self.held = Some(held);
                self.release();
                false
            }
        }
    }

    fn reset_jobs(&mut self, ids: &[Uuid]) -> Result<usize> {
        let mut n = 0;
        for mut job in self.jobs()?.into_iter().filter(|j| ids.contains(&j.id)) {
            job.reset();
            self.publish(&job)?;
            if let Some(held) = self.held.as_mut().filter(|h| h.job.id == job.id) {
                held.job = job;
            }
            n += 1;
        }
        Ok(n)
    }

    fn remove_jobs(&mut self, ids: &[Uuid]) -> Result<usize> {
        let now = Utc::now().timestamp().max(1);
        let mut n = 0;
        for job in self.jobs()?.into_iter().filter(|j| ids.contains(&j.id)) {
            self.complete(job.id, CompletionKind::Tombstone, now)?;
            n += 1;
        }
        if self.held.as_ref().is_some_and(|h| ids.contains(&h.job.id)) {
            self.held = None;
            self.announce("idle");
        }
        Ok(n)
    }

    fn as_dict(&self) -> QueueSnapshot {
        let jobs = match self.jobs() {
            Ok(jobs) => jobs.iter().map(JobSnapshot::from).collect(),
            Err(e) => {
                tracing::debug!(queue = %self.name, error = %e, "Queue unreadable");
                Vec::new()
            }
        };
        let peers = self.log.peers(&self.name).ok().map(|peers| {
            let mut peers: Vec<PeerStatus> = peers.into_values().collect();
            peers.sort_by(|a, b| a.name.cmp(&b.name));
            peers
        });
        QueueSnapshot {
            name: self.name.clone(),
            strategy: self.strategy,
            jobs,
            active_set: self.held.as_ref().map(|h| h.set_id),
            addr: self.log.addr(),
            peers,
        }
    }
}

impl EditableQueue for NetworkQueue {
    fn import_job(&mut self, manifest: &JobManifest) -> Result<Uuid> {
        self.validate(manifest)?;
        if !self.log.is_ready() {
            return Err(BedloopError::Replication(format!("{} is offline", self.name)));
        }
        let entries = self.entries()?;
        let jobs = self.jobs()?;
        let lowest = jobs
            .last()
            .and_then(|j| j.rank.as_fraction())
            .unwrap_or(Fraction::INFINITY);
        let rank = rational_intermediate(Fraction::ZERO, lowest)?;

        let mut job = manifest.to_job(JobRank::Fraction(rank));
        if entries.contains_key(&job.id) {
            job.id = Uuid::new_v4();
            for set in &mut job.sets {
                set.id = Uuid::new_v4();
            }
            job.renumber_sets();
        }
        job.peer = Some(self.identity());
        self.publish(&job)?;
        tracing::info!(queue = %self.name, job = %job.name, rank = %rank, "Submitted job");
        Ok(job.id)
    }

    fn export_job(&self, id: Uuid) -> Result<JobManifest> {
        self.jobs()?
            .iter()
            .find(|j| j.id == id)
            .map(JobManifest::from_job)
            .ok_or(BedloopError::JobNotFound(id))
    }

    fn edit_job(&mut self, id: Uuid, manifest: &JobManifest) -> Result<()> {
        self.validate(manifest)?;
        let current = self
            .jobs()?
            .into_iter()
            .find(|j| j.id == id)
            .ok_or(BedloopError::JobNotFound(id))?;
        let mut edited = manifest.to_job(current.rank.clone());
        edited.id = id;
        edited.created = current.created;
        edited.peer = current.peer.clone();
        edited.renumber_sets();
        self.publish(&edited)?;

        if let Some(held) = self.held.as_mut().filter(|h| h.job.id == id) {
            held.job = edited;
            if held.job.set(held.set_id).is_none() {
                self.release();
            }
        }
        Ok(())
    }

    fn mv_job(&mut self, id: Uuid, after: Option<Uuid>) -> Result<()> {
        let jobs = self.jobs()?;
        let mut job = jobs
            .iter()
            .find(|j| j.id == id)
            .cloned()
            .ok_or(BedloopError::JobNotFound(id))?;
        let others: Vec<&Job> = jobs.iter().filter(|j| j.id != id).collect();
        let pos = match after {
            None => 0,
            Some(a) => others
                .iter()
                .position(|j| j.id == a)
                .map(|p| p + 1)
                .ok_or(BedloopError::JobNotFound(a))?,
        };

        // Higher ranks come first
        let rank_at = |i: usize| others.get(i).and_then(|j| j.rank.as_fraction());
        let mut above = pos
            .checked_sub(1)
            .and_then(rank_at)
            .unwrap_or(Fraction::INFINITY);
        let below = rank_at(pos).unwrap_or(Fraction::ZERO);

        if pos > 0 && above <= below {
            // Neighbours share a rank (concurrent imports) and are ordered by
            // uuid. Lift the upper one so there is room in between.
            let mut upper = others[pos - 1].clone();
            let ceiling = (0..pos - 1)
                .rev()
                .filter_map(rank_at)
                .find(|r| *r > below)
                .unwrap_or(Fraction::INFINITY);
            above = rational_intermediate(below, ceiling)?;
            upper.rank = JobRank::Fraction(above);
            self.publish(&upper)?;
        }

        job.rank = JobRank::Fraction(rational_intermediate(below, above)?);
        self.publish(&job)
    }
}
