use uuid::Uuid;

use crate::error::{BedloopError, Result};
use crate::queue::{EditableQueue, JobSnapshot, Queue, QueueSnapshot, Strategy};
use crate::storage::{FileLocator, Job, JobManifest, JobRank, JobStore, Set};

/// Jobs owned by this printer alone.
///
/// At most one job is marked acquired in the store; a job still marked
/// acquired when the queue is opened is picked up again by [`Queue::acquire`].
pub struct LocalQueue {
    name: String,
    strategy: Strategy,
    profile: String,
    store: JobStore,
    locator: FileLocator,
    job: Option<Uuid>,
    set: Option<Uuid>,
}

impl LocalQueue {
    pub fn new(
        name: impl Into<String>,
        strategy: Strategy,
        profile: impl Into<String>,
        store: JobStore,
        locator: FileLocator,
    ) -> Result<Self> {
        Ok(Self {
            name: name.into(),
            strategy: strategy.supported()?,
            profile: profile.into(),
            store,
            locator,
            job: None,
            set: None,
        })
    }

    pub fn profile(&self) -> &str {
        &self.profile
    }

    pub fn set_profile(&mut self, profile: impl Into<String>) {
        self.profile = profile.into();
    }

    pub fn jobs(&self) -> &[Job] {
        self.store.jobs()
    }

    pub fn add_job(&mut self, name: &str) -> Result<Uuid> {
        let id = self.store.add_job(name)?;
        self.save();
        Ok(id)
    }

    pub fn add_set(&mut self, job_id: Uuid, set: Set) -> Result<Uuid> {
        let job = self
            .store
            .job_mut(job_id)
            .ok_or(BedloopError::JobNotFound(job_id))?;
        let id = job.push_set(set);
        self.save();
        Ok(id)
    }

    pub fn mv_set(&mut self, set_id: Uuid, after_set: Option<Uuid>, dest_job: Uuid) -> Result<()> {
        self.store.mv_set(set_id, after_set, dest_job)?;
        self.save();
        Ok(())
    }

    fn save(&self) {
        if let Err(e) = self.store.save() {
            tracing::error!(queue = %self.name, error = %e, "Failed to persist queue");
        }
    }

    fn printable(&self) -> impl Fn(&Set) -> bool + '_ {
        move |s: &Set| self.locator.is_printable(&s.path, s.sd)
    }

    fn hold(&mut self, job_id: Uuid, set_id: Uuid) {
        if let Err(e) = self.store.set_acquired(job_id, true) {
            tracing::warn!(queue = %self.name, error = %e, "Failed to mark job acquired");
        }
        self.job = Some(job_id);
        self.set = Some(set_id);
        self.save();
    }
}

impl Queue for LocalQueue {
    fn name(&self) -> &str {
        &self.name
    }

    fn get_job(&self) -> Option<&Job> {
        self.store.job(self.job?)
    }

    fn get_set(&self) -> Option<&Set> {
        self.get_job()?.set(self.set?)
    }

    fn acquire(&mut self) -> bool {
        if self.job.is_some() {
            return true;
        }

        // Job left acquired by a previous process
        if let Some(job) = self.store.acquired() {
            let job_id = job.id;
            match job.next_set(&self.profile, self.printable()).map(|s| s.id) {
                Some(set_id) => {
                    tracing::info!(queue = %self.name, job = %job.name, "Recovered acquired job");
                    self.hold(job_id, set_id);
                    return true;
                }
                None => {
                    match self.store.set_acquired(job_id, false) {
                        Ok(()) => self.save(),
                        Err(e) => {
                            tracing::warn!(queue = %self.name, error = %e, "Failed to clear stale acquisition")
                        }
                    }
                }
            }
        }

        let found = self.store.jobs().iter().find_map(|job| {
            job.next_set(&self.profile, self.printable())
                .map(|set| (job.id, set.id))
        });
        match found {
            Some((job_id, set_id)) => {
                self.hold(job_id, set_id);
                tracing::debug!(queue = %self.name, job = %job_id, set = %set_id, "Acquired");
                true
            }
            None => false,
        }
    }

    fn release(&mut self) {
        if let Some(job_id) = self.job.take() {
            if let Err(e) = self.store.set_acquired(job_id, false) {
                tracing::debug!(queue = %self.name, error = %e, "Released job no longer exists");
            }
            self.save();
        }
        self.set = None;
    }

    fn decrement(&mut self) -> bool {
        let (Some(job_id), Some(set_id)) = (self.job, self.set) else {
            return false;
        };
        let locator = &self.locator;
        let next = match self.store.job_mut(job_id) {
            Some(job) => job.decrement_set(set_id, &self.profile, |s| {
                locator.is_printable(&s.path, s.sd)
            }),
            None => Err(BedloopError::JobNotFound(job_id)),
        };

        match next {
            Ok(Some(next)) => {
                self.set = Some(next);
                self.save();
                true
            }
            Ok(None) => {
                self.release();
                false
            }
            Err(e) => {
                tracing::warn!(queue = %self.name, error = %e, "Decrement of missing job");
                self.release();
                false
            }
        }
    }

    fn reset_jobs(&mut self, ids: &[Uuid]) -> Result<usize> {
        let n = self.store.reset_jobs(ids);
        self.store.save()?;
        Ok(n)
    }

    fn remove_jobs(&mut self, ids: &[Uuid]) -> Result<usize> {
        if self.job.is_some_and(|id| ids.contains(&id)) {
            self.job = None;
            self.set = None;
        }
        let n = self.store.remove_jobs(ids);
        self.store.save()?;
        Ok(n)
    }

    fn as_dict(&self) -> QueueSnapshot {
        QueueSnapshot {
            name: self.name.clone(),
            strategy: self.strategy,
            jobs: self.store.jobs().iter().map(JobSnapshot::from).collect(),
            active_set: self.set,
            addr: None,
            peers: None,
        }
    }
}

impl EditableQueue for LocalQueue {
    fn import_job(&mut self, manifest: &JobManifest) -> Result<Uuid> {
        manifest.check_counts()?;
        let id = self
            .store
            .insert_job(manifest.to_job(JobRank::Lex(String::new())))?;
        self.store.save()?;
        tracing::info!(queue = %self.name, job = %manifest.name, "Imported job");
        Ok(id)
    }

    fn export_job(&self, id: Uuid) -> Result<JobManifest> {
        self.store
            .job(id)
            .map(JobManifest::from_job)
            .ok_or(BedloopError::JobNotFound(id))
    }

    fn edit_job(&mut self, id: Uuid, manifest: &JobManifest) -> Result<()> {
        manifest.check_counts()?;
        let job = self.store.job_mut(id).ok_or(BedloopError::JobNotFound(id))?;
        let mut edited = manifest.to_job(job.rank.clone());
        edited.id = id;
        edited.acquired = job.acquired;
        edited.created = job.created;
        edited.renumber_sets();
        *job = edited;

        if self.job == Some(id) && self.get_set().is_none() {
            self.release();
        }
        self.store.save()
    }

    fn mv_job(&mut self, id: Uuid, after: Option<Uuid>) -> Result<()> {
        self.store.mv_job(id, after)?;
        self.store.save()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    struct Fixture {
        dir: TempDir,
        queue: LocalQueue,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let store = JobStore::open(dir.path().join("local.json")).unwrap();
        let queue = LocalQueue::new(
            "local",
            Strategy::InOrder,
            "MK3S",
            store,
            FileLocator::new(dir.path()),
        )
        .unwrap();
        Fixture { dir, queue }
    }

    impl Fixture {
        fn job(&mut self, name: &str, count: u32, files: &[(&str, u32)]) -> Uuid {
            let id = self.queue.add_job(name).unwrap();
            self.queue.store.job_mut(id).unwrap().count = count;
            self.queue.store.job_mut(id).unwrap().remaining = count;
            for (path, n) in files {
                std::fs::write(self.dir.path().join(path), "G28\n").unwrap();
                self.queue.add_set(id, Set::new(id, *path, *n)).unwrap();
            }
            id
        }
    }

    #[test]
    fn test_least_manual_rejected() {
        let result = LocalQueue::new(
            "local",
            Strategy::LeastManual,
            "",
            JobStore::in_memory(),
            FileLocator::new("/tmp"),
        );
        assert!(matches!(result, Err(BedloopError::NotImplemented(_))));
    }

    #[test]
    fn test_acquire_in_order() {
        let mut f = fixture();
        let a = f.job("a", 1, &[("a.gcode", 1)]);
        f.job("b", 1, &[("b.gcode", 1)]);

        assert!(f.queue.acquire());
        assert_eq!(f.queue.get_job().unwrap().id, a);
        assert_eq!(f.queue.get_set().unwrap().path, "a.gcode");
        assert!(f.queue.store.job(a).unwrap().acquired);

        // Acquiring again keeps the held pair
        assert!(f.queue.acquire());
        assert_eq!(f.queue.get_job().unwrap().id, a);
    }

    #[test]
    fn test_acquire_skips_missing_files_and_drafts() {
        let mut f = fixture();
        let missing = f.queue.add_job("missing").unwrap();
        f.queue
            .add_set(missing, Set::new(missing, "gone.gcode", 1))
            .unwrap();
        let draft = f.job("draft", 1, &[("d.gcode", 1)]);
        f.queue.store.job_mut(draft).unwrap().draft = true;
        let ok = f.job("ok", 1, &[("ok.gcode", 1)]);

        assert!(f.queue.acquire());
        assert_eq!(f.queue.get_job().unwrap().id, ok);
    }

    #[test]
    fn test_acquire_empty_queue() {
        let mut f = fixture();
        assert!(!f.queue.acquire());
        assert!(f.queue.get_set_or_acquire().is_none());
    }

    #[test]
    fn test_decrement_walks_job() {
        let mut f = fixture();
        let a = f.job("a", 2, &[("a.gcode", 1), ("b.gcode", 1)]);

        assert!(f.queue.acquire());
        let mut printed = vec![f.queue.get_set().unwrap().path.clone()];
        while f.queue.decrement() {
            printed.push(f.queue.get_set().unwrap().path.clone());
        }
        assert_eq!(printed, vec!["a.gcode", "b.gcode", "a.gcode", "b.gcode"]);
        assert!(f.queue.get_job().is_none());

        let job = f.queue.store.job(a).unwrap();
        assert_eq!(job.remaining, 0);
        assert!(!job.acquired);
        assert!(!f.queue.acquire());
    }

    #[test]
    fn test_decrement_without_acquire_is_noop() {
        let mut f = fixture();
        f.job("a", 1, &[("a.gcode", 1)]);
        assert!(!f.queue.decrement());
        assert_eq!(f.queue.jobs()[0].sets[0].remaining, 1);
    }

    #[test]
    fn test_release_keeps_counts() {
        let mut f = fixture();
        let a = f.job("a", 1, &[("a.gcode", 2)]);
        f.queue.acquire();
        f.queue.release();
        assert!(f.queue.get_set().is_none());
        let job = f.queue.store.job(a).unwrap();
        assert!(!job.acquired);
        assert_eq!(job.sets[0].remaining, 2);
    }

    #[test]
    fn test_recovers_acquired_job_after_restart() {
        let mut f = fixture();
        f.job("a", 1, &[("a.gcode", 1)]);
        let b = f.job("b", 1, &[("b.gcode", 1)]);
        f.queue.store.set_acquired(b, true).unwrap();
        f.queue.store.save().unwrap();

        let store = JobStore::open(f.dir.path().join("local.json")).unwrap();
        let mut reopened = LocalQueue::new(
            "local",
            Strategy::InOrder,
            "MK3S",
            store,
            FileLocator::new(f.dir.path()),
        )
        .unwrap();
        assert!(reopened.acquire());
        assert_eq!(reopened.get_job().unwrap().id, b);
    }

    #[test]
    fn test_stale_acquisition_cleared_on_disk() {
        let mut f = fixture();
        let a = f.job("a", 1, &[("a.gcode", 1)]);
        f.queue.store.set_acquired(a, true).unwrap();
        f.queue.store.save().unwrap();
        std::fs::remove_file(f.dir.path().join("a.gcode")).unwrap();

        let path = f.dir.path().join("local.json");
        let mut reopened = LocalQueue::new(
            "local",
            Strategy::InOrder,
            "MK3S",
            JobStore::open(&path).unwrap(),
            FileLocator::new(f.dir.path()),
        )
        .unwrap();
        assert!(!reopened.acquire());

        let store = JobStore::open(&path).unwrap();
        assert!(store.acquired().is_none());
    }

    #[test]
    fn test_remove_held_job_clears_acquisition() {
        let mut f = fixture();
        let a = f.job("a", 1, &[("a.gcode", 1)]);
        f.queue.acquire();
        assert_eq!(f.queue.remove_jobs(&[a]).unwrap(), 1);
        assert!(f.queue.get_job().is_none());
        assert!(!f.queue.decrement());
    }

    #[test]
    fn test_import_export_round_trip() {
        let mut f = fixture();
        let a = f.job("a", 3, &[("a.gcode", 2)]);
        let manifest = f.queue.export_job(a).unwrap();

        let copy = f.queue.import_job(&manifest).unwrap();
        assert_ne!(copy, a);
        let names: Vec<_> = f.queue.jobs().iter().map(|j| j.name.as_str()).collect();
        assert_eq!(names, vec!["a", "a"]);
        assert_eq!(f.queue.jobs()[1].count, 3);
    }

    #[test]
    fn test_edit_job_keeps_position() {
        let mut f = fixture();
        let a = f.job("a", 1, &[("a.gcode", 1)]);
        f.job("b", 1, &[("b.gcode", 1)]);

        let mut manifest = f.queue.export_job(a).unwrap();
        manifest.name = "renamed".into();
        manifest.count = 4;
        manifest.remaining = 4;
        f.queue.edit_job(a, &manifest).unwrap();

        assert_eq!(f.queue.jobs()[0].name, "renamed");
        assert_eq!(f.queue.jobs()[0].remaining, 4);

        manifest.sets[0].remaining = 7;
        assert!(matches!(
            f.queue.edit_job(a, &manifest),
            Err(BedloopError::Validation(_))
        ));
    }

    #[test]
    fn test_snapshot_lists_jobs() {
        let mut f = fixture();
        f.job("a", 1, &[("a.gcode", 1)]);
        f.queue.acquire();
        let snap = f.queue.as_dict();
        assert_eq!(snap.name, "local");
        assert_eq!(snap.jobs.len(), 1);
        assert!(snap.jobs[0].acquired);
        assert_eq!(snap.active_set, Some(snap.jobs[0].sets[0].id));
    }
}
