use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{BedloopError, Result};
use crate::queue::rank::lex_between;
use crate::storage::model::{Job, JobRank};

const STORE_VERSION: u32 = 1;

#[derive(Serialize, Deserialize)]
struct StoreFile {
    version: u32,
    jobs: Vec<Job>,
}

/// Owns the jobs of one local queue, ordered by lexicographic rank.
///
/// Mutations stay in memory until [`JobStore::save`] is called.
#[derive(Debug, Default)]
pub struct JobStore {
    path: Option<PathBuf>,
    jobs: Vec<Job>,
}

impl JobStore {
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Loads the store at `path`, starting empty if the file doesn't exist yet.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let jobs = if path.exists() {
            let data = fs::read_to_string(&path)?;
            let file: StoreFile = serde_json::from_str(&data)?;
            if file.version != STORE_VERSION {
                tracing::warn!(
                    path = %path.display(),
                    version = file.version,
                    "Unexpected store version, loading anyway"
                );
            }
            file.jobs
        } else {
            Vec::new()
        };
        let mut store = Self {
            path: Some(path),
            jobs,
        };
        store.sort();
        Ok(store)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Writes the store to disk via a temporary file and rename.
    pub fn save(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = StoreFile {
            version: STORE_VERSION,
            jobs: self.jobs.clone(),
        };
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(&file)?)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }

    /// All jobs in queue order.
    pub fn jobs(&self) -> &[Job] {
        &self.jobs
    }

    pub fn job(&self, id: Uuid) -> Option<&Job> {
        self.jobs.iter().find(|j| j.id == id)
    }

    pub fn job_mut(&mut self, id: Uuid) -> Option<&mut Job> {
        self.jobs.iter_mut().find(|j| j.id == id)
    }

    /// The job left acquired by a previous process, if any.
    pub fn acquired(&self) -> Option<&Job> {
        self.jobs.iter().find(|j| j.acquired)
    }

    pub fn set_acquired(&mut self, id: Uuid, acquired: bool) -> Result<()> {
        let job = self.job_mut(id).ok_or(BedloopError::JobNotFound(id))?;
        job.acquired = acquired;
        Ok(())
    }

    /// Creates an empty job at the end of the queue.
    pub fn add_job(&mut self, name: &str) -> Result<Uuid> {
        let job = Job::new(name, JobRank::Lex(String::new()));
        self.insert_job(job)
    }

    /// Appends `job` at the end of the queue, re-ranking it. A job whose id
    /// is already present gets a fresh id.
    pub fn insert_job(&mut self, mut job: Job) -> Result<Uuid> {
        if self.job(job.id).is_some() {
            job.id = Uuid::new_v4();
            for set in &mut job.sets {
                set.id = Uuid::new_v4();
            }
        }
        let last = self.jobs.last().and_then(|j| j.rank.as_lex());
        job.rank = JobRank::Lex(lex_between(last, None)?);
        job.acquired = false;
        job.renumber_sets();
        let id = job.id;
        self.jobs.push(job);
        Ok(id)
    }

    /// Moves a job to directly after `after`, or to the head if `None`.
    pub fn mv_job(&mut self, id: Uuid, after: Option<Uuid>) -> Result<()> {
        let idx = self
            .jobs
            .iter()
            .position(|j| j.id == id)
            .ok_or(BedloopError::JobNotFound(id))?;
        let mut job = self.jobs.remove(idx);

        let insert_at = match after {
            None => 0,
            Some(after_id) => match self.jobs.iter().position(|j| j.id == after_id) {
                Some(pos) => pos + 1,
                None => {
                    self.jobs.insert(idx, job);
                    return Err(BedloopError::JobNotFound(after_id));
                }
            },
        };
        let prev = insert_at
            .checked_sub(1)
            .and_then(|i| self.jobs.get(i))
            .and_then(|j| j.rank.as_lex());
        let next = self.jobs.get(insert_at).and_then(|j| j.rank.as_lex());
        match lex_between(prev, next) {
            Ok(rank) => {
                job.rank = JobRank::Lex(rank);
                self.jobs.insert(insert_at, job);
                Ok(())
            }
            Err(e) => {
                self.jobs.insert(idx, job);
                Err(e)
            }
        }
    }

    /// Moves a set into `dest_job`, after `after_set` or at the front.
    pub fn mv_set(&mut self, set_id: Uuid, after_set: Option<Uuid>, dest_job: Uuid) -> Result<()> {
        if self.job(dest_job).is_none() {
            return Err(BedloopError::JobNotFound(dest_job));
        }
        let src = self
            .jobs
            .iter_mut()
            .find(|j| j.set(set_id).is_some())
            .ok_or(BedloopError::SetNotFound(set_id))?;
        let pos = src
            .sets
            .iter()
            .position(|s| s.id == set_id)
            .ok_or(BedloopError::SetNotFound(set_id))?;
        let set = src.sets.remove(pos);
        src.renumber_sets();

        let dest = self
            .job_mut(dest_job)
            .ok_or(BedloopError::JobNotFound(dest_job))?;
        let insert_at = match after_set {
            None => 0,
            Some(after) => dest
                .sets
                .iter()
                .position(|s| s.id == after)
                .map(|p| p + 1)
                .unwrap_or(dest.sets.len()),
        };
        dest.sets.insert(insert_at, set);
        dest.renumber_sets();
        Ok(())
    }

    pub fn remove_jobs(&mut self, ids: &[Uuid]) -> usize {
        let before = self.jobs.len();
        self.jobs.retain(|j| !ids.contains(&j.id));
        before - self.jobs.len()
    }

    pub fn reset_jobs(&mut self, ids: &[Uuid]) -> usize {
        let mut n = 0;
        for job in self.jobs.iter_mut().filter(|j| ids.contains(&j.id)) {
            job.reset();
            n += 1;
        }
        n
    }

    fn sort(&mut self) {
        self.jobs.sort_by(|a, b| a.rank.queue_order(&b.rank));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::model::Set;
    use tempfile::TempDir;

    fn names(store: &JobStore) -> Vec<&str> {
        store.jobs().iter().map(|j| j.name.as_str()).collect()
    }

    #[test]
    fn test_add_jobs_in_order() {
        let mut store = JobStore::in_memory();
        store.add_job("a").unwrap();
        store.add_job("b").unwrap();
        store.add_job("c").unwrap();
        assert_eq!(names(&store), vec!["a", "b", "c"]);

        let ranks: Vec<_> = store.jobs().iter().map(|j| j.rank.as_lex().unwrap()).collect();
        assert!(ranks.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_mv_job() {
        let mut store = JobStore::in_memory();
        let a = store.add_job("a").unwrap();
        let b = store.add_job("b").unwrap();
        let c = store.add_job("c").unwrap();

        store.mv_job(c, None).unwrap();
        assert_eq!(names(&store), vec!["c", "a", "b"]);

        store.mv_job(c, Some(a)).unwrap();
        assert_eq!(names(&store), vec!["a", "c", "b"]);

        store.mv_job(a, Some(b)).unwrap();
        assert_eq!(names(&store), vec!["c", "b", "a"]);

        let ranks: Vec<_> = store.jobs().iter().map(|j| j.rank.as_lex().unwrap()).collect();
        assert!(ranks.windows(2).all(|w| w[0] < w[1]), "{ranks:?}");
    }

    #[test]
    fn test_mv_job_unknown_after_keeps_job() {
        let mut store = JobStore::in_memory();
        let a = store.add_job("a").unwrap();
        assert!(store.mv_job(a, Some(Uuid::new_v4())).is_err());
        assert_eq!(names(&store), vec!["a"]);
    }

    #[test]
    fn test_mv_set_between_jobs() {
        let mut store = JobStore::in_memory();
        let a = store.add_job("a").unwrap();
        let b = store.add_job("b").unwrap();
        let s1 = store.job_mut(a).unwrap().push_set(Set::new(a, "1.gcode", 1));
        let s2 = store.job_mut(a).unwrap().push_set(Set::new(a, "2.gcode", 1));
        let s3 = store.job_mut(b).unwrap().push_set(Set::new(b, "3.gcode", 1));

        store.mv_set(s1, Some(s3), b).unwrap();

        let job_a = store.job(a).unwrap();
        assert_eq!(job_a.sets.len(), 1);
        assert_eq!(job_a.sets[0].id, s2);
        assert_eq!(job_a.sets[0].rank, 0);

        let job_b = store.job(b).unwrap();
        assert_eq!(job_b.sets[1].id, s1);
        assert_eq!(job_b.sets[1].job_id, b);
        assert_eq!(job_b.sets[1].rank, 1);
    }

    #[test]
    fn test_persistence_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("local.json");

        let a;
        {
            let mut store = JobStore::open(&path).unwrap();
            a = store.add_job("a").unwrap();
            store.add_job("b").unwrap();
            store.set_acquired(a, true).unwrap();
            store.save().unwrap();
        }

        let store = JobStore::open(&path).unwrap();
        assert_eq!(names(&store), vec!["a", "b"]);
        assert_eq!(store.acquired().map(|j| j.id), Some(a));
    }

    #[test]
    fn test_remove_and_reset() {
        let mut store = JobStore::in_memory();
        let a = store.add_job("a").unwrap();
        let b = store.add_job("b").unwrap();
        store.job_mut(a).unwrap().remaining = 0;

        assert_eq!(store.reset_jobs(&[a, Uuid::new_v4()]), 1);
        assert_eq!(store.job(a).unwrap().remaining, 1);

        assert_eq!(store.remove_jobs(&[b]), 1);
        assert_eq!(names(&store), vec!["a"]);
    }
}
