use uuid::Uuid;

use crate::error::{BedloopError, Result};
use crate::queue::{EditableQueue, Queue, QueueKind, QueueSnapshot, Strategy};
use crate::storage::{Job, JobManifest, Run, RunLog, RunResult, Set};

/// Ordered collection of queues feeding one printer.
///
/// Queues are tried in insertion order until one yields work; that queue
/// stays active until it runs dry or its job is released. Every print the
/// driver starts is recorded as a [`Run`].
pub struct MultiQueue {
    strategy: Strategy,
    queues: Vec<QueueKind>,
    active: Option<String>,
    runs: RunLog,
}

impl MultiQueue {
    pub fn new(strategy: Strategy, runs: RunLog) -> Result<Self> {
        Ok(Self {
            strategy: strategy.supported()?,
            queues: Vec::new(),
            active: None,
            runs,
        })
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    pub fn add_queue(&mut self, queue: QueueKind) -> Result<()> {
        if self.queue(queue.name()).is_some() {
            return Err(BedloopError::Internal(format!(
                "queue {} already exists",
                queue.name()
            )));
        }
        tracing::info!(queue = queue.name(), networked = queue.is_networked(), "Added queue");
        self.queues.push(queue);
        Ok(())
    }

    /// Detaches a queue, releasing its job first if it is active.
    pub fn remove_queue(&mut self, name: &str) -> Result<QueueKind> {
        let idx = self
            .queues
            .iter()
            .position(|q| q.name() == name)
            .ok_or_else(|| BedloopError::QueueNotFound(name.to_string()))?;
        if self.active.as_deref() == Some(name) {
            self.release();
        }
        Ok(self.queues.remove(idx))
    }

    pub fn queue(&self, name: &str) -> Option<&QueueKind> {
        self.queues.iter().find(|q| q.name() == name)
    }

    pub fn queue_mut(&mut self, name: &str) -> Option<&mut QueueKind> {
        self.queues.iter_mut().find(|q| q.name() == name)
    }

    pub fn queues(&self) -> impl Iterator<Item = &QueueKind> {
        self.queues.iter()
    }

    pub fn active_queue(&self) -> Option<&QueueKind> {
        self.queue(self.active.as_deref()?)
    }

    fn active_queue_mut(&mut self) -> Option<&mut QueueKind> {
        let name = self.active.clone()?;
        self.queue_mut(&name)
    }

    pub fn get_job(&self) -> Option<&Job> {
        self.active_queue()?.get_job()
    }

    pub fn get_set(&self) -> Option<&Set> {
        self.active_queue()?.get_set()
    }

    /// The run currently in progress, if any.
    pub fn get_run(&self) -> Option<&Run> {
        self.runs.open_run()
    }

    pub fn history(&self, limit: usize) -> Vec<&Run> {
        self.runs.history(limit)
    }

    /// Acquires from the active queue, or else from the first queue with work.
    pub fn acquire(&mut self) -> bool {
        if let Some(q) = self.active_queue_mut() {
            if q.acquire() {
                return true;
            }
        }
        self.active = None;

        let found = self
            .queues
            .iter_mut()
            .find_map(|q| q.acquire().then(|| q.name().to_string()));
        match found {
            Some(name) => {
                tracing::debug!(queue = %name, "Queue active");
                self.active = Some(name);
                self.reconcile_run();
                true
            }
            None => false,
        }
    }

    pub fn get_set_or_acquire(&mut self) -> Option<&Set> {
        if self.get_set().is_none() && !self.acquire() {
            return None;
        }
        self.get_set()
    }

    /// Closes a run left open by an earlier process if it is not for the
    /// set that was just acquired.
    fn reconcile_run(&mut self) {
        let Some(run) = self.runs.open_run() else {
            return;
        };
        let matches = match (self.active.as_deref(), self.get_job(), self.get_set()) {
            (Some(q), Some(job), Some(set)) => run.matches(q, job, set),
            _ => false,
        };
        if matches {
            tracing::info!(run = run.id, path = %run.set_path, "Resuming open run");
            return;
        }
        tracing::warn!(run = run.id, path = %run.set_path, "Closing stale run as failure");
        self.runs.end(RunResult::Failure);
        self.save_runs();
    }

    pub fn release(&mut self) {
        if let Some(q) = self.active_queue_mut() {
            q.release();
        }
        self.active = None;
    }

    /// Opens a run for the active set. Starting again while a run for the
    /// same set is open reuses it.
    pub fn begin_run(&mut self) -> Result<()> {
        let name = self.active.clone().ok_or(BedloopError::NoActiveQueue)?;
        let q = self.queue(&name).ok_or(BedloopError::NoActiveQueue)?;
        let (job, set) = match (q.get_job(), q.get_set()) {
            (Some(job), Some(set)) => (job, set),
            _ => return Err(BedloopError::NoActiveQueue),
        };
        if self
            .runs
            .open_run()
            .is_some_and(|r| r.matches(&name, job, set))
        {
            return Ok(());
        }
        let (job, set) = (job.clone(), set.clone());
        let run = self.runs.begin(&name, &job, &set);
        tracing::info!(run = run.id, queue = %name, job = %job.name, path = %set.path, "Run started");
        self.runs.save()
    }

    /// Closes the open run and, on completion of either kind, counts the
    /// set down in its queue. No-op if no run is open.
    pub fn end_run(&mut self, result: RunResult) -> Option<Run> {
        let run = self.runs.end(result)?;
        self.save_runs();
        tracing::info!(
            run = run.id,
            path = %run.set_path,
            result = %run.result.unwrap_or(result),
            elapsed_secs = run.elapsed().num_seconds(),
            "Run ended"
        );

        let more = self.active_queue_mut().map(|q| q.decrement()).unwrap_or(false);
        if !more {
            self.active = None;
        }
        Some(run)
    }

    /// Adds a job to the named queue.
    pub fn import_job(&mut self, queue: &str, manifest: &JobManifest) -> Result<Uuid> {
        self.queue_mut(queue)
            .ok_or_else(|| BedloopError::QueueNotFound(queue.to_string()))?
            .import_job(manifest)
    }

    pub fn reset_jobs(&mut self, queue: &str, ids: &[Uuid]) -> Result<usize> {
        self.queue_mut(queue)
            .ok_or_else(|| BedloopError::QueueNotFound(queue.to_string()))?
            .reset_jobs(ids)
    }

    pub fn remove_jobs(&mut self, queue: &str, ids: &[Uuid]) -> Result<usize> {
        let n = self
            .queue_mut(queue)
            .ok_or_else(|| BedloopError::QueueNotFound(queue.to_string()))?
            .remove_jobs(ids)?;
        if self.active.as_deref() == Some(queue) && self.get_job().is_none() {
            self.active = None;
        }
        Ok(n)
    }

    pub fn as_dict(&self) -> Vec<QueueSnapshot> {
        self.queues.iter().map(|q| q.as_dict()).collect()
    }

    fn save_runs(&self) {
        if let Err(e) = self.runs.save() {
            tracing::error!(error = %e, "Failed to persist run history");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::LocalQueue;
    use crate::storage::{FileLocator, JobStore};
    use tempfile::TempDir;

    fn local(dir: &TempDir, name: &str, files: &[&str]) -> QueueKind {
        let mut q = LocalQueue::new(
            name,
            Strategy::InOrder,
            "MK3S",
            JobStore::in_memory(),
            FileLocator::new(dir.path()),
        )
        .unwrap();
        for f in files {
            std::fs::write(dir.path().join(f), "G28\n").unwrap();
            let job = q.add_job(f).unwrap();
            q.add_set(job, Set::new(job, *f, 1)).unwrap();
        }
        QueueKind::Local(q)
    }

    fn multi(dir: &TempDir, queues: Vec<QueueKind>) -> MultiQueue {
        let mut mq = MultiQueue::new(Strategy::InOrder, RunLog::open(dir.path().join("runs.json")).unwrap()).unwrap();
        for q in queues {
            mq.add_queue(q).unwrap();
        }
        mq
    }

    #[test]
    fn test_first_queue_with_work_wins() {
        let dir = TempDir::new().unwrap();
        let mut mq = multi(
            &dir,
            vec![local(&dir, "empty", &[]), local(&dir, "second", &["b.gcode"])],
        );

        assert_eq!(mq.get_set_or_acquire().unwrap().path, "b.gcode");
        assert_eq!(mq.active_queue().unwrap().name(), "second");
    }

    #[test]
    fn test_duplicate_queue_rejected() {
        let dir = TempDir::new().unwrap();
        let mut mq = multi(&dir, vec![local(&dir, "q", &[])]);
        assert!(mq.add_queue(local(&dir, "q", &[])).is_err());
    }

    #[test]
    fn test_run_lifecycle_decrements() {
        let dir = TempDir::new().unwrap();
        let mut mq = multi(&dir, vec![local(&dir, "q", &["a.gcode", "b.gcode"])]);

        assert!(mq.end_run(RunResult::Success).is_none());
        assert!(matches!(mq.begin_run(), Err(BedloopError::NoActiveQueue)));

        assert!(mq.acquire());
        mq.begin_run().unwrap();
        let first = mq.get_run().unwrap().id;
        // Retrying the same set keeps the run
        mq.begin_run().unwrap();
        assert_eq!(mq.get_run().unwrap().id, first);

        let run = mq.end_run(RunResult::Success).unwrap();
        assert_eq!(run.set_path, "a.gcode");
        // Job a.gcode is finished, so the queue let go of it
        assert!(mq.get_set().is_none());

        assert_eq!(mq.get_set_or_acquire().unwrap().path, "b.gcode");
        mq.begin_run().unwrap();
        mq.end_run(RunResult::Failure).unwrap();
        assert!(mq.get_set_or_acquire().is_none());

        let history = mq.history(10);
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].result, Some(RunResult::Failure));
    }

    #[test]
    fn test_stale_run_closed_on_acquire() {
        let dir = TempDir::new().unwrap();
        {
            let mut mq = multi(&dir, vec![local(&dir, "q", &["a.gcode"])]);
            mq.acquire();
            mq.begin_run().unwrap();
        }

        // Same run log, but the queue now hands out a different set
        let mut mq = multi(&dir, vec![local(&dir, "q", &["other.gcode"])]);
        assert!(mq.get_run().is_some());
        assert!(mq.acquire());
        assert!(mq.get_run().is_none());
        assert_eq!(mq.history(1)[0].result, Some(RunResult::Failure));
    }

    #[test]
    fn test_remove_active_queue_releases() {
        let dir = TempDir::new().unwrap();
        let mut mq = multi(&dir, vec![local(&dir, "q", &["a.gcode"])]);
        mq.acquire();
        let removed = mq.remove_queue("q").unwrap();
        assert!(removed.get_set().is_none());
        assert!(mq.active_queue().is_none());
        assert!(matches!(mq.remove_queue("q"), Err(BedloopError::QueueNotFound(_))));
    }

    #[test]
    fn test_remove_active_job_clears_active() {
        let dir = TempDir::new().unwrap();
        let mut mq = multi(&dir, vec![local(&dir, "q", &["a.gcode"])]);
        mq.acquire();
        let id = mq.get_job().unwrap().id;
        assert_eq!(mq.remove_jobs("q", &[id]).unwrap(), 1);
        assert!(mq.active_queue().is_none());
        assert!(mq.remove_jobs("nope", &[id]).is_err());
    }
}
