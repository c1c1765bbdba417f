use std::fs;
use std::path::PathBuf;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::storage::model::{Job, Run, RunResult, Set};

#[derive(Serialize, Deserialize, Default)]
struct RunFile {
    next_id: u64,
    runs: Vec<Run>,
}

/// Finished runs kept unless configured otherwise.
pub const DEFAULT_HISTORY: usize = 500;

/// Print history. At most one run is open at a time; the oldest finished
/// runs are dropped once more than `limit` are kept.
#[derive(Debug)]
pub struct RunLog {
    path: Option<PathBuf>,
    runs: Vec<Run>,
    next_id: u64,
    limit: usize,
}

impl Default for RunLog {
    fn default() -> Self {
        Self {
            path: None,
            runs: Vec::new(),
            next_id: 0,
            limit: DEFAULT_HISTORY,
        }
    }
}

impl RunLog {
    pub fn in_memory() -> Self {
        Self::default()
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit.max(1);
        self.trim();
        self
    }

    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let file = if path.exists() {
            serde_json::from_str(&fs::read_to_string(&path)?)?
        } else {
            RunFile::default()
        };
        Ok(Self {
            path: Some(path),
            runs: file.runs,
            next_id: file.next_id,
            ..Self::default()
        })
    }

    pub fn save(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = RunFile {
            next_id: self.next_id,
            runs: self.runs.clone(),
        };
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(&file)?)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }

    pub fn open_run(&self) -> Option<&Run> {
        self.runs.iter().rev().find(|r| r.is_open())
    }

    /// Opens a run, closing any stale open run first.
    pub fn begin(&mut self, queue: &str, job: &Job, set: &Set) -> &Run {
        if self.open_run().is_some() {
            self.end(RunResult::Failure);
        }
        self.next_id += 1;
        self.runs.push(Run {
            id: self.next_id,
            queue: queue.to_string(),
            job_id: job.id,
            job_name: job.name.clone(),
            set_id: set.id,
            set_path: set.path.clone(),
            start: Utc::now(),
            end: None,
            result: None,
        });
        self.trim();
        &self.runs[self.runs.len() - 1]
    }

    fn trim(&mut self) {
        let excess = self.runs.len().saturating_sub(self.limit);
        if excess == 0 {
            return;
        }
        let mut dropped = 0;
        self.runs.retain(|r| {
            if dropped < excess && !r.is_open() {
                dropped += 1;
                false
            } else {
                true
            }
        });
    }

    /// Closes the open run, if there is one.
    pub fn end(&mut self, result: RunResult) -> Option<Run> {
        let run = self.runs.iter_mut().rev().find(|r| r.is_open())?;
        run.end = Some(Utc::now());
        run.result = Some(result);
        Some(run.clone())
    }

    /// Most recent runs first.
    pub fn history(&self, limit: usize) -> Vec<&Run> {
        self.runs.iter().rev().take(limit).collect()
    }
}
