use std::cmp::Ordering;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{BedloopError, Result};
use crate::queue::rank::Fraction;
use crate::storage::files::FileLocator;

/// Position of a job within its queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobRank {
    /// Lexicographic rank used by local queues; lower sorts first.
    Lex(String),
    /// Rational rank used by networked queues; higher sorts first.
    Fraction(Fraction),
}

impl JobRank {
    /// Queue order: `Less` means `self` is scheduled before `other`.
    pub fn queue_order(&self, other: &JobRank) -> Ordering {
        match (self, other) {
            (JobRank::Lex(a), JobRank::Lex(b)) => a.cmp(b),
            (JobRank::Fraction(a), JobRank::Fraction(b)) => b.cmp(a),
            (JobRank::Lex(_), JobRank::Fraction(_)) => Ordering::Less,
            (JobRank::Fraction(_), JobRank::Lex(_)) => Ordering::Greater,
        }
    }

    pub fn as_lex(&self) -> Option<&str> {
        match self {
            JobRank::Lex(s) => Some(s),
            JobRank::Fraction(_) => None,
        }
    }

    pub fn as_fraction(&self) -> Option<Fraction> {
        match self {
            JobRank::Fraction(f) => Some(*f),
            JobRank::Lex(_) => None,
        }
    }
}

/// A file to print some number of times as part of a [`Job`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Set {
    pub id: Uuid,
    pub job_id: Uuid,
    pub path: String,
    pub sd: bool,
    pub count: u32,
    pub remaining: u32,
    pub completed: u32,
    /// Required material per tool index; `None` leaves that tool unconstrained.
    pub material_keys: Vec<Option<String>>,
    /// Printer profiles this file was sliced for; empty matches any profile.
    pub profile_keys: Vec<String>,
    pub rank: u32,
    #[serde(skip)]
    resolved: OnceLock<PathBuf>,
}

impl Set {
    pub fn new(job_id: Uuid, path: impl Into<String>, count: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_id,
            path: path.into(),
            sd: false,
            count,
            remaining: count,
            completed: 0,
            material_keys: Vec::new(),
            profile_keys: Vec::new(),
            rank: 0,
            resolved: OnceLock::new(),
        }
    }

    pub fn with_materials(mut self, materials: Vec<Option<String>>) -> Self {
        self.material_keys = materials;
        self
    }

    pub fn with_profiles(mut self, profiles: Vec<String>) -> Self {
        self.profile_keys = profiles;
        self
    }

    pub fn on_sd(mut self, sd: bool) -> Self {
        self.sd = sd;
        self
    }

    pub fn is_compatible(&self, profile: &str) -> bool {
        self.profile_keys.is_empty() || self.profile_keys.iter().any(|p| p == profile)
    }

    /// Record one finished print. Never drops below zero.
    pub fn decrement(&mut self) {
        self.remaining = self.remaining.saturating_sub(1);
        self.completed = self.count.saturating_sub(self.remaining);
    }

    pub fn refresh(&mut self) {
        self.remaining = self.count;
        self.completed = 0;
    }

    /// Resolves the on-disk location once and caches it.
    pub fn resolved_path(&self, locator: &FileLocator) -> Option<&Path> {
        if let Some(p) = self.resolved.get() {
            return Some(p.as_path());
        }
        let path = locator.resolve(&self.path, self.sd)?;
        Some(self.resolved.get_or_init(|| path).as_path())
    }

    /// True if `reported` names this set's file, either as queued or as resolved.
    pub fn matches_path(&self, reported: &str) -> bool {
        if reported == self.path {
            return true;
        }
        let reported = Path::new(reported);
        self.resolved
            .get()
            .map(|p| p.as_path() == reported)
            .unwrap_or(false)
            || reported.ends_with(&self.path)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub name: String,
    pub rank: JobRank,
    pub count: u32,
    pub remaining: u32,
    pub draft: bool,
    pub acquired: bool,
    pub created: DateTime<Utc>,
    pub sets: Vec<Set>,
    #[serde(default)]
    pub peer: Option<String>,
    #[serde(default)]
    pub hash: Option<String>,
    /// Peer currently holding this job (networked views only).
    #[serde(skip)]
    pub acquired_by: Option<String>,
}

impl Job {
    pub fn new(name: impl Into<String>, rank: JobRank) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            rank,
            count: 1,
            remaining: 1,
            draft: false,
            acquired: false,
            created: Utc::now(),
            sets: Vec::new(),
            peer: None,
            hash: None,
            acquired_by: None,
        }
    }

    pub fn with_count(mut self, count: u32) -> Self {
        self.count = count;
        self.remaining = count;
        self
    }

    /// Appends a set, taking ownership of its job link and rank.
    pub fn push_set(&mut self, mut set: Set) -> Uuid {
        set.job_id = self.id;
        set.rank = self.sets.len() as u32;
        let id = set.id;
        self.sets.push(set);
        id
    }

    pub fn set(&self, id: Uuid) -> Option<&Set> {
        self.sets.iter().find(|s| s.id == id)
    }

    pub fn set_mut(&mut self, id: Uuid) -> Option<&mut Set> {
        self.sets.iter_mut().find(|s| s.id == id)
    }

    pub fn is_schedulable(&self) -> bool {
        !self.draft && self.remaining > 0
    }

    /// First set in order with prints left that this printer can run.
    pub fn next_set(&self, profile: &str, eligible: impl Fn(&Set) -> bool) -> Option<&Set> {
        if !self.is_schedulable() {
            return None;
        }
        self.sets
            .iter()
            .find(|s| s.remaining > 0 && s.is_compatible(profile) && eligible(s))
    }

    /// Records a finished print of `set_id` and returns the next set to print,
    /// if this job still has printable work for `profile`.
    ///
    /// When every set of the current repetition is done the job itself is
    /// decremented and, if repetitions remain, all sets are refreshed.
    pub fn decrement_set(
        &mut self,
        set_id: Uuid,
        profile: &str,
        eligible: impl Fn(&Set) -> bool,
    ) -> Result<Option<Uuid>> {
        self.set_mut(set_id)
            .ok_or(BedloopError::SetNotFound(set_id))?
            .decrement();

        if let Some(next) = self.next_set(profile, &eligible) {
            return Ok(Some(next.id));
        }
        if self.sets.iter().any(|s| s.remaining > 0) {
            // Sets left over that this printer can't run
            return Ok(None);
        }

        self.remaining = self.remaining.saturating_sub(1);
        if self.remaining == 0 {
            return Ok(None);
        }
        self.refresh_sets();
        Ok(self.next_set(profile, &eligible).map(|s| s.id))
    }

    pub fn refresh_sets(&mut self) {
        for set in &mut self.sets {
            set.refresh();
        }
    }

    /// Restores all counts as if the job had never been printed.
    pub fn reset(&mut self) {
        self.remaining = self.count;
        self.refresh_sets();
    }

    pub(crate) fn renumber_sets(&mut self) {
        for (i, set) in self.sets.iter_mut().enumerate() {
            set.rank = i as u32;
            set.job_id = self.id;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunResult {
    Success,
    Failure,
}

impl std::fmt::Display for RunResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunResult::Success => write!(f, "success"),
            RunResult::Failure => write!(f, "failure"),
        }
    }
}

/// One attempt at printing a set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: u64,
    pub queue: String,
    pub job_id: Uuid,
    pub job_name: String,
    pub set_id: Uuid,
    pub set_path: String,
    pub start: DateTime<Utc>,
    pub end: Option<DateTime<Utc>>,
    pub result: Option<RunResult>,
}

impl Run {
    pub fn is_open(&self) -> bool {
        self.end.is_none()
    }

    pub fn matches(&self, queue: &str, job: &Job, set: &Set) -> bool {
        self.queue == queue && self.job_id == job.id && self.set_id == set.id
    }

    pub fn elapsed(&self) -> chrono::Duration {
        self.end.unwrap_or_else(Utc::now) - self.start
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job_with_sets(count: u32, set_counts: &[u32]) -> Job {
        let mut job = Job::new("job", JobRank::Lex("i".into())).with_count(count);
        for (i, &c) in set_counts.iter().enumerate() {
            job.push_set(Set::new(job.id, format!("{i}.gcode"), c));
        }
        job
    }

    #[test]
    fn test_set_decrement_keeps_completed_consistent() {
        let mut set = Set::new(Uuid::new_v4(), "a.gcode", 2);
        set.decrement();
        assert_eq!((set.remaining, set.completed), (1, 1));
        set.decrement();
        set.decrement();
        assert_eq!((set.remaining, set.completed), (0, 2));
        assert_eq!(set.completed + set.remaining, set.count);
    }

    #[test]
    fn test_profile_compatibility() {
        let set = Set::new(Uuid::new_v4(), "a.gcode", 1);
        assert!(set.is_compatible("MK3S"));
        let set = set.with_profiles(vec!["MK4".into()]);
        assert!(set.is_compatible("MK4"));
        assert!(!set.is_compatible("MK3S"));
    }

    #[test]
    fn test_decrement_walks_sets_then_repeats_job() {
        let mut job = job_with_sets(2, &[1, 1]);
        let a = job.sets[0].id;
        let b = job.sets[1].id;

        assert_eq!(job.decrement_set(a, "", |_| true).unwrap(), Some(b));
        // Last set of the first repetition refreshes everything
        assert_eq!(job.decrement_set(b, "", |_| true).unwrap(), Some(a));
        assert_eq!(job.remaining, 1);
        assert!(job.sets.iter().all(|s| s.remaining == 1 && s.completed == 0));

        assert_eq!(job.decrement_set(a, "", |_| true).unwrap(), Some(b));
        assert_eq!(job.decrement_set(b, "", |_| true).unwrap(), None);
        assert_eq!(job.remaining, 0);
        assert!(job.next_set("", |_| true).is_none());
    }

    #[test]
    fn test_decrement_stops_on_incompatible_set() {
        let mut job = job_with_sets(1, &[1, 1]);
        job.sets[1].profile_keys = vec!["other".into()];
        let a = job.sets[0].id;

        assert_eq!(job.decrement_set(a, "mine", |_| true).unwrap(), None);
        // The job is not counted down while another printer still has work
        assert_eq!(job.remaining, 1);
    }

    #[test]
    fn test_draft_jobs_are_not_schedulable() {
        let mut job = job_with_sets(1, &[1]);
        job.draft = true;
        assert!(job.next_set("", |_| true).is_none());
    }

    #[test]
    fn test_reset_restores_counts() {
        let mut job = job_with_sets(1, &[2]);
        let a = job.sets[0].id;
        job.decrement_set(a, "", |_| true).unwrap();
        job.decrement_set(a, "", |_| true).unwrap();
        assert_eq!(job.remaining, 0);

        job.reset();
        assert_eq!(job.remaining, 1);
        assert_eq!(job.sets[0].remaining, 2);
        assert_eq!(job.sets[0].completed, 0);
    }

    #[test]
    fn test_rank_queue_order() {
        let a = JobRank::Lex("a".into());
        let b = JobRank::Lex("b".into());
        assert_eq!(a.queue_order(&b), Ordering::Less);

        let hi = JobRank::Fraction(Fraction::new(2, 1));
        let lo = JobRank::Fraction(Fraction::new(1, 2));
        assert_eq!(hi.queue_order(&lo), Ordering::Less);
    }

    #[test]
    fn test_matches_path() {
        let set = Set::new(Uuid::new_v4(), "sub/a.gcode", 1);
        assert!(set.matches_path("sub/a.gcode"));
        assert!(set.matches_path("/uploads/sub/a.gcode"));
        assert!(!set.matches_path("b.gcode"));
    }
}
