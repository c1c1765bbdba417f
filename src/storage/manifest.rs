//! Job manifest: the wire format shared with peers and stored in `.gjob`
//! archives. Fields may be added but never renamed or removed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, ValidationError};
use crate::queue::rank::Fraction;
use crate::storage::model::{Job, JobRank, Set};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetManifest {
    pub id: Uuid,
    pub path: String,
    #[serde(default)]
    pub sd: bool,
    pub count: u32,
    pub remaining: u32,
    #[serde(default)]
    pub completed: u32,
    #[serde(default)]
    pub profiles: Vec<String>,
    #[serde(default)]
    pub materials: Vec<Option<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobManifest {
    pub id: Uuid,
    pub name: String,
    /// Unix seconds.
    pub created: i64,
    pub count: u32,
    pub remaining: u32,
    #[serde(rename = "peer_", default)]
    pub peer: Option<String>,
    #[serde(default)]
    pub hash: Option<String>,
    #[serde(default)]
    pub draft: bool,
    pub sets: Vec<SetManifest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rn: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rd: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rank: Option<String>,
}

impl JobManifest {
    pub fn from_job(job: &Job) -> Self {
        let (rn, rd, rank) = match &job.rank {
            JobRank::Fraction(f) => (Some(f.num), Some(f.den), None),
            JobRank::Lex(s) => (None, None, Some(s.clone())),
        };
        Self {
            id: job.id,
            name: job.name.clone(),
            created: job.created.timestamp(),
            count: job.count,
            remaining: job.remaining,
            peer: job.peer.clone(),
            hash: job.hash.clone(),
            draft: job.draft,
            sets: job
                .sets
                .iter()
                .map(|s| SetManifest {
                    id: s.id,
                    path: s.path.clone(),
                    sd: s.sd,
                    count: s.count,
                    remaining: s.remaining,
                    completed: s.completed,
                    profiles: s.profile_keys.clone(),
                    materials: s.material_keys.clone(),
                })
                .collect(),
            rn,
            rd,
            rank,
        }
    }

    /// Rational rank carried by the manifest, if any.
    pub fn fraction(&self) -> Option<Fraction> {
        match (self.rn, self.rd) {
            (Some(num), Some(den)) => Some(Fraction::new(num, den)),
            _ => None,
        }
    }

    /// Rejects per-set counts that break `remaining <= count`.
    pub fn check_counts(&self) -> std::result::Result<(), ValidationError> {
        for set in &self.sets {
            if set.remaining > set.count {
                return Err(ValidationError::InvalidCount {
                    set_id: set.id,
                    path: set.path.clone(),
                    count: set.count,
                    remaining: set.remaining,
                });
            }
        }
        Ok(())
    }

    /// Builds a job from this manifest. `rank` overrides whatever rank the
    /// manifest carries.
    pub fn to_job(&self, rank: JobRank) -> Job {
        let mut job = Job::new(self.name.clone(), rank).with_count(self.count);
        job.id = self.id;
        job.remaining = self.remaining.min(self.count);
        job.created = DateTime::<Utc>::from_timestamp(self.created, 0).unwrap_or_else(Utc::now);
        job.peer = self.peer.clone();
        job.hash = self.hash.clone();
        job.draft = self.draft;
        for s in &self.sets {
            let mut set = Set::new(job.id, s.path.clone(), s.count)
                .on_sd(s.sd)
                .with_profiles(s.profiles.clone())
                .with_materials(
                    s.materials
                        .iter()
                        .map(|m| m.clone().filter(|m| !m.is_empty()))
                        .collect(),
                );
            set.id = s.id;
            set.remaining = s.remaining.min(s.count);
            set.completed = s.count - set.remaining;
            job.push_set(set);
        }
        job
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(data: &str) -> Result<Self> {
        Ok(serde_json::from_str(data)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_job() -> Job {
        let mut job = Job::new("benchy", JobRank::Fraction(Fraction::new(3, 2))).with_count(2);
        job.push_set(
            Set::new(job.id, "benchy.gcode", 3)
                .with_profiles(vec!["MK3S".into()])
                .with_materials(vec![None, Some("PLA_red".into())]),
        );
        job
    }

    #[test]
    fn test_manifest_wire_field_names() {
        let manifest = JobManifest::from_job(&sample_job());
        let value: serde_json::Value = serde_json::from_str(&manifest.to_json().unwrap()).unwrap();

        assert_eq!(value["name"], "benchy");
        assert_eq!(value["rn"], 3);
        assert_eq!(value["rd"], 2);
        assert!(value.get("rank").is_none());
        assert!(value.get("peer_").is_some());
        assert_eq!(value["sets"][0]["profiles"][0], "MK3S");
        assert!(value["sets"][0]["materials"][0].is_null());
    }

    #[test]
    fn test_manifest_preserves_job() {
        let job = sample_job();
        let manifest = JobManifest::from_job(&job);
        let rebuilt = manifest.to_job(JobRank::Fraction(manifest.fraction().unwrap()));

        assert_eq!(rebuilt.id, job.id);
        assert_eq!(rebuilt.count, 2);
        assert_eq!(rebuilt.sets[0].id, job.sets[0].id);
        assert_eq!(rebuilt.sets[0].job_id, job.id);
        assert_eq!(rebuilt.sets[0].material_keys, job.sets[0].material_keys);
        assert_eq!(rebuilt.rank, job.rank);
    }

    #[test]
    fn test_empty_material_is_unconstrained() {
        let data = r#"{
            "id": "6a0c3a5e-8d4c-4f43-9b58-0a5a3fd1d001",
            "name": "j", "created": 0, "count": 1, "remaining": 1,
            "sets": [{"id": "6a0c3a5e-8d4c-4f43-9b58-0a5a3fd1d002",
                      "path": "a.gcode", "count": 1, "remaining": 1,
                      "materials": ["", "PETG"]}]
        }"#;
        let manifest = JobManifest::from_json(data).unwrap();
        let job = manifest.to_job(JobRank::Lex("i".into()));
        assert_eq!(job.sets[0].material_keys, vec![None, Some("PETG".to_string())]);
    }

    #[test]
    fn test_check_counts() {
        let mut manifest = JobManifest::from_job(&sample_job());
        assert!(manifest.check_counts().is_ok());
        manifest.sets[0].remaining = 9;
        assert!(matches!(
            manifest.check_counts(),
            Err(ValidationError::InvalidCount { remaining: 9, .. })
        ));
    }
}
