//! C9 — Persistence & Restore.
//!
//! Job records are written atomically to `<state_dir>/.jobs/<id>.json` on
//! every state change and rehydrated on startup (spec §4.9, §6.5). Volatile
//! fields (`current`) are dropped before the write lands, the same
//! "atomic write, omit the churny field" discipline [`atomic_write_json`]
//! already applies to generator sidecars.

use std::path::{Path, PathBuf};

use crate::artifacts::atomic_write;
use crate::domain::job::{Job, JobState};
use crate::error::Result;

#[derive(Clone)]
pub struct Persistence {
    jobs_dir: PathBuf,
    disabled: bool,
}

impl Persistence {
    pub fn new(state_dir: &Path, disabled: bool) -> Result<Self> {
        let jobs_dir = state_dir.join(".jobs");
        if !disabled {
            std::fs::create_dir_all(&jobs_dir)?;
        }
        Ok(Self { jobs_dir, disabled })
    }

    fn path_for(&self, id: &str) -> PathBuf {
        self.jobs_dir.join(format!("{id}.json"))
    }

    /// Persist a job's durable fields (spec §6.5 schema). A no-op when
    /// persistence is disabled (`JOB_PERSIST_DISABLE`).
    pub fn save(&self, job: &Job) -> Result<()> {
        if self.disabled {
            return Ok(());
        }
        let mut value = serde_json::to_value(job)?;
        if let Some(obj) = value.as_object_mut() {
            obj.remove("current");
        }
        let bytes = serde_json::to_vec_pretty(&value)?;
        atomic_write(&self.path_for(&job.id), &bytes)
    }

    pub fn delete(&self, id: &str) {
        let _ = std::fs::remove_file(self.path_for(id));
    }

    /// Enumerate `.jobs/*.json`, parsing what can be parsed and skipping
    /// (rather than failing startup over) anything corrupt — spec §8
    /// "no record is lost" refers to well-formed records; a half-written
    /// file from a prior crash during `save` itself is the one case this
    /// can't recover, since the write-temp-then-rename discipline is what
    /// prevents that in the first place.
    pub fn load_all(&self) -> Vec<Job> {
        let Ok(entries) = std::fs::read_dir(&self.jobs_dir) else {
            return Vec::new();
        };
        let mut jobs = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match std::fs::read(&path).ok().and_then(|b| serde_json::from_slice::<Job>(&b).ok()) {
                Some(job) => jobs.push(job),
                None => tracing::warn!(path = %path.display(), "skipping unparsable job record"),
            }
        }
        jobs
    }
}

/// State normalization applied to every rehydrated record (spec §4.9):
/// a job that had been asked to cancel never resurrects as anything but
/// `canceled`; a non-terminal job resumes as `queued` when auto-restore is
/// enabled, or parks as `restored` (a paused, manually-resumable state)
/// otherwise; terminal states pass through untouched.
pub fn normalize_restored_state(mut job: Job, autorestore_enabled: bool) -> Job {
    job.state = match job.state {
        JobState::Canceled => JobState::Canceled,
        JobState::Queued | JobState::Running | JobState::Restored => {
            if autorestore_enabled {
                JobState::Queued
            } else {
                JobState::Restored
            }
        }
        terminal @ (JobState::Done | JobState::Failed) => terminal,
    };
    job.current = None;
    job.paused = false;
    job.pause_requeue = false;
    job
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::job::JobRequest;

    fn job(state: JobState) -> Job {
        let mut j = Job::new("abcdef012345".into(), JobRequest::default(), "thumbnail".into(), "a.mp4".into());
        j.state = state;
        j
    }

    #[test]
    fn save_then_load_round_trips_durable_fields() {
        let dir = tempfile::tempdir().unwrap();
        let persistence = Persistence::new(dir.path(), false).unwrap();
        let mut j = job(JobState::Running);
        j.current = Some("scratch/current.mp4".into());
        j.total = 10;
        j.processed = 4;
        persistence.save(&j).unwrap();

        let loaded = persistence.load_all();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, j.id);
        assert_eq!(loaded[0].processed, 4);
        assert!(loaded[0].current.is_none(), "current is volatile and dropped on persist");
    }

    #[test]
    fn disabled_persistence_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let persistence = Persistence::new(dir.path(), true).unwrap();
        persistence.save(&job(JobState::Running)).unwrap();
        assert!(persistence.load_all().is_empty());
        assert!(!dir.path().join(".jobs").exists());
    }

    #[test]
    fn normalize_never_resurrects_canceled() {
        let j = normalize_restored_state(job(JobState::Canceled), true);
        assert_eq!(j.state, JobState::Canceled);
    }

    #[test]
    fn normalize_queued_or_restored_by_autorestore_flag() {
        let resumed = normalize_restored_state(job(JobState::Running), true);
        assert_eq!(resumed.state, JobState::Queued);
        let parked = normalize_restored_state(job(JobState::Queued), false);
        assert_eq!(parked.state, JobState::Restored);
    }

    #[test]
    fn normalize_preserves_terminal_states() {
        let done = normalize_restored_state(job(JobState::Done), true);
        assert_eq!(done.state, JobState::Done);
        let failed = normalize_restored_state(job(JobState::Failed), false);
        assert_eq!(failed.state, JobState::Failed);
    }
}
