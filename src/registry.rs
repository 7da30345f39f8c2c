//! C5 — Job Registry.
//!
//! An in-memory `id -> Job` map guarded by a single mutex, held only for
//! short critical sections (spec §4.5, §5). Every state transition is
//! followed by event publication and disk persistence, in that order
//! (spec §5 "persistence writes happen before the corresponding event
//! publication is considered durable").

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::RngCore;
use serde_json::Value;

use crate::cancel::CancelToken;
use crate::domain::job::{Job, JobRequest, JobState};
use crate::error::Error;
use crate::events::EventBus;
use crate::persistence::Persistence;
use crate::process::ProcessRunner;
use crate::sync_ext::MutexExt;

#[derive(Default, Clone, Copy)]
pub struct JobFilter<'a> {
    pub state: Option<JobState>,
    pub since: Option<u64>,
    pub marker: std::marker::PhantomData<&'a ()>,
}

struct Entry {
    job: Job,
    cancel: CancelToken,
    last_heartbeat_ms: u64,
}

pub struct JobRegistry {
    jobs: std::sync::Mutex<HashMap<String, Entry>>,
    events: EventBus,
    persistence: Persistence,
}

fn now_secs() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

fn now_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
}

/// 12 hex characters (6 random bytes), matching spec §3.4 "opaque 12-char hex".
pub fn new_job_id() -> String {
    let mut bytes = [0u8; 6];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

impl JobRegistry {
    pub fn new(events: EventBus, persistence: Persistence) -> Self {
        Self { jobs: std::sync::Mutex::new(HashMap::new()), events, persistence }
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Creates a new job in the `queued` state and publishes `created` then
    /// `queued` (spec §5 "created precedes queued precedes started").
    pub fn create(&self, request: JobRequest, task_type: String, path: String) -> Job {
        let id = new_job_id();
        let job = Job::new(id.clone(), request, task_type, path);
        {
            let mut jobs = self.jobs.lock_unpoisoned();
            jobs.insert(
                id.clone(),
                Entry { job: job.clone(), cancel: CancelToken::new(), last_heartbeat_ms: now_ms() },
            );
        }
        self.events.created(&job.id, &job.task_type, &job.path);
        let _ = self.persistence.save(&job);
        self.events.queued(&job.id, &job.task_type, &job.path);
        job
    }

    /// Restores a previously-persisted record verbatim (used by C9 at
    /// startup, after state normalization has already been applied).
    pub fn insert_restored(&self, job: Job) {
        let mut jobs = self.jobs.lock_unpoisoned();
        jobs.insert(
            job.id.clone(),
            Entry { job, cancel: CancelToken::new(), last_heartbeat_ms: now_ms() },
        );
    }

    pub fn get(&self, id: &str) -> Option<Job> {
        self.jobs.lock_unpoisoned().get(id).map(|e| e.job.clone())
    }

    pub fn list(&self, filter: JobFilter) -> Vec<Job> {
        self.jobs
            .lock_unpoisoned()
            .values()
            .map(|e| e.job.clone())
            .filter(|j| filter.state.map(|s| j.state == s).unwrap_or(true))
            .filter(|j| filter.since.map(|since| j.created_at >= since).unwrap_or(true))
            .collect()
    }

    pub fn queued_ids_by_fifo_order(&self) -> Vec<(u64, String)> {
        let mut ids: Vec<(u64, String)> = self
            .jobs
            .lock_unpoisoned()
            .values()
            .filter(|e| e.job.state == JobState::Queued)
            .map(|e| (e.job.created_at, e.job.id.clone()))
            .collect();
        ids.sort();
        ids
    }

    pub fn cancel_token(&self, id: &str) -> Option<CancelToken> {
        self.jobs.lock_unpoisoned().get(id).map(|e| e.cancel.clone())
    }

    pub fn mark_running(&self, id: &str) {
        let job = {
            let mut jobs = self.jobs.lock_unpoisoned();
            let Some(entry) = jobs.get_mut(id) else { return };
            entry.job.state = JobState::Running;
            entry.job.started_at = Some(now_secs());
            entry.last_heartbeat_ms = now_ms();
            entry.job.clone()
        };
        self.events.started(&job.id, &job.task_type, &job.path);
        let _ = self.persistence.save(&job);
    }

    /// Updates total/processed counters, clamping `processed <= total`, and
    /// emits a `progress` event (spec §4.5 "Progress update contract").
    /// `total`/`processed_set` overwrite; `processed_inc` is additive.
    pub fn set_progress(
        &self,
        id: &str,
        total: Option<u64>,
        processed_inc: Option<u64>,
        processed_set: Option<u64>,
    ) {
        let job = {
            let mut jobs = self.jobs.lock_unpoisoned();
            let Some(entry) = jobs.get_mut(id) else { return };
            if let Some(t) = total {
                entry.job.total = t;
            }
            if let Some(set) = processed_set {
                entry.job.processed = set;
            } else if let Some(inc) = processed_inc {
                entry.job.processed = entry.job.processed.saturating_add(inc);
            }
            if entry.job.total > 0 {
                entry.job.processed = entry.job.processed.min(entry.job.total);
            }
            entry.last_heartbeat_ms = now_ms();
            entry.job.clone()
        };
        self.events.progress(&job.id, job.total, job.processed, job.progress_percent());
    }

    /// Stamps a child job with its batch supervisor's id (spec §4.7 "Batch
    /// job pattern"). No event is published: this is metadata visible in
    /// `GET /jobs`, not a lifecycle transition.
    pub fn set_meta_batch(&self, id: &str, supervisor_id: &str) {
        let mut jobs = self.jobs.lock_unpoisoned();
        if let Some(entry) = jobs.get_mut(id) {
            entry.job.meta_batch = Some(supervisor_id.to_string());
        }
    }

    pub fn set_current(&self, id: &str, current: Option<String>) {
        let job = {
            let mut jobs = self.jobs.lock_unpoisoned();
            let Some(entry) = jobs.get_mut(id) else { return };
            entry.job.current.clone_from(&current);
            entry.last_heartbeat_ms = now_ms();
            entry.job.clone()
        };
        if let Some(current) = job.current.as_deref() {
            self.events.current(&job.id, current);
        }
    }

    pub fn heartbeat(&self, id: &str) {
        if let Some(entry) = self.jobs.lock_unpoisoned().get_mut(id) {
            entry.last_heartbeat_ms = now_ms();
        }
    }

    /// Terminal success: snaps `processed` to `total` (spec §4.5) and
    /// publishes `finished` with `error: null`.
    pub fn finish_ok(&self, id: &str, result: Value) {
        let job = {
            let mut jobs = self.jobs.lock_unpoisoned();
            let Some(entry) = jobs.get_mut(id) else { return };
            entry.job.state = JobState::Done;
            entry.job.processed = entry.job.total.max(entry.job.processed);
            entry.job.ended_at = Some(now_secs());
            entry.job.result = Some(result);
            entry.job.error = None;
            entry.job.current = None;
            entry.job.clone()
        };
        let _ = self.persistence.save(&job);
        self.events.result(&job.id, job.result.as_ref().unwrap_or(&Value::Null));
        self.events.finished(&job.id, None);
    }

    /// Terminal failure or cancellation, per the mapping in `Error::job_state`
    /// (spec §7: `canceled` leaves `error` unset, everything else populates it).
    pub fn finish_err(&self, id: &str, err: &Error) {
        let (state, message) = err.job_state();
        let job = {
            let mut jobs = self.jobs.lock_unpoisoned();
            let Some(entry) = jobs.get_mut(id) else { return };
            entry.job.state = state;
            entry.job.ended_at = Some(now_secs());
            entry.job.error.clone_from(&message);
            entry.job.current = None;
            entry.job.clone()
        };
        let _ = self.persistence.save(&job);
        self.events.finished(&job.id, job.error.as_deref());
    }

    /// Marks a job for cooperative pause-and-requeue (spec §4.6 "Global
    /// pause"): the cancel signal fires so the worker unwinds promptly, and
    /// `pause_requeue` tells the dispatcher to re-enter `queued` on exit
    /// instead of treating the cancel as a user-initiated cancellation.
    pub fn request_pause_requeue(&self, id: &str) {
        let mut jobs = self.jobs.lock_unpoisoned();
        if let Some(entry) = jobs.get_mut(id) {
            if entry.job.state.is_active() {
                entry.job.pause_requeue = true;
                entry.job.paused = true;
                entry.cancel.cancel();
            }
        }
    }

    /// Re-enters `queued` after a cooperative pause unwind (spec §3.4
    /// lifecycle: `running -> queued (if pause_requeue)`). Replaces the
    /// cancel token since the old one is now permanently tripped.
    pub fn requeue_after_pause(&self, id: &str) {
        let mut jobs = self.jobs.lock_unpoisoned();
        if let Some(entry) = jobs.get_mut(id) {
            entry.job.state = JobState::Queued;
            entry.job.started_at = None;
            entry.job.pause_requeue = false;
            entry.job.paused = false;
            entry.job.current = None;
            entry.cancel = CancelToken::new();
        }
    }

    /// Cancels one job. Queued jobs complete in well under the spec's
    /// 200ms boundary because there's no subprocess to tear down; running
    /// jobs signal cancellation and rely on the worker's own polling loop
    /// (spec §5 "suspension / blocking points") to observe it. Idempotent:
    /// canceling an already-terminal job is a no-op success (spec §5).
    pub fn cancel(&self, id: &str) -> bool {
        let (already_terminal, was_queued) = {
            let mut jobs = self.jobs.lock_unpoisoned();
            let Some(entry) = jobs.get_mut(id) else { return false };
            if entry.job.state.is_terminal() {
                (true, false)
            } else {
                entry.cancel.cancel();
                (false, entry.job.state == JobState::Queued)
            }
        };
        if already_terminal {
            return true;
        }
        self.events.cancel(id);
        if was_queued {
            // No worker thread is watching this job's cancel token yet;
            // the registry finalizes it directly.
            self.finish_err(id, &Error::Canceled);
        }
        true
    }

    pub fn cancel_all(&self) -> usize {
        let ids: Vec<String> = self
            .jobs
            .lock_unpoisoned()
            .values()
            .filter(|e| e.job.state.is_active())
            .map(|e| e.job.id.clone())
            .collect();
        for id in &ids {
            self.cancel(id);
        }
        self.events.cancel_all(ids.len());
        ids.len()
    }

    pub fn cancel_queued(&self) -> usize {
        let ids: Vec<String> = self
            .jobs
            .lock_unpoisoned()
            .values()
            .filter(|e| e.job.state == JobState::Queued)
            .map(|e| e.job.id.clone())
            .collect();
        for id in &ids {
            self.cancel(id);
        }
        ids.len()
    }

    /// Drops every terminal job record from memory and disk, returning how
    /// many were cleared (spec §6.2-adjacent "clear completed" operation).
    pub fn clear_completed(&self) -> usize {
        let ids: Vec<String> = {
            let jobs = self.jobs.lock_unpoisoned();
            jobs.values().filter(|e| e.job.state.is_terminal()).map(|e| e.job.id.clone()).collect()
        };
        {
            let mut jobs = self.jobs.lock_unpoisoned();
            for id in &ids {
                jobs.remove(id);
            }
        }
        for id in &ids {
            self.persistence.delete(id);
        }
        self.events.purge(ids.len());
        ids.len()
    }

    /// Marks running jobs whose heartbeat is stale and which have no live
    /// tracked subprocesses as `failed` (spec §4.5 "orphan reaper"). Guards
    /// against a worker thread that panicked or was killed out from under
    /// its job record without ever reaching `finish_err`.
    pub fn reap_orphans(&self, runner: &ProcessRunner, max_idle_ms: u64, min_age_ms: u64) -> usize {
        let now = now_ms();
        let stale: Vec<String> = {
            let jobs = self.jobs.lock_unpoisoned();
            jobs.values()
                .filter(|e| e.job.state == JobState::Running)
                .filter(|e| now.saturating_sub(e.last_heartbeat_ms) >= max_idle_ms)
                .filter(|e| e.job.started_at.map(|s| now.saturating_sub(s * 1000) >= min_age_ms).unwrap_or(true))
                .filter(|e| !runner.has_live_processes(&e.job.id))
                .map(|e| e.job.id.clone())
                .collect()
        };
        for id in &stale {
            self.finish_err(
                id,
                &Error::Other(anyhow::anyhow!("orphaned: no heartbeat for {max_idle_ms}ms and no live subprocess")),
            );
        }
        stale.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn registry() -> (JobRegistry, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let persistence = Persistence::new(dir.path(), false).unwrap();
        (JobRegistry::new(EventBus::new(64), persistence), dir)
    }

    #[test]
    fn create_assigns_twelve_char_hex_id_and_queues() {
        let (reg, _dir) = registry();
        let job = reg.create(JobRequest::default(), "thumbnail".into(), "a.mp4".into());
        assert_eq!(job.id.len(), 12);
        assert!(job.id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(job.state, JobState::Queued);
    }

    #[test]
    fn progress_clamps_processed_to_total() {
        let (reg, _dir) = registry();
        let job = reg.create(JobRequest::default(), "sprites".into(), "a.mp4".into());
        reg.set_progress(&job.id, Some(5), None, Some(100));
        let updated = reg.get(&job.id).unwrap();
        assert_eq!(updated.processed, 5);
        assert_eq!(updated.total, 5);
    }

    #[test]
    fn finish_ok_snaps_processed_to_total() {
        let (reg, _dir) = registry();
        let job = reg.create(JobRequest::default(), "phash".into(), "a.mp4".into());
        reg.set_progress(&job.id, Some(10), None, Some(3));
        reg.finish_ok(&job.id, serde_json::json!({"status": "ok"}));
        let done = reg.get(&job.id).unwrap();
        assert_eq!(done.processed, 10);
        assert_eq!(done.state, JobState::Done);
    }

    #[test]
    fn cancel_queued_job_finishes_immediately_without_running() {
        let (reg, _dir) = registry();
        let job = reg.create(JobRequest::default(), "thumbnail".into(), "a.mp4".into());
        assert!(reg.cancel(&job.id));
        let canceled = reg.get(&job.id).unwrap();
        assert_eq!(canceled.state, JobState::Canceled);
        assert!(canceled.error.is_none());
    }

    #[test]
    fn cancel_is_idempotent_on_terminal_jobs() {
        let (reg, _dir) = registry();
        let job = reg.create(JobRequest::default(), "thumbnail".into(), "a.mp4".into());
        reg.finish_ok(&job.id, serde_json::json!({}));
        assert!(reg.cancel(&job.id));
        assert!(reg.cancel(&job.id));
    }

    #[test]
    fn cancel_running_job_signals_token_without_finishing_yet() {
        let (reg, _dir) = registry();
        let job = reg.create(JobRequest::default(), "preview".into(), "a.mp4".into());
        reg.mark_running(&job.id);
        assert!(reg.cancel(&job.id));
        let still_running = reg.get(&job.id).unwrap();
        assert_eq!(still_running.state, JobState::Running);
        assert!(reg.cancel_token(&job.id).unwrap().is_canceled());
    }

    #[test]
    fn clear_completed_removes_only_terminal_jobs() {
        let (reg, _dir) = registry();
        let done = reg.create(JobRequest::default(), "thumbnail".into(), "a.mp4".into());
        reg.finish_ok(&done.id, serde_json::json!({}));
        let queued = reg.create(JobRequest::default(), "thumbnail".into(), "b.mp4".into());
        let cleared = reg.clear_completed();
        assert_eq!(cleared, 1);
        assert!(reg.get(&done.id).is_none());
        assert!(reg.get(&queued.id).is_some());
    }

    #[test]
    fn reap_orphans_fails_stale_running_jobs_with_no_live_process() {
        let (reg, dir) = registry();
        let runner = ProcessRunner::new(1, std::time::Duration::from_secs(600));
        let job = reg.create(JobRequest::default(), "preview".into(), "a.mp4".into());
        reg.mark_running(&job.id);
        std::thread::sleep(std::time::Duration::from_millis(5));
        let reaped = reg.reap_orphans(&runner, 1, 0);
        assert_eq!(reaped, 1);
        assert_eq!(reg.get(&job.id).unwrap().state, JobState::Failed);
        let _ = Path::new(dir.path());
    }
}
