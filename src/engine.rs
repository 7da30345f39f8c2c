//! The `Engine` facade (spec §9 design notes: "a single Engine value...
//! each background worker captures an immutable reference/clone").
//!
//! `Engine` is cheap to clone — every field is already `Arc`-backed or
//! internally `Arc`-backed — so each submitted job's worker thread just
//! clones it and owns its copy for the thread's lifetime. There is no
//! shared worker pool: a job's lifecycle is one `std::thread::spawn` that
//! blocks in [`Scheduler::wait_for_turn`]/[`Scheduler::acquire_run_slot`]
//! until admitted, runs the dispatcher, and exits.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::cancel::CancelToken;
use crate::config::EngineConfig;
use crate::dispatcher;
use crate::domain::artifact::{artifact_present, ArtifactKind};
use crate::domain::job::{Job, JobRequest, JobState};
use crate::error::{Error, Result};
use crate::events::EventBus;
use crate::locks::TaskLockRegistry;
use crate::paths;
use crate::persistence::{self, Persistence};
use crate::process::ProcessRunner;
use crate::registry::{JobFilter, JobRegistry};
use crate::scheduler::Scheduler;

#[derive(Clone)]
pub struct Engine {
    pub(crate) config: Arc<EngineConfig>,
    pub(crate) registry: Arc<JobRegistry>,
    pub(crate) scheduler: Arc<Scheduler>,
    pub(crate) runner: ProcessRunner,
    pub(crate) locks: TaskLockRegistry,
    persistence: Persistence,
}

impl Engine {
    /// Builds a fresh engine and restores any jobs persisted by a previous
    /// run (spec §4.9). Call once at process startup.
    pub fn bootstrap(config: EngineConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.state_dir)?;
        let persistence = Persistence::new(&config.state_dir, config.job_persist_disable)?;
        let registry = Arc::new(JobRegistry::new(EventBus::default(), persistence.clone()));
        let scheduler = Arc::new(Scheduler::new(config.job_max_concurrency as usize, config.strict_fifo_start));
        let runner = ProcessRunner::new(config.ffmpeg_concurrency as usize, config.ffmpeg_timelimit);
        let locks = TaskLockRegistry::new();

        let engine = Self {
            config: Arc::new(config),
            registry,
            scheduler,
            runner,
            locks,
            persistence,
        };
        engine.restore_jobs();
        Ok(engine)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn events(&self) -> &EventBus {
        self.registry.events()
    }

    /// Rehydrates `.jobs/*.json`, normalizes each record's state (spec
    /// §4.9), and re-queues whatever comes back `queued` through a
    /// `RESTORE_WORKERS`-bounded pool rather than one thread per job —
    /// a library with thousands of backlogged jobs shouldn't spin up
    /// thousands of OS threads just to sit in `wait_for_turn`.
    fn restore_jobs(&self) {
        let mut to_requeue: VecDeque<String> = VecDeque::new();
        for job in self.persistence.load_all() {
            let restored = persistence::normalize_restored_state(job, !self.config.job_autorestore_disable);
            let id = restored.id.clone();
            let created_at = restored.created_at;
            let should_requeue = restored.state == JobState::Queued;
            self.registry.insert_restored(restored);
            if should_requeue {
                self.scheduler.enter_queue(created_at, &id);
                to_requeue.push_back(id);
            }
        }
        if to_requeue.is_empty() {
            return;
        }
        let queue = Arc::new(Mutex::new(to_requeue));
        for _ in 0..self.config.restore_workers.max(1) {
            let engine = self.clone();
            let queue = queue.clone();
            std::thread::spawn(move || loop {
                let next = queue.lock().unwrap().pop_front();
                let Some(id) = next else { return };
                engine.run_worker(id);
            });
        }
    }

    /// Accepts a job request, creates its record in `queued`, and spawns
    /// the worker thread that will carry it through its whole lifecycle.
    /// Rejects unrecognized tasks immediately rather than queuing a job
    /// that's guaranteed to fail the moment a worker picks it up.
    pub fn submit(&self, request: JobRequest) -> Result<Job> {
        dispatcher::validate_task(&request.task)?;
        let path = request.directory.clone().unwrap_or_default();
        let task_type = request.task.clone();
        let job = self.registry.create(request, task_type, path);
        self.scheduler.enter_queue(job.created_at, &job.id);
        self.spawn_worker(job.id.clone());
        Ok(job)
    }

    fn spawn_worker(&self, id: String) {
        let engine = self.clone();
        std::thread::spawn(move || engine.run_worker(id));
    }

    /// The full lifecycle of one job on its own thread: wait for fairness
    /// admission, acquire (and, for light-slot tasks, immediately release)
    /// a run slot, mark `running`, dispatch, and finalize.
    fn run_worker(&self, job_id: String) {
        let Some(cancel) = self.registry.cancel_token(&job_id) else { return };

        if !self.scheduler.wait_for_turn(&job_id, &cancel) {
            return; // canceled while queued; the registry already finalized it
        }
        let Some(permit) = self.scheduler.acquire_run_slot(&cancel) else {
            return; // canceled between admission and slot acquisition
        };
        self.registry.mark_running(&job_id);

        let Some(job) = self.registry.get(&job_id) else { return };
        let light = Scheduler::is_light_slot(&dispatcher::normalize_task(&job.request.task), &self.config)
            || dispatcher::is_batch_request(&job.request.task);

        // Light-slot tasks (spec §4.6): release the job-concurrency permit
        // right after the transition to `running` since the work ahead is
        // I/O- or orchestration-bound, not ffmpeg-process-bound, so holding
        // `JOB_RUN_SEM` the whole time would only starve other jobs.
        let mut permit = Some(permit);
        if light {
            permit.take();
        }

        let result = dispatcher::run_job(self, &job_id, &cancel);
        drop(permit);

        self.finalize(&job_id, result);
    }

    fn finalize(&self, job_id: &str, result: Result<serde_json::Value>) {
        match result {
            Ok(value) => self.registry.finish_ok(job_id, value),
            Err(Error::Canceled) => {
                let pause_requeue = self.registry.get(job_id).map(|j| j.pause_requeue).unwrap_or(false);
                if pause_requeue {
                    self.registry.requeue_after_pause(job_id);
                    if let Some(job) = self.registry.get(job_id) {
                        self.scheduler.enter_queue(job.created_at, &job.id);
                        self.spawn_worker(job.id.clone());
                    }
                } else {
                    self.registry.finish_err(job_id, &Error::Canceled);
                }
            }
            Err(e) => self.registry.finish_err(job_id, &e),
        }
    }

    pub fn get_job(&self, id: &str) -> Option<Job> {
        self.registry.get(id)
    }

    pub fn list_jobs(&self, filter: JobFilter) -> Vec<Job> {
        self.registry.list(filter)
    }

    pub fn cancel(&self, id: &str) -> bool {
        self.registry.cancel(id)
    }

    pub fn cancel_all(&self) -> usize {
        self.registry.cancel_all()
    }

    pub fn cancel_queued(&self) -> usize {
        let ids: Vec<String> = self
            .registry
            .list(JobFilter::default())
            .into_iter()
            .filter(|j| j.state == JobState::Queued)
            .map(|j| j.id)
            .collect();
        for id in &ids {
            self.scheduler.leave_queue(id);
        }
        self.registry.cancel_queued()
    }

    pub fn clear_completed(&self) -> usize {
        self.registry.clear_completed()
    }

    pub fn set_ffmpeg_concurrency(&self, n: usize) {
        self.runner.set_ffmpeg_concurrency(n);
        self.events().concurrency(n as u64);
    }

    pub fn ffmpeg_concurrency(&self) -> usize {
        self.runner.ffmpeg_concurrency()
    }

    pub fn set_job_concurrency(&self, n: usize) {
        self.scheduler.set_job_concurrency(n);
        self.events().concurrency(n as u64);
    }

    pub fn job_concurrency(&self) -> usize {
        self.scheduler.job_concurrency()
    }

    /// Global pause (spec §4.6): blocks new admissions and asks every
    /// active job to unwind and re-queue rather than killing them outright.
    pub fn set_paused(&self, paused: bool) {
        self.scheduler.set_paused(paused);
        self.events().pause(paused);
        if paused {
            for job in self.registry.list(JobFilter::default()) {
                if job.state == JobState::Running {
                    self.registry.request_pause_requeue(&job.id);
                }
            }
        }
    }

    pub fn is_paused(&self) -> bool {
        self.scheduler.is_paused()
    }

    pub fn artifact_path(&self, video: &Path, kind: ArtifactKind) -> PathBuf {
        paths::artifact_path(&self.config, video, kind)
    }

    pub fn artifact_exists(&self, video: &Path, kind: ArtifactKind) -> bool {
        artifact_present(kind, &self.artifact_path(video, kind))
    }

    pub fn media_path(&self, relative: &str) -> PathBuf {
        self.config.media_root.join(relative)
    }

    /// Background loop reaping jobs whose worker thread died without
    /// finalizing them (spec §4.5 "orphan reaper"). Intended to run for the
    /// lifetime of the process via its own thread.
    pub fn start_orphan_reaper(&self, poll_interval: Duration, max_idle: Duration, min_age: Duration) {
        let engine = self.clone();
        std::thread::spawn(move || loop {
            std::thread::sleep(poll_interval);
            engine
                .registry
                .reap_orphans(&engine.runner, max_idle.as_millis() as u64, min_age.as_millis() as u64);
        });
    }

    /// Sets a manual scene marker/intro/outro directly, bypassing the job
    /// queue (spec §4.7's manual marker editing endpoints act synchronously,
    /// not as submitted jobs).
    pub fn set_manual_marker(
        &self,
        video: &Path,
        time: f64,
        marker_type: Option<String>,
        label: Option<String>,
    ) -> Result<crate::domain::scene::ScenesDocument> {
        let ctx = self.marker_ctx(video);
        crate::artifacts::scenes::set_manual_marker(&ctx, video, time, marker_type, label)
    }

    pub fn set_intro_outro(&self, video: &Path, time: f64, is_intro: bool) -> Result<crate::domain::scene::ScenesDocument> {
        let ctx = self.marker_ctx(video);
        crate::artifacts::scenes::set_intro_outro(&ctx, video, time, is_intro)
    }

    pub fn delete_marker(&self, video: &Path, time: f64) -> Result<crate::domain::scene::ScenesDocument> {
        let ctx = self.marker_ctx(video);
        crate::artifacts::scenes::delete_marker(&ctx, video, time)
    }

    fn marker_ctx(&self, _video: &Path) -> crate::artifacts::GeneratorContext {
        crate::artifacts::GeneratorContext {
            config: self.config.clone(),
            runner: self.runner.clone(),
            job_id: "manual-marker-edit".to_string(),
            cancel: CancelToken::new(),
            report: crate::artifacts::no_progress(),
            force: false,
        }
    }
}
