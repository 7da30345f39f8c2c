//! C6 — Job Scheduler.
//!
//! Two independent capacity knobs (spec §4.6): `JOB_RUN_SEM` governs how
//! many jobs may be in `running` state at once, `FFMPEG_SEM` (owned by
//! [`crate::process::ProcessRunner`]) governs live ffmpeg processes. A job
//! may be `running` while still waiting on the ffmpeg gate. On top of the
//! run semaphore sits a FIFO fairness window so that raising
//! `JOB_MAX_CONCURRENCY` actually admits more parallel jobs instead of
//! serializing on an implicit fairness gate.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::cancel::CancelToken;
use crate::process::semaphore::{DynamicSemaphore, Permit};
use crate::sync_ext::MutexExt;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

pub struct Scheduler {
    job_sem: DynamicSemaphore,
    strict_fifo_start: AtomicBool,
    paused: AtomicBool,
    /// `(created_at, id)` for every job currently waiting in `wait_for_turn`,
    /// kept sorted so "first K entries" is a cheap prefix slice.
    fifo_queue: Mutex<VecDeque<(u64, String)>>,
}

impl Scheduler {
    pub fn new(job_max_concurrency: usize, strict_fifo_start: bool) -> Self {
        Self {
            job_sem: DynamicSemaphore::new(job_max_concurrency),
            strict_fifo_start: AtomicBool::new(strict_fifo_start),
            paused: AtomicBool::new(false),
            fifo_queue: Mutex::new(VecDeque::new()),
        }
    }

    pub fn set_job_concurrency(&self, n: usize) {
        self.job_sem.set_capacity(n);
    }

    pub fn job_concurrency(&self) -> usize {
        self.job_sem.capacity()
    }

    pub fn set_strict_fifo_start(&self, v: bool) {
        self.strict_fifo_start.store(v, Ordering::SeqCst);
    }

    pub fn set_paused(&self, v: bool) {
        self.paused.store(v, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Registers a job as eligible for the FIFO fairness window. Call once
    /// when a job becomes `queued` and eligible to run.
    pub fn enter_queue(&self, created_at: u64, id: &str) {
        let mut queue = self.fifo_queue.lock_unpoisoned();
        if queue.iter().any(|(_, existing)| existing == id) {
            return;
        }
        queue.push_back((created_at, id.to_string()));
        let mut entries: Vec<_> = queue.drain(..).collect();
        entries.sort();
        *queue = entries.into();
    }

    /// Removes a job from the fairness window without running it (used on
    /// cancel-while-queued).
    pub fn leave_queue(&self, id: &str) {
        self.fifo_queue.lock_unpoisoned().retain(|(_, existing)| existing != id);
    }

    /// Blocks until `id` may proceed to acquire a run slot, or `cancel`
    /// fires. Returns `false` on cancellation (spec §5 "wait_for_turn —
    /// interruptible by cancel").
    pub fn wait_for_turn(&self, id: &str, cancel: &CancelToken) -> bool {
        loop {
            if cancel.is_canceled() {
                self.leave_queue(id);
                return false;
            }
            if !self.paused.load(Ordering::SeqCst) && self.is_my_turn(id) {
                self.leave_queue(id);
                return true;
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    fn is_my_turn(&self, id: &str) -> bool {
        let strict = self.strict_fifo_start.load(Ordering::SeqCst);
        if !strict && self.job_sem.available() > 0 {
            return true;
        }
        let k = if strict { 1 } else { self.job_sem.capacity() };
        let queue = self.fifo_queue.lock_unpoisoned();
        queue.iter().take(k).any(|(_, existing)| existing == id)
    }

    /// Blocks until a run slot (`JOB_RUN_SEM`) is acquired or `cancel`
    /// fires. Callers should have already won `wait_for_turn`.
    pub fn acquire_run_slot(&self, cancel: &CancelToken) -> Option<Permit> {
        self.job_sem.acquire_cancelable(cancel)
    }

    pub fn is_light_slot(task: &str, config: &crate::config::EngineConfig) -> bool {
        config.is_light_slot_task(task)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fast_path_admits_more_jobs_when_capacity_raised() {
        let scheduler = Scheduler::new(1, false);
        let cancel = CancelToken::new();
        scheduler.enter_queue(1, "a");
        assert!(scheduler.wait_for_turn("a", &cancel));
        let _permit = scheduler.acquire_run_slot(&cancel).unwrap();

        scheduler.enter_queue(2, "b");
        // Capacity still 1 and held: b must wait until raised or a finishes.
        scheduler.set_job_concurrency(2);
        assert!(scheduler.wait_for_turn("b", &cancel));
    }

    #[test]
    fn strict_fifo_admits_only_the_head_of_queue() {
        let scheduler = Scheduler::new(4, true);
        // "first" has the earliest created_at, so it's the sole eligible
        // entry under strict FIFO (K=1), regardless of insertion order.
        scheduler.enter_queue(2, "second");
        scheduler.enter_queue(1, "first");
        assert!(scheduler.is_my_turn("first"));
        assert!(!scheduler.is_my_turn("second"));
    }

    #[test]
    fn cancel_unblocks_wait_for_turn() {
        let scheduler = Scheduler::new(1, true);
        let cancel = CancelToken::new();
        scheduler.enter_queue(5, "only");
        let _held = scheduler.acquire_run_slot(&cancel);
        scheduler.enter_queue(6, "blocked");
        cancel.cancel();
        assert!(!scheduler.wait_for_turn("blocked", &cancel));
    }

    #[test]
    fn pause_blocks_admission_until_unpaused() {
        let scheduler = Scheduler::new(4, false);
        scheduler.set_paused(true);
        scheduler.enter_queue(1, "x");
        let cancel = CancelToken::new();
        std::thread::sleep(Duration::from_millis(50));
        scheduler.set_paused(false);
        assert!(scheduler.wait_for_turn("x", &cancel));
    }
}
