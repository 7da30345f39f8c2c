//! Batch supervisor pattern (spec §4.7 "Batch job pattern").
//!
//! Submitting `task = "<name>-batch"` creates one supervisor job, visible
//! in the job list as `type: "<name>-batch"`, which resolves targets itself
//! and fans them out across a `BATCH_WORKERS`-bounded pool of per-file
//! child jobs (`type: "<name>"`, `meta_batch: Some(supervisor_id)`). The
//! supervisor's own progress tracks finished children, not bytes or
//! ffmpeg frames, so it uses the atomic model regardless of the child
//! task's own model.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::{json, Value};

use crate::cancel::CancelToken;
use crate::domain::job::Job;
use crate::engine::Engine;
use crate::error::{Error, Result};

use super::targets;

/// Runs the supervisor body: resolves targets, spawns one child job per
/// target through the registry (so each child gets its own id, its own
/// persisted record, and its own lifecycle events), and drains a bounded
/// worker pool that executes each child's generator body directly rather
/// than re-entering the scheduler's `JOB_RUN_SEM` — batch concurrency is a
/// deliberately separate knob (`BATCH_WORKERS`) from job concurrency, so a
/// supervisor never competes with its own children for the same semaphore.
pub fn run(engine: &Engine, supervisor_id: &str, job: &Job, cancel: &CancelToken) -> Result<Value> {
    let base_task = super::normalize_task(&job.request.task);
    let target_videos = targets::resolve_targets(&engine.config, &job.request);
    let total = target_videos.len() as u64;
    engine.registry.set_progress(supervisor_id, Some(total), None, Some(0));

    if target_videos.is_empty() {
        return Ok(json!({"status": "done", "children": 0}));
    }

    let worker_count = engine.config.batch_workers.max(1).min(target_videos.len());
    let queue: Arc<Mutex<std::collections::VecDeque<std::path::PathBuf>>> =
        Arc::new(Mutex::new(target_videos.into_iter().collect()));
    let done = Arc::new(AtomicUsize::new(0));
    let failed = Arc::new(AtomicUsize::new(0));
    let child_ids: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

    std::thread::scope(|scope| {
        let mut handles = Vec::new();
        for _ in 0..worker_count {
            let queue = queue.clone();
            let done = done.clone();
            let failed = failed.clone();
            let child_ids = child_ids.clone();
            let base_task = base_task.clone();
            let supervisor_id = supervisor_id.to_string();
            let params = job.request.params.clone();
            let force = job.request.force;
            handles.push(scope.spawn(move || {
                loop {
                    if cancel.is_canceled() {
                        return;
                    }
                    let next = queue.lock().unwrap().pop_front();
                    let Some(video) = next else { return };
                    let relative = super::relative_display(&engine.config, &video);

                    let child_request = crate::domain::job::JobRequest {
                        task: base_task.clone(),
                        directory: None,
                        recursive: false,
                        force,
                        params: {
                            let mut p = params.clone();
                            p.insert("targets".into(), json!([relative.clone()]));
                            p
                        },
                        label: job.request.label.clone(),
                        priority: job.request.priority,
                    };
                    let child = engine.registry.create(child_request, base_task.clone(), relative.clone());
                    engine.registry.set_meta_batch(&child.id, &supervisor_id);
                    child_ids.lock().unwrap().push(child.id.clone());
                    engine.registry.mark_running(&child.id);

                    let child_cancel = engine.registry.cancel_token(&child.id).unwrap_or_else(CancelToken::new);
                    let result = super::run_one_target(
                        engine,
                        &child.id,
                        &base_task,
                        &video,
                        &child_cancel,
                        force,
                        &child.request.params,
                        crate::artifacts::no_progress(),
                    );
                    match result {
                        Ok(value) => {
                            engine.registry.finish_ok(&child.id, value);
                            done.fetch_add(1, Ordering::SeqCst);
                        }
                        Err(err) => {
                            engine.registry.finish_err(&child.id, &err);
                            failed.fetch_add(1, Ordering::SeqCst);
                            done.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                    engine.registry.set_progress(&supervisor_id, None, None, Some(done.load(Ordering::SeqCst) as u64));
                }
            }));
        }
        for h in handles {
            let _ = h.join();
        }
    });

    if cancel.is_canceled() {
        return Err(Error::Canceled);
    }

    let failed_count = failed.load(Ordering::SeqCst);
    let total_done = done.load(Ordering::SeqCst);
    Ok(json!({
        "status": "done",
        "children": child_ids.lock().unwrap().clone(),
        "processed": total_done,
        "failed": failed_count,
    }))
}

#[cfg(test)]
mod tests {
    // Exercised end-to-end in `tests/` against a mock ffmpeg binary, since
    // a meaningful unit test here needs a real `Engine` with registry,
    // scheduler, and config wired together.
}
