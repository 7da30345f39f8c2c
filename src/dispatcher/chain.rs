//! Sequential multi-step task (spec §4.7 "chain").
//!
//! `params.steps` is an ordered list of `{task, params?, directory?,
//! recursive?, force?}`. Each step runs as its own target fan-out, scaled
//! into a 100-unit slice of the overall job so progress reads the same way
//! a `Graded` single task would. By default a failing step aborts the
//! remaining ones; `continue_on_error: true` runs every step regardless and
//! reports per-step outcomes.

use std::collections::HashMap;

use serde::Deserialize;
use serde_json::{json, Value};

use crate::cancel::CancelToken;
use crate::domain::job::{Job, JobRequest};
use crate::engine::Engine;
use crate::error::{Error, Result};

use super::targets;

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct ChainStep {
    task: String,
    params: HashMap<String, Value>,
    directory: Option<String>,
    recursive: bool,
    force: bool,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct ChainParams {
    steps: Vec<ChainStep>,
    continue_on_error: bool,
}

pub fn run(engine: &Engine, job_id: &str, job: &Job, cancel: &CancelToken) -> Result<Value> {
    let chain_params: ChainParams =
        serde_json::from_value(Value::Object(job.request.params.clone().into_iter().collect())).unwrap_or_default();

    if chain_params.steps.is_empty() {
        return Err(Error::InvalidArgument("chain requires a non-empty 'steps' array".into()));
    }

    let step_count = chain_params.steps.len() as u64;
    engine.registry.set_progress(job_id, Some(step_count * 100), None, Some(0));

    let mut step_reports = Vec::new();

    for (index, step) in chain_params.steps.iter().enumerate() {
        if cancel.is_canceled() {
            return Err(Error::Canceled);
        }
        if step.task.trim().is_empty() {
            return Err(Error::InvalidArgument(format!("chain step {index} is missing 'task'")));
        }

        let step_request = JobRequest {
            task: step.task.clone(),
            directory: step.directory.clone().or_else(|| job.request.directory.clone()),
            recursive: step.recursive || job.request.recursive,
            force: step.force || job.request.force,
            params: step.params.clone(),
            label: None,
            priority: job.request.priority,
        };
        let normalized = super::normalize_task(&step.task);
        if matches!(normalized.as_str(), "chain") {
            return Err(Error::InvalidArgument("chain steps may not themselves be 'chain'".into()));
        }

        let step_videos = targets::resolve_targets(&engine.config, &step_request);
        let base = index as u64 * 100;
        let denom = step_videos.len().max(1) as u64;

        let mut step_failures = Vec::new();
        for (i, video) in step_videos.iter().enumerate() {
            if cancel.is_canceled() {
                return Err(Error::Canceled);
            }
            let registry = engine.registry.clone();
            let job_id_owned = job_id.to_string();
            let result = super::run_one_target(
                engine,
                job_id,
                &step.task,
                video,
                cancel,
                step_request.force,
                &step_request.params,
                crate::artifacts::no_progress(),
            );
            if let Err(e) = &result {
                step_failures.push(json!({"path": video.display().to_string(), "error": e.to_string()}));
            }
            let progress = base + ((i as u64 + 1) * 100) / denom;
            registry.set_progress(&job_id_owned, None, None, Some(progress));
        }

        let step_ok = step_failures.is_empty();
        step_reports.push(json!({
            "task": step.task,
            "targets": step_videos.len(),
            "ok": step_ok,
            "errors": step_failures,
        }));
        engine.registry.set_progress(job_id, None, None, Some((index as u64 + 1) * 100));

        if !step_ok && !chain_params.continue_on_error {
            return Err(Error::Other(anyhow::anyhow!(
                "chain aborted at step {index} ('{}')",
                step.task
            )));
        }
    }

    Ok(json!({"status": "done", "steps": step_reports}))
}
