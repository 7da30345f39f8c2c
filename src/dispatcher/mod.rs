//! C7 — Job Worker Dispatcher.
//!
//! Maps a job's `task` string to the generator(s) it fans out to (spec
//! §4.7), enforcing per-file locks, translating each generator's own
//! progress callback into the job's `total`/`processed` counters, and
//! finalizing job state. Runs on the worker thread the scheduler admitted
//! (spec §4.6) — everything here is synchronous, matching the C2-C4 call
//! chain it drives.

pub mod batch;
pub mod chain;
pub mod integrity;
pub mod targets;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::{json, Value};

use crate::artifacts::{faces, heatmaps, metadata, motion, phash, preview, scenes, sprites, subtitles, thumbnail, waveform};
use crate::artifacts::{no_progress, GeneratorContext};
use crate::cancel::CancelToken;
use crate::domain::job::Job;
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::paths;

/// Strips the `-batch` suffix and folds the documented aliases onto their
/// canonical handler key (spec §4.7).
pub fn normalize_task(raw: &str) -> String {
    let lower = raw.trim().to_ascii_lowercase();
    let base = lower.strip_suffix("-batch").unwrap_or(&lower);
    match base {
        "preview-concat" => "preview".to_string(),
        "heatmap" => "heatmaps".to_string(),
        "scenes" => "markers".to_string(),
        other => other.to_string(),
    }
}

pub fn is_batch_request(raw: &str) -> bool {
    raw.trim().to_ascii_lowercase().ends_with("-batch")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressModel {
    /// `total = N_files`; one unit of progress per completed target.
    Atomic,
    /// `total = N_files * 100`; sub-file fraction scaled into each
    /// target's 100-unit slice (spec §4.7 "Multi-target progress model").
    Graded,
}

#[derive(Debug, Clone)]
enum TaskKind {
    Metadata,
    Thumbnail,
    Waveform,
    Motion,
    Preview,
    Sprites,
    Phash,
    Markers,
    Heatmaps,
    Subtitles,
    Faces,
    CleanupArtifacts,
    IntegrityScan,
    Chain,
    OutOfCoreScope(String),
    Unknown(String),
}

/// The closed set of handler keys from spec §4.7. Keys outside the core's
/// scope (transcoding ladders, tag/embedding registries — spec §1's
/// "deliberately out of scope" collaborators) are recognized but refused,
/// rather than silently no-op'd, so a caller gets a clear `invalid_argument`
/// instead of a job that mysteriously does nothing.
fn classify(normalized: &str) -> TaskKind {
    match normalized {
        "metadata" => TaskKind::Metadata,
        "thumbnail" => TaskKind::Thumbnail,
        "waveform" => TaskKind::Waveform,
        "motion" => TaskKind::Motion,
        "preview" => TaskKind::Preview,
        "sprites" => TaskKind::Sprites,
        "phash" => TaskKind::Phash,
        "markers" => TaskKind::Markers,
        "heatmaps" => TaskKind::Heatmaps,
        "subtitles" => TaskKind::Subtitles,
        "faces" => TaskKind::Faces,
        "cleanup-artifacts" => TaskKind::CleanupArtifacts,
        "integrity-scan" => TaskKind::IntegrityScan,
        "chain" => TaskKind::Chain,
        out @ ("transcode" | "autotag" | "embed" | "clip" | "concat" | "sample" | "index-embeddings") => {
            TaskKind::OutOfCoreScope(out.to_string())
        }
        other => TaskKind::Unknown(other.to_string()),
    }
}

fn progress_model(kind: &TaskKind) -> ProgressModel {
    match kind {
        TaskKind::Metadata | TaskKind::Thumbnail | TaskKind::Waveform | TaskKind::Motion => ProgressModel::Atomic,
        _ => ProgressModel::Graded,
    }
}

/// Rejects a task string outright if it normalizes to something outside
/// the closed handler-key set (spec §4.7), so a bad request fails at
/// submission instead of silently sitting in `queued` until a worker picks
/// it up and fails it moments later.
pub(crate) fn validate_task(raw: &str) -> Result<()> {
    match classify(&normalize_task(raw)) {
        TaskKind::OutOfCoreScope(name) => Err(Error::InvalidArgument(format!(
            "task '{name}' is served by an external collaborator outside the core's scope"
        ))),
        TaskKind::Unknown(name) => Err(Error::InvalidArgument(format!("unknown task '{name}'"))),
        _ => Ok(()),
    }
}

/// Entry point called by the worker thread once the scheduler has admitted
/// the job and the registry has transitioned it to `running`.
pub fn run_job(engine: &Engine, job_id: &str, cancel: &CancelToken) -> Result<Value> {
    let job = engine.registry.get(job_id).ok_or_else(|| Error::NotFound(job_id.to_string()))?;
    if is_batch_request(&job.request.task) {
        return batch::run(engine, job_id, &job, cancel);
    }
    let normalized = normalize_task(&job.request.task);
    match classify(&normalized) {
        TaskKind::Chain => chain::run(engine, job_id, &job, cancel),
        TaskKind::IntegrityScan => integrity::run_scan(engine, job_id, cancel),
        TaskKind::CleanupArtifacts => integrity::run_cleanup(engine, job_id),
        TaskKind::OutOfCoreScope(name) => Err(Error::InvalidArgument(format!(
            "task '{name}' is served by an external collaborator outside the core's scope"
        ))),
        TaskKind::Unknown(name) => Err(Error::InvalidArgument(format!("unknown task '{name}'"))),
        kind => run_generator_fanout(engine, job_id, &job, kind, cancel, &normalized),
    }
}

fn parse_params<T: DeserializeOwned + Default>(params: &HashMap<String, Value>) -> T {
    let value = Value::Object(params.clone().into_iter().collect());
    serde_json::from_value(value).unwrap_or_default()
}

fn call_generator(kind: &TaskKind, ctx: &GeneratorContext, video: &Path, params: &HashMap<String, Value>) -> Result<Value> {
    match kind {
        TaskKind::Metadata => metadata::generate(ctx, video),
        TaskKind::Thumbnail => thumbnail::generate(ctx, video, parse_params(params)),
        TaskKind::Waveform => waveform::generate(ctx, video, parse_params(params)),
        TaskKind::Motion => motion::generate(ctx, video, parse_params(params)),
        TaskKind::Preview => preview::generate(ctx, video, parse_params(params)),
        TaskKind::Sprites => sprites::generate(ctx, video, parse_params(params)),
        TaskKind::Phash => phash::generate(ctx, video, parse_params(params)),
        TaskKind::Markers => scenes::generate(ctx, video, parse_params(params)),
        TaskKind::Heatmaps => heatmaps::generate(ctx, video, parse_params(params)),
        TaskKind::Subtitles => subtitles::generate(ctx, video),
        TaskKind::Faces => faces::generate(ctx, video, parse_params(params)),
        _ => unreachable!("non-generator task kinds are handled before call_generator"),
    }
}

pub(crate) fn build_generator_context(
    engine: &Engine,
    job_id: &str,
    cancel: &CancelToken,
    force: bool,
    report: crate::artifacts::ProgressFn,
) -> GeneratorContext {
    GeneratorContext {
        config: engine.config.clone(),
        runner: engine.runner.clone(),
        job_id: job_id.to_string(),
        cancel: cancel.clone(),
        report,
        force,
    }
}

/// Runs a single generator invocation against one target: acquires the
/// per-file task lock, builds a [`GeneratorContext`] wired to `progress`,
/// and calls the matching generator. Shared by the plain fan-out path below
/// and by [`batch`]'s per-file child jobs, which each own exactly one
/// target and no aggregate counters to maintain.
pub(crate) fn run_one_target(
    engine: &Engine,
    job_id: &str,
    task_name: &str,
    video: &Path,
    cancel: &CancelToken,
    force: bool,
    params: &HashMap<String, Value>,
    progress: crate::artifacts::ProgressFn,
) -> Result<Value> {
    let kind = classify(&normalize_task(task_name));
    let artifact_dir = paths::artifact_dir(&engine.config, video)?;
    let lock_guard = engine.locks.acquire(video, task_name, &artifact_dir);
    let ctx = build_generator_context(engine, job_id, cancel, force, progress);
    let result = call_generator(&kind, &ctx, video, params);
    drop(lock_guard);
    result
}

/// Runs one generator across every resolved target, reporting progress per
/// spec §4.7's multi-target model and enforcing the per-file/task lock
/// (spec §4.3) around each target's critical section.
fn run_generator_fanout(
    engine: &Engine,
    job_id: &str,
    job: &Job,
    kind: TaskKind,
    cancel: &CancelToken,
    task_name: &str,
) -> Result<Value> {
    let target_videos = targets::resolve_targets(&engine.config, &job.request);
    let model = progress_model(&kind);
    let scale: u64 = match model {
        ProgressModel::Atomic => 1,
        ProgressModel::Graded => 100,
    };
    let total = target_videos.len() as u64 * scale;
    engine.registry.set_progress(job_id, Some(total), None, Some(0));

    if target_videos.is_empty() {
        return Ok(json!({"status": "done", "targets": 0, "processed": 0}));
    }

    let mut successes = Vec::new();
    let mut failures = Vec::new();

    for (index, video) in target_videos.iter().enumerate() {
        if cancel.is_canceled() {
            return Err(Error::Canceled);
        }
        let relative = relative_display(&engine.config, video);
        engine.registry.set_current(job_id, Some(relative.clone()));

        let registry = engine.registry.clone();
        let job_id_owned = job_id.to_string();
        let done_before = index as u64;
        let report: crate::artifacts::ProgressFn = Arc::new(move |processed_sub, total_sub| {
            let frac = if total_sub == 0 { 0.0 } else { (processed_sub as f64 / total_sub as f64).clamp(0.0, 1.0) };
            let value = done_before * scale + (frac * scale as f64) as u64;
            registry.set_progress(&job_id_owned, None, None, Some(value));
        });

        let result = run_one_target(engine, job_id, task_name, video, cancel, job.request.force, &job.request.params, report);

        match result {
            Ok(value) => successes.push(json!({"path": relative, "result": value})),
            Err(Error::Canceled) => return Err(Error::Canceled),
            Err(e) => failures.push(json!({"path": relative, "error": e.to_string()})),
        }
        engine.registry.set_progress(job_id, None, None, Some((index as u64 + 1) * scale));
    }

    if successes.is_empty() && !failures.is_empty() {
        let first = failures[0]["error"].as_str().unwrap_or("generator failed").to_string();
        return Err(Error::Other(anyhow::anyhow!(first)));
    }

    Ok(json!({
        "status": "done",
        "targets": target_videos.len(),
        "succeeded": successes.len(),
        "failed": failures.len(),
        "results": successes,
        "errors": failures,
    }))
}

fn relative_display(config: &crate::config::EngineConfig, video: &Path) -> String {
    video
        .strip_prefix(&config.media_root)
        .unwrap_or(video)
        .to_string_lossy()
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_strips_batch_suffix_and_folds_aliases() {
        assert_eq!(normalize_task("sprites-batch"), "sprites");
        assert_eq!(normalize_task("preview-concat"), "preview");
        assert_eq!(normalize_task("heatmap"), "heatmaps");
        assert_eq!(normalize_task("Scenes"), "markers");
        assert_eq!(normalize_task("  Thumbnail "), "thumbnail");
    }

    #[test]
    fn is_batch_request_detects_suffix_case_insensitively() {
        assert!(is_batch_request("Sprites-Batch"));
        assert!(!is_batch_request("sprites"));
    }

    #[test]
    fn classify_recognizes_out_of_core_scope_tasks() {
        assert!(matches!(classify("transcode"), TaskKind::OutOfCoreScope(_)));
        assert!(matches!(classify("embed"), TaskKind::OutOfCoreScope(_)));
    }

    #[test]
    fn classify_rejects_truly_unknown_tasks() {
        assert!(matches!(classify("not-a-real-task"), TaskKind::Unknown(_)));
    }

    #[test]
    fn progress_model_matches_spec_table() {
        assert_eq!(progress_model(&TaskKind::Metadata), ProgressModel::Atomic);
        assert_eq!(progress_model(&TaskKind::Thumbnail), ProgressModel::Atomic);
        assert_eq!(progress_model(&TaskKind::Preview), ProgressModel::Graded);
        assert_eq!(progress_model(&TaskKind::Faces), ProgressModel::Graded);
    }
}
