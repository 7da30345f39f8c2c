//! Library-wide maintenance tasks (spec §4.7 "integrity-scan",
//! "cleanup-artifacts"). Both walk the whole artifact tree rather than a
//! single video's directory, so they're driven straight from
//! [`paths::classify_artifact_filename`] — the one place that already knows
//! how to turn a filename back into `(stem, kind)` without re-deriving
//! suffix rules.

use std::collections::HashSet;
use std::path::PathBuf;

use serde_json::{json, Value};
use walkdir::WalkDir;

use crate::artifacts::source_mtime_secs;
use crate::domain::artifact::{artifact_present, ArtifactKind};
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::paths;

use super::targets;

const NAMED_KINDS: &[(&str, ArtifactKind)] = &[
    ("metadata", ArtifactKind::Metadata),
    ("thumbnail", ArtifactKind::Thumbnail),
    ("preview_info", ArtifactKind::PreviewInfo),
    ("sprites_sheet", ArtifactKind::SpritesSheet),
    ("sprites_index", ArtifactKind::SpritesIndex),
    ("phash", ArtifactKind::Phash),
    ("markers", ArtifactKind::Scenes),
    ("heatmaps", ArtifactKind::Heatmaps),
    ("heatmap_png", ArtifactKind::HeatmapPng),
    ("waveform", ArtifactKind::Waveform),
    ("motion", ArtifactKind::Motion),
    ("subtitles", ArtifactKind::Subtitles),
    ("faces", ArtifactKind::Faces),
];

fn preview_presence(engine: &Engine, video: &std::path::Path) -> (bool, Option<PathBuf>) {
    let mp4 = paths::artifact_path(&engine.config, video, ArtifactKind::Preview { webm: false });
    let webm = paths::artifact_path(&engine.config, video, ArtifactKind::Preview { webm: true });
    if artifact_present(ArtifactKind::Preview { webm: false }, &mp4) {
        (true, Some(mp4))
    } else if artifact_present(ArtifactKind::Preview { webm: true }, &webm) {
        (true, Some(webm))
    } else {
        (false, None)
    }
}

fn per_video_report(engine: &Engine, video: &std::path::Path) -> Value {
    let mut missing = Vec::new();
    let mut stale = Vec::new();
    let video_mtime = source_mtime_secs(video);

    for (name, kind) in NAMED_KINDS {
        let path = paths::artifact_path(&engine.config, video, *kind);
        if !artifact_present(*kind, &path) {
            missing.push(*name);
            continue;
        }
        if let (Some(vm), Some(am)) = (video_mtime, source_mtime_secs(&path)) {
            if vm > am {
                stale.push(*name);
            }
        }
    }

    let (preview_present, preview_path) = preview_presence(engine, video);
    if !preview_present {
        missing.push("preview");
    } else if let (Some(vm), Some(am)) = (video_mtime, preview_path.as_deref().and_then(source_mtime_secs)) {
        if vm > am {
            stale.push("preview");
        }
    }

    json!({
        "path": super::relative_display(&engine.config, video),
        "missing": missing,
        "stale": stale,
    })
}

/// Every artifact file on disk whose parsed stem has no corresponding
/// source video left in the library (spec §4.7 "orphaned artifacts").
fn find_orphans(engine: &Engine) -> Vec<PathBuf> {
    let known_stems: HashSet<String> = targets::list_videos(&engine.config, &engine.config.media_root, true)
        .iter()
        .map(|v| paths::video_stem(v))
        .collect();

    let artifacts_root = engine.config.media_root.join(".artifacts");
    if !artifacts_root.is_dir() {
        return Vec::new();
    }

    WalkDir::new(&artifacts_root)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| {
            let file_name = e.file_name().to_str()?.to_string();
            let (stem, _kind) = paths::classify_artifact_filename(&file_name)?;
            if known_stems.contains(&stem) {
                None
            } else {
                Some(e.into_path())
            }
        })
        .collect()
}

pub fn run_scan(engine: &Engine, job_id: &str, cancel: &crate::cancel::CancelToken) -> Result<Value> {
    let job = engine.registry.get(job_id).ok_or_else(|| Error::NotFound(job_id.to_string()))?;
    let mut request = job.request.clone();
    if request.targets().is_none() {
        request.recursive = true;
    }
    let videos = targets::resolve_targets(&engine.config, &request);
    engine.registry.set_progress(job_id, Some(videos.len() as u64), None, Some(0));

    let mut reports = Vec::with_capacity(videos.len());
    for (i, video) in videos.iter().enumerate() {
        if cancel.is_canceled() {
            return Err(Error::Canceled);
        }
        reports.push(per_video_report(engine, video));
        engine.registry.set_progress(job_id, None, None, Some(i as u64 + 1));
    }

    let orphans: Vec<String> = find_orphans(engine)
        .into_iter()
        .map(|p| super::relative_display(&engine.config, &p))
        .collect();

    Ok(json!({
        "status": "done",
        "videos": reports,
        "orphaned_artifacts": orphans,
    }))
}

/// Deletes every orphaned artifact file found by [`find_orphans`]. Honors
/// `params.dry_run` (default `false`) so a caller can preview what would be
/// removed before committing to it.
pub fn run_cleanup(engine: &Engine, job_id: &str) -> Result<Value> {
    let job = engine.registry.get(job_id).ok_or_else(|| Error::NotFound(job_id.to_string()))?;
    let dry_run = job.request.params.get("dry_run").and_then(Value::as_bool).unwrap_or(false);

    let orphans = find_orphans(engine);
    engine.registry.set_progress(job_id, Some(orphans.len().max(1) as u64), None, Some(0));

    let mut removed = Vec::new();
    let mut failed = Vec::new();
    for (i, path) in orphans.iter().enumerate() {
        let relative = super::relative_display(&engine.config, path);
        if dry_run {
            removed.push(relative);
        } else {
            match std::fs::remove_file(path) {
                Ok(()) => removed.push(relative),
                Err(e) => failed.push(json!({"path": relative, "error": e.to_string()})),
            }
        }
        engine.registry.set_progress(job_id, None, None, Some(i as u64 + 1));
    }

    Ok(json!({
        "status": "done",
        "dry_run": dry_run,
        "removed": removed,
        "errors": failed,
    }))
}
