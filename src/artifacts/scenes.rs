//! 4.4.6 Scenes / Markers — cut detection via ffmpeg `showinfo`, plus the
//! manual marker set/update/delete surface sharing the same on-disk
//! document (spec §4.4.6).

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Value};

use crate::domain::artifact::ArtifactKind;
use crate::domain::scene::{Marker, ScenesDocument};
use crate::error::Result;
use crate::paths;
use crate::process::args::thread_flags;
use crate::process::progress::elapsed_to_percent;
use crate::process::ProgressCallback;

use super::metadata::probe_duration_seconds;
use super::{atomic_write_json, GeneratorContext};

/// Scan progress is capped below 100 while `with_thumbnails` still has work
/// to do, so the thumbnail loop below has room to advance without the bar
/// regressing.
const SCAN_SHARE_WITH_THUMBNAILS: f64 = 90.0;

#[derive(serde::Deserialize)]
#[serde(default)]
pub struct ScenesParams {
    pub threshold: f64,
    pub min_gap_secs: f64,
    pub with_thumbnails: bool,
}

impl Default for ScenesParams {
    fn default() -> Self {
        Self {
            threshold: 0.3,
            min_gap_secs: 0.25,
            with_thumbnails: false,
        }
    }
}

static PTS_TIME_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"pts_time:(?P<t>[0-9]+(\.[0-9]+)?)").expect("valid regex"));

pub fn generate(ctx: &GeneratorContext, video: &Path, params: ScenesParams) -> Result<Value> {
    let dest = paths::artifact_path(&ctx.config, video, ArtifactKind::Scenes);
    if !ctx.force && dest.exists() {
        ctx.report_progress(1, 1);
        return Ok(json!({"status": "cached"}));
    }

    // Pre-start heartbeat while waiting for an ffmpeg slot, capped low so
    // observers see liveness without implying real progress.
    let heartbeat_cap = ctx.config.scenes_heartbeat_cap_percent.clamp(0.0, 100.0) as u64;
    ctx.report_progress(heartbeat_cap.min(3), 100);

    ctx.check_canceled()?;
    let duration = probe_duration_seconds(ctx, video).ok();
    let scan_share = if params.with_thumbnails { SCAN_SHARE_WITH_THUMBNAILS } else { 100.0 };
    let times = detect_cuts(ctx, video, params.threshold, duration, scan_share)?;

    let mut doc = load_existing(&dest);
    let mut detected: Vec<Marker> = times
        .iter()
        .enumerate()
        .map(|(i, &t)| Marker {
            time: t,
            scene: true,
            marker_type: None,
            label: None,
            name: Some((i + 1).to_string()),
            intro: false,
            outro: false,
        })
        .collect();
    // Preserve manual (non-scene) markers already present; replace detected ones.
    let manual: Vec<Marker> = doc.scenes.iter().filter(|m| !m.scene).cloned().collect();
    detected.extend(manual);
    doc.scenes = detected;
    doc.dedupe_close_timestamps(params.min_gap_secs);

    ctx.report_progress(scan_share.round() as u64, 100);
    atomic_write_json(&dest, &doc)?;

    if params.with_thumbnails {
        generate_scene_thumbnails(ctx, video, &doc, scan_share)?;
    } else {
        ctx.report_progress(100, 100);
    }

    Ok(json!({"status": "ok", "scenes": doc.scenes.len()}))
}

fn load_existing(dest: &Path) -> ScenesDocument {
    std::fs::read(dest)
        .ok()
        .and_then(|b| serde_json::from_slice(&b).ok())
        .unwrap_or_default()
}

/// Runs the cut-detection pass, reporting fractional timeline position
/// (0..`scan_share`) as ffmpeg's `-progress` stream advances (spec §4.4.6).
fn detect_cuts(
    ctx: &GeneratorContext,
    video: &Path,
    threshold: f64,
    duration: Option<f64>,
    scan_share: f64,
) -> Result<Vec<f64>> {
    let mut args = vec![
        "-i".to_string(),
        video.to_string_lossy().into_owned(),
        "-filter_complex".to_string(),
        format!("select='gt(scene,{threshold})',showinfo"),
        "-f".to_string(),
        "null".to_string(),
        "-".to_string(),
    ];
    args.extend(thread_flags(&ctx.config));

    let report = ctx.report.clone();
    let on_progress: ProgressCallback = Arc::new(move |sample| {
        if let Some(elapsed) = sample.out_time_seconds {
            let pct = elapsed_to_percent(duration, elapsed) * scan_share / 100.0;
            report(pct.round() as u64, 100);
        }
    });
    // No dedicated scan watchdog threshold exists in config; the flat
    // per-command ffmpeg_timelimit (applied by run_ffmpeg_watchdog the same
    // way run_ffmpeg applies it) is this pass's only hang protection.
    let out = ctx.run_ffmpeg_watchdog(args, Duration::ZERO, Duration::ZERO, on_progress);
    // ffmpeg with `-f null -` reports showinfo on stderr; we rely on
    // stderr even when the overall invocation exits nonzero (e.g. a source
    // with no matching cuts still produces a zero-cut exit 0, but a
    // genuinely broken source should surface the underlying error).
    let stderr = match out {
        Ok(o) => o.stderr_string(),
        Err(crate::error::Error::NonzeroExit { stderr, .. }) => stderr,
        Err(e) => return Err(e),
    };
    let re = &*PTS_TIME_RE;
    let mut times: Vec<f64> = re
        .captures_iter(&stderr)
        .filter_map(|c| c.name("t").and_then(|m| m.as_str().parse::<f64>().ok()))
        .collect();
    times.sort_by(|a, b| a.partial_cmp(b).unwrap());
    Ok(times)
}

/// Extracts one thumbnail per detected scene, advancing `report_progress`
/// from `scan_share` up to 100 as each thumbnail is emitted (spec §4.4.6).
fn generate_scene_thumbnails(ctx: &GeneratorContext, video: &Path, doc: &ScenesDocument, scan_share: f64) -> Result<()> {
    let scenes: Vec<_> = doc.scenes.iter().filter(|m| m.scene).collect();
    let total = scenes.len();
    for (i, marker) in scenes.into_iter().enumerate() {
        ctx.check_canceled()?;
        let dest = paths::scene_thumbnail_path(&ctx.config, video, i + 1);
        let mut args = vec![
            "-y".to_string(),
            "-ss".to_string(),
            format!("{:.3}", marker.time),
            "-i".to_string(),
            video.to_string_lossy().into_owned(),
            "-frames:v".to_string(),
            "1".to_string(),
            "-q:v".to_string(),
            ctx.config.scene_thumb_quality.to_string(),
            "-f".to_string(),
            "image2".to_string(),
            "pipe:1".to_string(),
        ];
        args.extend(thread_flags(&ctx.config));
        if let Ok(out) = ctx.run_ffmpeg(args) {
            if out.stdout.len() > 64 {
                super::atomic_write(&dest, &out.stdout)?;
            }
        }
        let remaining = 100.0 - scan_share;
        let pct = scan_share + remaining * (i + 1) as f64 / total.max(1) as f64;
        ctx.report_progress(pct.round() as u64, 100);
    }
    Ok(())
}

/// Sets (or clears) a user marker, sharing the storage document with
/// detection output. `marker_type`/`label` apply only when creating a new
/// non-scene marker at `time`.
pub fn set_manual_marker(
    ctx: &GeneratorContext,
    video: &Path,
    time: f64,
    marker_type: Option<String>,
    label: Option<String>,
) -> Result<ScenesDocument> {
    let dest = paths::artifact_path(&ctx.config, video, ArtifactKind::Scenes);
    let mut doc = load_existing(&dest);
    let exists = doc.scenes.iter().any(|m| (m.time - time).abs() < f64::EPSILON);
    if !exists {
        doc.scenes.push(Marker {
            time,
            scene: false,
            marker_type,
            label,
            name: None,
            intro: false,
            outro: false,
        });
    }
    atomic_write_json(&dest, &doc)?;
    Ok(doc)
}

pub fn set_intro_outro(ctx: &GeneratorContext, video: &Path, time: f64, is_intro: bool) -> Result<ScenesDocument> {
    let dest = paths::artifact_path(&ctx.config, video, ArtifactKind::Scenes);
    let mut doc = load_existing(&dest);
    doc.set_exclusive_flag(time, is_intro);
    atomic_write_json(&dest, &doc)?;
    Ok(doc)
}

pub fn delete_marker(ctx: &GeneratorContext, video: &Path, time: f64) -> Result<ScenesDocument> {
    let dest = paths::artifact_path(&ctx.config, video, ArtifactKind::Scenes);
    let mut doc = load_existing(&dest);
    doc.scenes.retain(|m| (m.time - time).abs() >= f64::EPSILON);
    atomic_write_json(&dest, &doc)?;
    Ok(doc)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pts_time_regex_extracts_multiple_timestamps() {
        let stderr = "frame:1 pts_time:10.04 foo\nframe:2 pts_time:20.1 bar\n";
        let re = &*PTS_TIME_RE;
        let times: Vec<f64> = re
            .captures_iter(stderr)
            .filter_map(|c| c.name("t").and_then(|m| m.as_str().parse::<f64>().ok()))
            .collect();
        assert_eq!(times, vec![10.04, 20.1]);
    }
}
