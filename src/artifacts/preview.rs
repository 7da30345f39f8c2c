//! 4.4.3 Preview — short rolling clip assembled from evenly sampled
//! segments, three-strategy fallback chain (spec §4.4.3).

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tempfile::TempDir;

use crate::domain::artifact::{artifact_present, ArtifactKind};
use crate::error::{Error, Result};
use crate::paths;
use crate::process::args::{hwaccel_flags, thread_flags};
use crate::process::progress::elapsed_to_percent;
use crate::process::ProgressCallback;

use super::metadata::probe_duration_seconds;
use super::{atomic_write, atomic_write_json, GeneratorContext};

#[derive(serde::Deserialize)]
#[serde(default)]
pub struct PreviewParams {
    pub segments: u32,
    pub seg_dur: f64,
    pub width: u32,
    pub webm: bool,
}

impl Default for PreviewParams {
    fn default() -> Self {
        Self {
            segments: 9,
            seg_dur: 0.8,
            width: 240,
            webm: true,
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
struct PreviewInfo {
    status: &'static str,
    strategy: &'static str,
    segments_planned: u32,
    segments_used: u32,
    points: Vec<f64>,
}

pub fn generate(ctx: &GeneratorContext, video: &Path, params: PreviewParams) -> Result<Value> {
    let kind = ArtifactKind::Preview { webm: params.webm };
    let dest = paths::artifact_path(&ctx.config, video, kind);
    let info_dest = paths::artifact_path(&ctx.config, video, ArtifactKind::PreviewInfo);
    if !ctx.force && artifact_present(kind, &dest) {
        ctx.report_progress(params.segments as u64, params.segments as u64);
        return Ok(json!({"status": "cached"}));
    }

    ctx.check_canceled()?;
    let duration = probe_duration_seconds(ctx, video).unwrap_or(0.0);
    let points = sample_points(duration, params.segments, params.seg_dur, ctx.config.preview_min_gap_frac);

    let result = single_pass(ctx, video, &points, &params)
        .or_else(|_| multi_segment(ctx, video, &points, &params))
        .or_else(|_| direct_fallback(ctx, video, duration, &params));

    let (bytes, info) = result?;
    if bytes.len() <= 64 {
        return Err(Error::Other(anyhow::anyhow!(
            "preview generation produced an empty clip"
        )));
    }
    atomic_write(&dest, &bytes)?;
    atomic_write_json(&info_dest, &info)?;
    ctx.report_progress(info.segments_used as u64, params.segments as u64);
    Ok(json!(info))
}

/// Evenly spaced sample start times across `[0, duration]`, spaced at least
/// `seg_dur * min_gap_frac` apart.
fn sample_points(duration: f64, segments: u32, seg_dur: f64, min_gap_frac: f64) -> Vec<f64> {
    if duration <= 0.0 || segments == 0 {
        return Vec::new();
    }
    let usable = (duration - seg_dur).max(0.0);
    let min_gap = seg_dur * min_gap_frac;
    let mut points = Vec::with_capacity(segments as usize);
    for i in 0..segments {
        let frac = if segments == 1 {
            0.0
        } else {
            i as f64 / (segments - 1) as f64
        };
        let mut t = frac * usable;
        if let Some(&last) = points.last() {
            let last: f64 = last;
            if t - last < min_gap {
                t = last + min_gap;
            }
        }
        points.push(t.min(usable.max(0.0)));
    }
    points
}

fn codec_args(params: &PreviewParams, ctx: &GeneratorContext) -> Vec<String> {
    if params.webm {
        vec![
            "-c:v".into(),
            "libvpx-vp9".into(),
            "-crf".into(),
            ctx.config.preview_crf_vp9.to_string(),
            "-b:v".into(),
            "0".into(),
            "-an".into(),
        ]
    } else {
        vec![
            "-c:v".into(),
            "libx264".into(),
            "-crf".into(),
            ctx.config.preview_crf_h264.to_string(),
            "-pix_fmt".into(),
            "yuv420p".into(),
            "-an".into(),
        ]
    }
}

/// Strategy 1: one ffmpeg invocation using a `split/trim/concat` filter
/// graph. Progress is parsed off the `-progress pipe:2` stream and mapped
/// onto the expected output duration (`seg_dur * segments`); a stall
/// watchdog kills the process if no progress token arrives for
/// `preview_progress_kill_secs`, warning first at `preview_progress_watchdog_secs`
/// (spec §4.4.3 strategy 1, §9 "Progress reporting from ffmpeg").
fn single_pass(
    ctx: &GeneratorContext,
    video: &Path,
    points: &[f64],
    params: &PreviewParams,
) -> Result<(Vec<u8>, PreviewInfo)> {
    if !ctx.config.preview_single_pass || points.is_empty() {
        return Err(Error::Other(anyhow::anyhow!("single-pass disabled")));
    }
    ctx.check_canceled()?;

    let n = points.len();
    let mut filter = String::from("[0:v]split=");
    filter.push_str(&n.to_string());
    for i in 0..n {
        filter.push_str(&format!("[s{i}]"));
    }
    filter.push(';');
    for (i, &t) in points.iter().enumerate() {
        filter.push_str(&format!(
            "[s{i}]trim=start={t:.3}:duration={dur:.3},setpts=PTS-STARTPTS[c{i}];",
            dur = params.seg_dur
        ));
    }
    for i in 0..n {
        filter.push_str(&format!("[c{i}]"));
    }
    filter.push_str(&format!("concat=n={n}:v=1:a=0[outv];"));
    filter.push_str(&format!(
        "[outv]scale={w}:-2:force_original_aspect_ratio=decrease,scale=trunc(iw/2)*2:trunc(ih/2)*2[vout]",
        w = params.width
    ));

    let mut args = vec!["-y".to_string()];
    args.extend(hwaccel_flags(&ctx.config));
    args.push("-i".to_string());
    args.push(video.to_string_lossy().into_owned());
    args.extend(thread_flags(&ctx.config));
    args.push("-filter_complex".to_string());
    args.push(filter);
    args.push("-map".to_string());
    args.push("[vout]".to_string());
    args.extend(codec_args(params, ctx));
    args.push("-f".to_string());
    args.push(if params.webm { "webm".to_string() } else { "mp4".to_string() });
    args.push("pipe:1".to_string());

    let total_dur = params.seg_dur * n as f64;
    let report = ctx.report.clone();
    let on_progress: ProgressCallback = Arc::new(move |sample| {
        if let Some(elapsed) = sample.out_time_seconds {
            let pct = elapsed_to_percent(Some(total_dur), elapsed);
            report(pct.round() as u64, 100);
        }
    });
    let out = ctx.run_ffmpeg_watchdog(
        args,
        Duration::from_secs(ctx.config.preview_progress_watchdog_secs),
        Duration::from_secs(ctx.config.preview_progress_kill_secs),
        on_progress,
    )?;
    Ok((
        out.stdout,
        PreviewInfo {
            status: "ok",
            strategy: if params.webm { "single-pass-webm" } else { "single-pass-mp4" },
            segments_planned: params.segments,
            segments_used: n as u32,
            points: points.to_vec(),
        },
    ))
}

/// Strategy 2: extract each segment to a temp file, then concat via a
/// multi-input filter. Individual segment failures are tolerated as long as
/// at least one segment succeeds (spec §4.4.3).
fn multi_segment(
    ctx: &GeneratorContext,
    video: &Path,
    points: &[f64],
    params: &PreviewParams,
) -> Result<(Vec<u8>, PreviewInfo)> {
    if points.is_empty() {
        return Err(Error::Other(anyhow::anyhow!("no sample points")));
    }
    let tmp = TempDir::new().map_err(Error::Io)?;
    let mut segment_files = Vec::new();

    for (i, &t) in points.iter().enumerate() {
        ctx.check_canceled()?;
        let seg_path = tmp.path().join(format!("seg_{i:03}.nut"));
        let mut args = vec![
            "-y".to_string(),
            "-ss".to_string(),
            format!("{t:.3}"),
            "-i".to_string(),
            video.to_string_lossy().into_owned(),
            "-t".to_string(),
            params.seg_dur.to_string(),
        ];
        args.extend(thread_flags(&ctx.config));
        args.push("-vf".to_string());
        args.push(format!(
            "scale={w}:-2:force_original_aspect_ratio=decrease,scale=trunc(iw/2)*2:trunc(ih/2)*2",
            w = params.width
        ));
        args.push("-an".to_string());
        args.push(seg_path.to_string_lossy().into_owned());
        if ctx.run_ffmpeg(args).is_ok() && seg_path.exists() {
            segment_files.push(seg_path);
        }
    }

    if segment_files.is_empty() {
        return Err(Error::Other(anyhow::anyhow!("all segments failed")));
    }

    let mut args = vec!["-y".to_string()];
    for f in &segment_files {
        args.push("-i".to_string());
        args.push(f.to_string_lossy().into_owned());
    }
    let n = segment_files.len();
    let mut filter = String::new();
    for i in 0..n {
        filter.push_str(&format!("[{i}:v]"));
    }
    filter.push_str(&format!("concat=n={n}:v=1:a=0[outv]"));
    args.push("-filter_complex".to_string());
    args.push(filter);
    args.push("-map".to_string());
    args.push("[outv]".to_string());
    args.extend(codec_args(params, ctx));
    args.push("-f".to_string());
    args.push(if params.webm { "webm".to_string() } else { "mp4".to_string() });
    args.push("pipe:1".to_string());

    let out = ctx.run_ffmpeg(args)?;
    Ok((
        out.stdout,
        PreviewInfo {
            status: "ok",
            strategy: "multi-segment",
            segments_planned: params.segments,
            segments_used: n as u32,
            points: points.to_vec(),
        },
    ))
}

/// Strategy 3: encode a single clip from the source at 0s (or 10% in when
/// the source is long enough), used when no segments are producible at all
/// (e.g. a source shorter than one segment duration).
fn direct_fallback(
    ctx: &GeneratorContext,
    video: &Path,
    duration: f64,
    params: &PreviewParams,
) -> Result<(Vec<u8>, PreviewInfo)> {
    ctx.check_canceled()?;
    let start = if duration > 0.0 { duration * 0.1 } else { 0.0 };
    let mut args = vec![
        "-y".to_string(),
        "-ss".to_string(),
        format!("{start:.3}"),
        "-i".to_string(),
        video.to_string_lossy().into_owned(),
        "-t".to_string(),
        params.seg_dur.to_string(),
    ];
    args.extend(thread_flags(&ctx.config));
    args.push("-vf".to_string());
    args.push(format!(
        "scale={w}:-2:force_original_aspect_ratio=decrease,scale=trunc(iw/2)*2:trunc(ih/2)*2",
        w = params.width
    ));
    args.extend(codec_args(params, ctx));
    args.push("-f".to_string());
    args.push(if params.webm { "webm".to_string() } else { "mp4".to_string() });
    args.push("pipe:1".to_string());

    let out = ctx.run_ffmpeg(args)?;
    Ok((
        out.stdout,
        PreviewInfo {
            status: "ok",
            strategy: "direct",
            segments_planned: params.segments,
            segments_used: 1,
            points: vec![start],
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_points_respects_minimum_gap() {
        let points = sample_points(30.0, 9, 0.8, 0.25);
        assert_eq!(points.len(), 9);
        for w in points.windows(2) {
            assert!(w[1] - w[0] >= 0.8 * 0.25 - 1e-9);
        }
    }

    #[test]
    fn sample_points_handles_short_source() {
        let points = sample_points(0.5, 9, 0.8, 0.25);
        assert_eq!(points.len(), 9);
        assert!(points.iter().all(|&t| t >= 0.0));
    }

    #[test]
    fn sample_points_empty_for_zero_duration() {
        assert!(sample_points(0.0, 9, 0.8, 0.25).is_empty());
    }
}
