//! 4.4.9 Subtitles — STT backend auto-detection chain, falling through to
//! a deterministic stub transcript so the artifact is always present
//! (spec §4.4.9).

use std::path::Path;

use serde_json::{json, Value};

use crate::domain::artifact::{artifact_present, subtitle_stub_sentinel, ArtifactKind};
use crate::error::Result;
use crate::paths;

use super::metadata::probe_duration_seconds;
use super::{atomic_write, GeneratorContext};

struct Segment {
    start: f64,
    end: f64,
    text: String,
}

pub fn generate(ctx: &GeneratorContext, video: &Path) -> Result<Value> {
    let dest = paths::artifact_path(&ctx.config, video, ArtifactKind::Subtitles);
    if !ctx.force && artifact_present(ArtifactKind::Subtitles, &dest) {
        ctx.report_progress(1, 1);
        return Ok(json!({"status": "cached"}));
    }

    ctx.check_canceled()?;
    let (segments, backend) = run_backend_chain(ctx, video)?;
    let srt = render_srt(&segments);
    atomic_write(&dest, srt.as_bytes())?;
    ctx.report_progress(1, 1);
    Ok(json!({"status": "ok", "backend": backend, "segments": segments.len()}))
}

/// `faster-whisper -> whisper -> whisper.cpp binary -> stub`, in that order.
/// Only `whisper.cpp` is modeled as an external process here (the others
/// would be Python-process backends in the original; this port treats any
/// backend beyond whisper.cpp as unavailable and falls through).
fn run_backend_chain(ctx: &GeneratorContext, video: &Path) -> Result<(Vec<Segment>, &'static str)> {
    if let Some(bin) = whisper_cpp_available(ctx) {
        if let Ok(segments) = run_whisper_cpp(ctx, video, &bin) {
            if !segments.is_empty() {
                return Ok((segments, "whisper.cpp"));
            }
        }
    }
    Ok((stub_segments(ctx, video), "stub"))
}

fn whisper_cpp_available(ctx: &GeneratorContext) -> Option<String> {
    let bin = ctx.config.whisper_cpp_bin.as_ref()?;
    let model = ctx.config.whisper_cpp_model.as_ref()?;
    if Path::new(bin).exists() && Path::new(model).exists() {
        Some(bin.clone())
    } else {
        None
    }
}

fn run_whisper_cpp(ctx: &GeneratorContext, video: &Path, bin: &str) -> Result<Vec<Segment>> {
    let model = ctx
        .config
        .whisper_cpp_model
        .clone()
        .ok_or_else(|| crate::error::Error::DependencyMissing("whisper.cpp model".into()))?;
    let argv = vec![
        bin.to_string(),
        "-m".to_string(),
        model,
        "-f".to_string(),
        video.to_string_lossy().into_owned(),
        "-osrt".to_string(),
    ];
    let out = ctx
        .runner
        .run(&ctx.job_id, &argv, &ctx.cancel, Some(ctx.config.ffmpeg_timelimit))?;
    parse_srt(&out.stdout_string())
}

fn parse_srt(text: &str) -> Result<Vec<Segment>> {
    let mut segments = Vec::new();
    let mut lines = text.lines().peekable();
    while let Some(line) = lines.next() {
        if !line.trim().chars().all(|c| c.is_ascii_digit()) || line.trim().is_empty() {
            continue;
        }
        let Some(time_line) = lines.next() else { break };
        let Some((start_str, end_str)) = time_line.split_once("-->") else { continue };
        let Some(start) = parse_timestamp(start_str.trim()) else { continue };
        let Some(end) = parse_timestamp(end_str.trim()) else { continue };
        let mut text_lines = Vec::new();
        while let Some(next) = lines.peek() {
            if next.trim().is_empty() {
                lines.next();
                break;
            }
            text_lines.push(lines.next().unwrap().to_string());
        }
        segments.push(Segment { start, end, text: text_lines.join(" ") });
    }
    Ok(segments)
}

fn parse_timestamp(s: &str) -> Option<f64> {
    let (hms, ms) = s.split_once(',')?;
    let parts: Vec<&str> = hms.split(':').collect();
    if parts.len() != 3 {
        return None;
    }
    let h: f64 = parts[0].parse().ok()?;
    let m: f64 = parts[1].parse().ok()?;
    let sec: f64 = parts[2].parse().ok()?;
    let ms: f64 = ms.parse().ok()?;
    Some(h * 3600.0 + m * 60.0 + sec + ms / 1000.0)
}

/// Deterministic 2-segment placeholder, spanning the source's duration,
/// carrying the sentinel phrase so stub detection (spec §3.3) recognizes it.
fn stub_segments(ctx: &GeneratorContext, video: &Path) -> Vec<Segment> {
    let duration = probe_duration_seconds(ctx, video).unwrap_or(0.0).max(2.0);
    let mid = duration / 2.0;
    vec![
        Segment {
            start: 0.0,
            end: mid,
            text: subtitle_stub_sentinel().to_string(),
        },
        Segment {
            start: mid,
            end: duration,
            text: subtitle_stub_sentinel().to_string(),
        },
    ]
}

fn render_srt(segments: &[Segment]) -> String {
    let mut out = String::new();
    for (i, seg) in segments.iter().enumerate() {
        out.push_str(&format!("{}\n", i + 1));
        out.push_str(&format!(
            "{} --> {}\n",
            format_timestamp(seg.start),
            format_timestamp(seg.end)
        ));
        out.push_str(&seg.text);
        out.push_str("\n\n");
    }
    out
}

fn format_timestamp(t: f64) -> String {
    let total_ms = (t.max(0.0) * 1000.0).round() as u64;
    let h = total_ms / 3_600_000;
    let m = (total_ms % 3_600_000) / 60_000;
    let s = (total_ms % 60_000) / 1000;
    let ms = total_ms % 1000;
    format!("{h:02}:{m:02}:{s:02},{ms:03}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_timestamp_matches_srt_convention() {
        assert_eq!(format_timestamp(3661.5), "01:01:01,500");
        assert_eq!(format_timestamp(0.0), "00:00:00,000");
    }

    #[test]
    fn render_srt_produces_numbered_blocks() {
        let segments = vec![
            Segment { start: 0.0, end: 1.0, text: "hello".into() },
            Segment { start: 1.0, end: 2.0, text: "world".into() },
        ];
        let srt = render_srt(&segments);
        assert!(srt.starts_with('1'));
        assert!(srt.contains("-->"));
        assert!(srt.contains("hello"));
    }

    #[test]
    fn parse_timestamp_round_trips_format_timestamp() {
        let formatted = format_timestamp(125.25);
        assert_eq!(parse_timestamp(&formatted), Some(125.25));
    }
}
