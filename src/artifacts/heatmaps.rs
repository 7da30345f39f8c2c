//! 4.4.7 Heatmaps — sampled brightness series, fast ffmpeg path with a
//! per-sample seek-and-grab fallback, plus an optional PNG visualization
//! (spec §4.4.7).

use std::path::Path;

use image::{Rgb, RgbImage};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use serde_json::{json, Value};

use crate::domain::artifact::ArtifactKind;
use crate::error::Result;
use crate::paths;
use crate::process::args::thread_flags;

use super::metadata::probe_duration_seconds;
use super::{atomic_write, atomic_write_json, GeneratorContext};

#[derive(serde::Deserialize)]
#[serde(default)]
pub struct HeatmapParams {
    pub interval: f64,
    pub render_png: bool,
}

impl Default for HeatmapParams {
    fn default() -> Self {
        Self {
            interval: 5.0,
            render_png: true,
        }
    }
}

#[derive(Serialize)]
struct Sample {
    t: f64,
    v: f64,
}

#[derive(Serialize)]
struct HeatmapDoc {
    interval: f64,
    samples: Vec<Sample>,
}

static YAVG_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"YAVG:(?P<v>[0-9]+(\.[0-9]+)?)").expect("valid regex"));

pub fn generate(ctx: &GeneratorContext, video: &Path, params: HeatmapParams) -> Result<Value> {
    let dest = paths::artifact_path(&ctx.config, video, ArtifactKind::Heatmaps);
    if !ctx.force && dest.exists() {
        ctx.report_progress(1, 1);
        return Ok(json!({"status": "cached"}));
    }

    ctx.check_canceled()?;
    let samples = fast_path(ctx, video, params.interval)
        .or_else(|_| fallback_path(ctx, video, params.interval))?;

    let doc = HeatmapDoc { interval: params.interval, samples };
    atomic_write_json(&dest, &doc)?;

    if params.render_png {
        let png_dest = paths::artifact_path(&ctx.config, video, ArtifactKind::HeatmapPng);
        if let Ok(bytes) = render_bar_chart(&doc.samples) {
            atomic_write(&png_dest, &bytes)?;
        }
    }

    ctx.report_progress(1, 1);
    Ok(json!({"status": "ok", "samples": doc.samples.len()}))
}

fn fast_path(ctx: &GeneratorContext, video: &Path, interval: f64) -> Result<Vec<Sample>> {
    let mut args = vec![
        "-i".to_string(),
        video.to_string_lossy().into_owned(),
        "-vf".to_string(),
        format!("fps=1/{interval},scale=160:-1,signalstats,metadata=print"),
        "-f".to_string(),
        "null".to_string(),
        "-".to_string(),
    ];
    args.extend(thread_flags(&ctx.config));
    let out = ctx.run_ffmpeg(args);
    let combined = match out {
        Ok(o) => format!("{}{}", o.stdout_string(), o.stderr_string()),
        Err(crate::error::Error::NonzeroExit { stderr, .. }) => stderr,
        Err(e) => return Err(e),
    };
    let re = &*YAVG_RE;
    let values: Vec<f64> = re
        .captures_iter(&combined)
        .filter_map(|c| c.name("v").and_then(|m| m.as_str().parse::<f64>().ok()))
        .collect();
    if values.is_empty() {
        return Err(crate::error::Error::Other(anyhow::anyhow!(
            "no YAVG samples parsed"
        )));
    }
    Ok(values
        .into_iter()
        .enumerate()
        .map(|(i, v)| Sample {
            t: i as f64 * interval,
            v: (v / 255.0).clamp(0.0, 1.0),
        })
        .collect())
}

fn fallback_path(ctx: &GeneratorContext, video: &Path, interval: f64) -> Result<Vec<Sample>> {
    let duration = probe_duration_seconds(ctx, video).unwrap_or(0.0).max(interval);
    let count = (duration / interval).ceil() as u32;
    let mut samples = Vec::with_capacity(count as usize);
    for i in 0..count {
        ctx.check_canceled()?;
        let t = i as f64 * interval;
        let mean = mean_luminance_at(ctx, video, t).unwrap_or(0.0);
        samples.push(Sample { t, v: mean });
    }
    Ok(samples)
}

fn mean_luminance_at(ctx: &GeneratorContext, video: &Path, t: f64) -> Result<f64> {
    let mut args = vec![
        "-y".to_string(),
        "-ss".to_string(),
        format!("{t:.3}"),
        "-i".to_string(),
        video.to_string_lossy().into_owned(),
        "-frames:v".to_string(),
        "1".to_string(),
        "-vf".to_string(),
        "scale=160:-1,format=gray".to_string(),
        "-f".to_string(),
        "rawvideo".to_string(),
        "pipe:1".to_string(),
    ];
    args.extend(thread_flags(&ctx.config));
    let out = ctx.run_ffmpeg(args)?;
    if out.stdout.is_empty() {
        return Ok(0.0);
    }
    let sum: u64 = out.stdout.iter().map(|&b| b as u64).sum();
    Ok((sum as f64 / out.stdout.len() as f64 / 255.0).clamp(0.0, 1.0))
}

fn render_bar_chart(samples: &[Sample]) -> Result<Vec<u8>> {
    let width = (samples.len().max(1) * 4) as u32;
    let height = 120u32;
    let mut img = RgbImage::new(width, height);
    for (i, s) in samples.iter().enumerate() {
        let bar_height = (s.v.clamp(0.0, 1.0) * height as f64) as u32;
        for y in (height - bar_height)..height {
            for x in 0..4u32 {
                let px = (i as u32) * 4 + x;
                if px < width {
                    img.put_pixel(px, y, Rgb([60, 140, 220]));
                }
            }
        }
    }
    let mut bytes = Vec::new();
    img.write_to(&mut std::io::Cursor::new(&mut bytes), image::ImageFormat::Png)
        .map_err(|e| crate::error::Error::Other(anyhow::anyhow!("heatmap png encode failed: {e}")))?;
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn yavg_regex_extracts_values() {
        let text = "lavfi.signalstats.YAVG:128.5 lavfi.signalstats.YAVG:64.0";
        let re = &*YAVG_RE;
        let values: Vec<f64> = re
            .captures_iter(text)
            .filter_map(|c| c.name("v").and_then(|m| m.as_str().parse::<f64>().ok()))
            .collect();
        assert_eq!(values, vec![128.5, 64.0]);
    }

    #[test]
    fn render_bar_chart_produces_nonempty_png() {
        let samples = vec![Sample { t: 0.0, v: 0.5 }, Sample { t: 5.0, v: 1.0 }];
        let bytes = render_bar_chart(&samples).unwrap();
        assert!(bytes.len() > 64);
        assert_eq!(&bytes[1..4], b"PNG");
    }
}
