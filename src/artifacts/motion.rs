//! 4.4.8 Motion — per-interval motion-activity scalar series computed from
//! L2-normalized mean absolute pixel difference between consecutive
//! downsampled grayscale frames (spec §4.4.8).

use std::path::Path;

use serde::Serialize;
use serde_json::{json, Value};
use tempfile::TempDir;

use crate::domain::artifact::ArtifactKind;
use crate::error::Result;
use crate::paths;
use crate::process::args::thread_flags;

use super::{atomic_write_json, GeneratorContext};

#[derive(serde::Deserialize)]
#[serde(default)]
pub struct MotionParams {
    pub interval: f64,
    pub width: u32,
}

impl Default for MotionParams {
    fn default() -> Self {
        Self {
            interval: 1.0,
            width: 160,
        }
    }
}

#[derive(Serialize)]
struct Sample {
    t: f64,
    v: f64,
}

#[derive(Serialize)]
struct MotionDoc {
    interval: f64,
    samples: Vec<Sample>,
}

pub fn generate(ctx: &GeneratorContext, video: &Path, params: MotionParams) -> Result<Value> {
    let dest = paths::artifact_path(&ctx.config, video, ArtifactKind::Motion);
    if !ctx.force && dest.exists() {
        ctx.report_progress(1, 1);
        return Ok(json!({"status": "cached"}));
    }

    ctx.check_canceled()?;
    let frames = sample_grayscale_frames(ctx, video, &params)?;
    let samples = motion_samples(&frames, params.interval);
    let doc = MotionDoc { interval: params.interval, samples };
    atomic_write_json(&dest, &doc)?;
    ctx.report_progress(1, 1);
    Ok(json!({"status": "ok", "samples": doc.samples.len()}))
}

fn sample_grayscale_frames(
    ctx: &GeneratorContext,
    video: &Path,
    params: &MotionParams,
) -> Result<Vec<image::GrayImage>> {
    let tmp = TempDir::new().map_err(crate::error::Error::Io)?;
    let pattern = tmp.path().join("m_%04d.png");
    let mut args = vec![
        "-y".to_string(),
        "-i".to_string(),
        video.to_string_lossy().into_owned(),
        "-vf".to_string(),
        format!("fps=1/{},scale={}:-1,format=gray", params.interval, params.width),
    ];
    args.extend(thread_flags(&ctx.config));
    args.push(pattern.to_string_lossy().into_owned());
    ctx.run_ffmpeg(args)?;

    let mut entries: Vec<_> = std::fs::read_dir(tmp.path())?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .collect();
    entries.sort();
    Ok(entries
        .into_iter()
        .filter_map(|p| image::open(&p).ok())
        .map(|img| img.to_luma8())
        .collect())
}

/// Mean absolute pixel difference between consecutive frames, normalized by
/// 255 so values fall in `[0, 1]`. The series has one fewer entry than the
/// frame count (no motion value for the first frame).
fn motion_samples(frames: &[image::GrayImage], interval: f64) -> Vec<Sample> {
    let mut samples = Vec::new();
    for (i, pair) in frames.windows(2).enumerate() {
        let (a, b) = (&pair[0], &pair[1]);
        if a.dimensions() != b.dimensions() {
            continue;
        }
        let n = a.as_raw().len().max(1);
        let diff: u64 = a
            .as_raw()
            .iter()
            .zip(b.as_raw().iter())
            .map(|(&x, &y)| (x as i32 - y as i32).unsigned_abs() as u64)
            .sum();
        let v = diff as f64 / n as f64 / 255.0;
        samples.push(Sample {
            t: (i + 1) as f64 * interval,
            v: v.clamp(0.0, 1.0),
        });
    }
    samples
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::GrayImage;

    #[test]
    fn motion_samples_zero_for_identical_frames() {
        let a = GrayImage::from_pixel(4, 4, image::Luma([100]));
        let b = GrayImage::from_pixel(4, 4, image::Luma([100]));
        let samples = motion_samples(&[a, b], 1.0);
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].v, 0.0);
    }

    #[test]
    fn motion_samples_nonzero_for_differing_frames() {
        let a = GrayImage::from_pixel(4, 4, image::Luma([0]));
        let b = GrayImage::from_pixel(4, 4, image::Luma([255]));
        let samples = motion_samples(&[a, b], 1.0);
        assert_eq!(samples[0].v, 1.0);
    }
}
