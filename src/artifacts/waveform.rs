//! 4.4.8 Waveform — amplitude visualization via ffmpeg's `showwavespic`
//! (spec §4.4.8). A source with no audio stream still gets a placeholder
//! PNG so the artifact is always present.

use std::path::Path;

use image::{Rgb, RgbImage};
use serde_json::{json, Value};

use crate::domain::artifact::ArtifactKind;
use crate::error::Result;
use crate::paths;
use crate::process::args::thread_flags;

use super::{atomic_write, GeneratorContext};

#[derive(serde::Deserialize)]
#[serde(default)]
pub struct WaveformParams {
    pub width: u32,
    pub height: u32,
    pub color: String,
}

impl Default for WaveformParams {
    fn default() -> Self {
        Self {
            width: 800,
            height: 120,
            color: "3b82f6".to_string(),
        }
    }
}

pub fn generate(ctx: &GeneratorContext, video: &Path, params: WaveformParams) -> Result<Value> {
    let dest = paths::artifact_path(&ctx.config, video, ArtifactKind::Waveform);
    if !ctx.force && dest.exists() {
        ctx.report_progress(1, 1);
        return Ok(json!({"status": "cached"}));
    }

    ctx.check_canceled()?;
    let bytes = render_waveform(ctx, video, &params).unwrap_or_else(|_| placeholder_png(params.width, params.height));
    atomic_write(&dest, &bytes)?;
    ctx.report_progress(1, 1);
    Ok(json!({"status": "ok"}))
}

fn render_waveform(ctx: &GeneratorContext, video: &Path, params: &WaveformParams) -> Result<Vec<u8>> {
    let mut args = vec![
        "-y".to_string(),
        "-i".to_string(),
        video.to_string_lossy().into_owned(),
        "-filter_complex".to_string(),
        format!(
            "aformat=channel_layouts=mono,showwavespic=s={w}x{h}:colors=#{c}",
            w = params.width,
            h = params.height,
            c = params.color,
        ),
        "-frames:v".to_string(),
        "1".to_string(),
        "-f".to_string(),
        "image2".to_string(),
        "pipe:1".to_string(),
    ];
    args.extend(thread_flags(&ctx.config));
    let out = ctx.run_ffmpeg(args)?;
    if out.stdout.len() < 64 {
        return Err(crate::error::Error::Other(anyhow::anyhow!(
            "waveform render produced an empty image"
        )));
    }
    Ok(out.stdout)
}

fn placeholder_png(width: u32, height: u32) -> Vec<u8> {
    let img = RgbImage::from_pixel(width.max(1), height.max(1), Rgb([30, 30, 30]));
    let mut bytes = Vec::new();
    let _ = img.write_to(&mut std::io::Cursor::new(&mut bytes), image::ImageFormat::Png);
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholder_png_is_nonempty_and_valid() {
        let bytes = placeholder_png(800, 120);
        assert!(bytes.len() > 64);
        assert_eq!(&bytes[1..4], b"PNG");
    }
}
