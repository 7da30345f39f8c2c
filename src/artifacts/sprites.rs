//! 4.4.4 Sprite Sheet — C×R tile mosaic, three sampling strategies with
//! uniqueness validation before falling through (spec §4.4.4).

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use image::{DynamicImage, GenericImage, GenericImageView};
use serde_json::{json, Value};
use tempfile::TempDir;

use crate::domain::artifact::ArtifactKind;
use crate::error::{Error, Result};
use crate::paths;
use crate::process::args::thread_flags;

use super::metadata::probe_duration_seconds;
use super::{atomic_write, atomic_write_json, GeneratorContext};

#[derive(serde::Deserialize)]
#[serde(default)]
pub struct SpritesParams {
    pub cols: u32,
    pub rows: u32,
    pub tile_width: u32,
    pub quality: u32,
}

impl Default for SpritesParams {
    fn default() -> Self {
        Self {
            cols: 8,
            rows: 8,
            tile_width: 160,
            quality: 8,
        }
    }
}

#[derive(serde::Serialize)]
struct SpritesIndex {
    cols: u32,
    rows: u32,
    interval: f64,
    width: u32,
    tile_width: u32,
    tile_height: u32,
    frames: u32,
}

pub fn generate(ctx: &GeneratorContext, video: &Path, params: SpritesParams) -> Result<Value> {
    let sheet_dest = paths::artifact_path(&ctx.config, video, ArtifactKind::SpritesSheet);
    let index_dest = paths::artifact_path(&ctx.config, video, ArtifactKind::SpritesIndex);
    if !ctx.force && sheet_dest.exists() && index_dest.exists() {
        ctx.report_progress(1, 1);
        return Ok(json!({"status": "cached"}));
    }

    ctx.check_canceled()?;
    let duration = probe_duration_seconds(ctx, video).unwrap_or(0.0).max(0.1);
    let frame_count = (params.cols * params.rows).max(1);
    let interval = duration / frame_count as f64;
    let min_distinct = (frame_count as usize / 4).max(1);

    let mut tiles = if ctx.config.sprites_keyframes && !should_auto_even(ctx, duration) {
        keyframe_tiles(ctx, video, &params).ok()
    } else {
        None
    };

    if tiles_insufficient(&tiles, min_distinct) {
        tiles = even_sampling_tiles(ctx, video, &params, interval).ok();
    }
    if tiles_insufficient(&tiles, min_distinct) {
        tiles = legacy_fps_tiles(ctx, video, &params, interval, min_distinct)?;
    }

    let tiles = tiles.ok_or_else(|| Error::Other(anyhow::anyhow!("no sprite frames produced")))?;
    let (sheet_bytes, tile_w, tile_h) = compose_sheet(&tiles, &params)?;
    atomic_write(&sheet_dest, &sheet_bytes)?;
    atomic_write_json(
        &index_dest,
        &SpritesIndex {
            cols: params.cols,
            rows: params.rows,
            interval,
            width: params.cols * tile_w,
            tile_width: tile_w,
            tile_height: tile_h,
            frames: tiles.len() as u32,
        },
    )?;
    ctx.report_progress(1, 1);
    Ok(json!({"status": "ok", "frames": tiles.len()}))
}

fn should_auto_even(ctx: &GeneratorContext, duration: f64) -> bool {
    ctx.config.sprites_even_sampling || duration >= ctx.config.sprites_auto_even_sec
}

fn tiles_insufficient(tiles: &Option<Vec<DynamicImage>>, min_distinct: usize) -> bool {
    match tiles {
        None => true,
        Some(t) if t.is_empty() => true,
        Some(t) => distinct_tile_count(t) < min_distinct,
    }
}

fn distinct_tile_count(tiles: &[DynamicImage]) -> usize {
    let mut seen: HashSet<Vec<u8>> = HashSet::new();
    for t in tiles {
        seen.insert(t.to_rgb8().into_raw());
    }
    seen.len()
}

/// Strategy 1: keyframe sampling via `select=eq(pict_type\,I)`.
fn keyframe_tiles(
    ctx: &GeneratorContext,
    video: &Path,
    params: &SpritesParams,
) -> Result<Vec<DynamicImage>> {
    ctx.check_canceled()?;
    let tmp = TempDir::new().map_err(Error::Io)?;
    let pattern = tmp.path().join("kf_%04d.jpg");
    let mut args = vec![
        "-y".to_string(),
        "-i".to_string(),
        video.to_string_lossy().into_owned(),
        "-vf".to_string(),
        format!(
            "select=eq(pict_type\\,I),scale={w}:-2",
            w = params.tile_width
        ),
        "-vsync".to_string(),
        "vfr".to_string(),
    ];
    args.extend(thread_flags(&ctx.config));
    args.push(pattern.to_string_lossy().into_owned());
    ctx.run_ffmpeg(args)?;
    load_tiles_from_dir(tmp.path(), (params.cols * params.rows) as usize)
}

/// Strategy 2: sample one frame at each of `cols*rows` equally spaced
/// timestamps, each extracted under the ffmpeg gate with a stall watchdog
/// (spec §4.4.3 "stall watchdog", applied here too since a single-frame
/// extraction can still hang on a corrupt seek target). There's no
/// dedicated warn threshold for sprites, so `stall_warn` is set equal to
/// the kill threshold: the kill check runs first each poll, so this never
/// produces a separate warn log, just the kill.
fn even_sampling_tiles(
    ctx: &GeneratorContext,
    video: &Path,
    params: &SpritesParams,
    interval: f64,
) -> Result<Vec<DynamicImage>> {
    let count = (params.cols * params.rows) as usize;
    let mut tiles = Vec::with_capacity(count);
    let kill_after = Duration::from_secs(ctx.config.sprites_watchdog_kill_secs);
    let no_progress: crate::process::ProgressCallback = Arc::new(|_| {});
    for i in 0..count {
        ctx.check_canceled()?;
        let t = interval * i as f64 + interval / 2.0;
        let mut args = vec![
            "-y".to_string(),
            "-ss".to_string(),
            format!("{t:.3}"),
            "-i".to_string(),
            video.to_string_lossy().into_owned(),
            "-frames:v".to_string(),
            "1".to_string(),
            "-vf".to_string(),
            format!("scale={w}:-2", w = params.tile_width),
            "-f".to_string(),
            "image2".to_string(),
            "pipe:1".to_string(),
        ];
        args.extend(thread_flags(&ctx.config));
        if let Ok(out) = ctx.run_ffmpeg_watchdog(args, kill_after, kill_after, no_progress.clone()) {
            if let Ok(img) = image::load_from_memory(&out.stdout) {
                tiles.push(img);
            }
        }
    }
    Ok(tiles)
}

/// Strategy 3: `fps=1/interval` single ffmpeg run, retried with jitter, then
/// `mpdecimate`, then scene-threshold selection, until tile uniqueness is
/// acceptable.
fn legacy_fps_tiles(
    ctx: &GeneratorContext,
    video: &Path,
    params: &SpritesParams,
    interval: f64,
    min_distinct: usize,
) -> Result<Option<Vec<DynamicImage>>> {
    let variants: [String; 3] = [
        format!("fps=1/{interval}:start_time={half}", half = interval / 2.0),
        format!("fps=1/{interval},mpdecimate"),
        "select='gt(scene,0.1)'".to_string(),
    ];
    let last_index = variants.len() - 1;
    for (variant_index, filter) in variants.iter().enumerate() {
        ctx.check_canceled()?;
        let tmp = TempDir::new().map_err(Error::Io)?;
        let pattern = tmp.path().join("fps_%04d.jpg");
        let mut args = vec![
            "-y".to_string(),
            "-i".to_string(),
            video.to_string_lossy().into_owned(),
            "-vf".to_string(),
            format!("{filter},scale={w}:-2", w = params.tile_width),
            "-vsync".to_string(),
            "vfr".to_string(),
        ];
        args.extend(thread_flags(&ctx.config));
        args.push(pattern.to_string_lossy().into_owned());
        if ctx.run_ffmpeg(args).is_ok() {
            if let Ok(tiles) = load_tiles_from_dir(tmp.path(), (params.cols * params.rows) as usize) {
                if distinct_tile_count(&tiles) >= min_distinct || variant_index == last_index {
                    return Ok(Some(tiles));
                }
            }
        }
    }
    Ok(None)
}

fn load_tiles_from_dir(dir: &Path, max: usize) -> Result<Vec<DynamicImage>> {
    let mut entries: Vec<_> = std::fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .collect();
    entries.sort();
    let mut tiles = Vec::new();
    for path in entries.into_iter().take(max) {
        if let Ok(img) = image::open(&path) {
            tiles.push(img);
        }
    }
    Ok(tiles)
}

fn compose_sheet(tiles: &[DynamicImage], params: &SpritesParams) -> Result<(Vec<u8>, u32, u32)> {
    let (tile_w, tile_h) = tiles
        .first()
        .map(|t| t.dimensions())
        .unwrap_or((params.tile_width, params.tile_width * 9 / 16));
    let mut sheet = DynamicImage::new_rgb8(params.cols * tile_w, params.rows * tile_h);
    for (idx, tile) in tiles.iter().enumerate().take((params.cols * params.rows) as usize) {
        let col = (idx as u32) % params.cols;
        let row = (idx as u32) / params.cols;
        let resized = tile.resize_exact(tile_w, tile_h, image::imageops::FilterType::Triangle);
        sheet.copy_from(&resized, col * tile_w, row * tile_h).ok();
    }
    let mut bytes = Vec::new();
    sheet
        .write_to(&mut std::io::Cursor::new(&mut bytes), image::ImageFormat::Jpeg)
        .map_err(|e| Error::Other(anyhow::anyhow!("sprite sheet encode failed: {e}")))?;
    Ok((bytes, tile_w, tile_h))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distinct_tile_count_deduplicates_identical_frames() {
        let a = DynamicImage::new_rgb8(4, 4);
        let b = DynamicImage::new_rgb8(4, 4);
        let mut c = DynamicImage::new_rgb8(4, 4);
        c.put_pixel(0, 0, image::Rgba([255, 0, 0, 255]));
        assert_eq!(distinct_tile_count(&[a, b, c]), 2);
    }
}
