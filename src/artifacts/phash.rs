//! 4.4.5 Perceptual Hash — average/difference hash over evenly sampled
//! frames, combined by XOR or majority vote, with a whole-file SHA-256
//! fallback when ffmpeg cannot be used at all (spec §4.4.5).

use std::path::Path;

use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use crate::domain::artifact::ArtifactKind;
use crate::error::Result;
use crate::paths;
use crate::process::args::thread_flags;

use super::metadata::probe_duration_seconds;
use super::{atomic_write_json, GeneratorContext};

#[derive(Clone, Copy, PartialEq, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Algo {
    AHash,
    DHash,
}

#[derive(Clone, Copy, PartialEq, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Combine {
    Xor,
    Majority,
}

#[derive(serde::Deserialize)]
#[serde(default)]
pub struct PhashParams {
    pub frames: u32,
    pub algo: Algo,
    pub combine: Combine,
}

impl Default for PhashParams {
    fn default() -> Self {
        Self {
            frames: 5,
            algo: Algo::AHash,
            combine: Combine::Xor,
        }
    }
}

pub fn generate(ctx: &GeneratorContext, video: &Path, params: PhashParams) -> Result<Value> {
    let dest = paths::artifact_path(&ctx.config, video, ArtifactKind::Phash);
    if !ctx.force && dest.exists() {
        ctx.report_progress(1, 1);
        return Ok(json!({"status": "cached"}));
    }

    ctx.check_canceled()?;
    let doc = match compute_via_frames(ctx, video, &params) {
        Ok(hex) => json!({
            "phash": hex,
            "algo": algo_name(params.algo),
            "frames": params.frames,
            "combine": combine_name(params.combine),
        }),
        Err(_) => json!({
            "phash": sha256_file(video)?,
            "algo": "file-sha256",
            "frames": 0,
            "combine": "none",
        }),
    };
    atomic_write_json(&dest, &doc)?;
    ctx.report_progress(1, 1);
    Ok(doc)
}

fn algo_name(a: Algo) -> &'static str {
    match a {
        Algo::AHash => "ahash",
        Algo::DHash => "dhash",
    }
}

fn combine_name(c: Combine) -> &'static str {
    match c {
        Combine::Xor => "xor",
        Combine::Majority => "majority",
    }
}

fn compute_via_frames(ctx: &GeneratorContext, video: &Path, params: &PhashParams) -> Result<String> {
    let duration = probe_duration_seconds(ctx, video).unwrap_or(0.0).max(0.1);
    let mut bit_votes: Vec<u32> = vec![0; 64];
    let mut sampled = 0u32;

    for i in 0..params.frames {
        ctx.check_canceled()?;
        let t = duration * (i as f64 + 0.5) / params.frames as f64;
        let Ok(gray) = extract_gray_8x8(ctx, video, t) else { continue };
        let bits = match params.algo {
            Algo::AHash => ahash_bits(&gray),
            Algo::DHash => dhash_bits(&gray),
        };
        for (i, b) in bits.iter().enumerate() {
            if *b {
                bit_votes[i] += 1;
            }
        }
        sampled += 1;
    }

    if sampled == 0 {
        return Err(crate::error::Error::Other(anyhow::anyhow!(
            "no frames sampled for phash"
        )));
    }

    let combined: Vec<bool> = match params.combine {
        Combine::Xor => {
            // XOR across sampled frames: a bit is set when an odd number of
            // frames set it.
            bit_votes.iter().map(|&v| v % 2 == 1).collect()
        }
        Combine::Majority => bit_votes.iter().map(|&v| v * 2 >= sampled).collect(),
    };
    Ok(bits_to_hex(&combined))
}

/// Extracts a single frame at `t`, downsampled to 8x8 (or 8x9 for dhash)
/// grayscale, returning raw luma bytes.
fn extract_gray_8x8(ctx: &GeneratorContext, video: &Path, t: f64) -> Result<Vec<u8>> {
    let mut args = vec![
        "-y".to_string(),
        "-ss".to_string(),
        format!("{t:.3}"),
        "-i".to_string(),
        video.to_string_lossy().into_owned(),
        "-frames:v".to_string(),
        "1".to_string(),
        "-vf".to_string(),
        "scale=8:9,format=gray".to_string(),
        "-f".to_string(),
        "rawvideo".to_string(),
        "pipe:1".to_string(),
    ];
    args.extend(thread_flags(&ctx.config));
    let out = ctx.run_ffmpeg(args)?;
    if out.stdout.len() < 72 {
        return Err(crate::error::Error::Other(anyhow::anyhow!(
            "short frame buffer"
        )));
    }
    Ok(out.stdout)
}

/// 8x8 mean-threshold hash: each pixel's bit is set when it is at or above
/// the frame's mean luma. Only the first 64 bytes (8 rows) are used.
fn ahash_bits(gray: &[u8]) -> Vec<bool> {
    let pixels = &gray[..64.min(gray.len())];
    let mean: u32 = pixels.iter().map(|&b| b as u32).sum::<u32>() / pixels.len().max(1) as u32;
    pixels.iter().map(|&b| b as u32 >= mean).collect()
}

/// 8x8 difference hash from an 8x9 grayscale buffer: each bit compares a
/// pixel to its right-hand neighbor in the same row.
fn dhash_bits(gray: &[u8]) -> Vec<bool> {
    let mut bits = Vec::with_capacity(64);
    for row in 0..8 {
        for col in 0..8 {
            let idx = row * 9 + col;
            if idx + 1 >= gray.len() {
                bits.push(false);
                continue;
            }
            bits.push(gray[idx] < gray[idx + 1]);
        }
    }
    bits
}

fn bits_to_hex(bits: &[bool]) -> String {
    let mut out = String::with_capacity(bits.len() / 4);
    for chunk in bits.chunks(4) {
        let mut nibble = 0u8;
        for (i, &b) in chunk.iter().enumerate() {
            if b {
                nibble |= 1 << (3 - i);
            }
        }
        out.push(std::char::from_digit(nibble as u32, 16).unwrap_or('0'));
    }
    out
}

fn sha256_file(video: &Path) -> Result<String> {
    let bytes = std::fs::read(video)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ahash_bits_threshold_at_mean() {
        let mut gray = vec![0u8; 72];
        for i in 0..32 {
            gray[i] = 200;
        }
        let bits = ahash_bits(&gray);
        assert_eq!(bits.len(), 64);
        assert!(bits[0]);
        assert!(!bits[63]);
    }

    #[test]
    fn bits_to_hex_round_trips_length() {
        let bits = vec![true, false, true, false, true, true, true, true];
        let hex = bits_to_hex(&bits);
        assert_eq!(hex.len(), 2);
    }

    #[test]
    fn dhash_bits_compares_row_neighbors() {
        let mut gray = vec![0u8; 72];
        gray[0] = 10;
        gray[1] = 200;
        let bits = dhash_bits(&gray);
        assert!(bits[0]);
    }
}
