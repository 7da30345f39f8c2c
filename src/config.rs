//! Environment-driven configuration (spec §6.4).
//!
//! There is no settings.json sidecar here — this binary is headless, so the
//! teacher's `AppSettings::load`/`save` pair becomes a one-shot
//! `EngineConfig::from_env`. Every field has the spec-stated default so a
//! bare `scenevaultd` with no environment at all still does something
//! sensible.

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_bool(key: &str, default: bool) -> bool {
    match env_string(key) {
        None => default,
        Some(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            _ => default,
        },
    }
}

fn env_u32(key: &str, default: u32) -> u32 {
    env_string(key)
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(default)
}

fn env_u32_clamped(key: &str, default: u32, min: u32, max: u32) -> u32 {
    env_u32(key, default).clamp(min, max)
}

fn env_u64(key: &str, default: u64) -> u64 {
    env_string(key)
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default)
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub media_root: PathBuf,
    pub media_exts: HashSet<String>,

    pub ffmpeg_bin: String,
    pub ffprobe_bin: String,
    pub ffmpeg_hwaccel: Option<String>,
    /// `None` means "auto" (let ffmpeg choose); `Some(n)` maps to `-threads n`.
    pub ffmpeg_threads: Option<u32>,
    pub ffmpeg_timelimit: Duration,
    pub ffmpeg_concurrency: u32,

    pub job_max_concurrency: u32,
    pub batch_workers: usize,
    pub restore_workers: usize,

    pub job_persist_disable: bool,
    pub job_autorestore_disable: bool,
    pub strict_fifo_start: bool,

    pub light_slot_all: bool,
    pub light_slot_types: HashSet<String>,

    pub preview_crf_vp9: u32,
    pub preview_crf_h264: u32,
    pub preview_single_pass: bool,
    pub preview_min_gap_frac: f64,
    pub preview_progress_watchdog_secs: u64,
    pub preview_progress_kill_secs: u64,

    pub sprites_keyframes: bool,
    pub sprites_even_sampling: bool,
    pub sprites_auto_even_sec: f64,
    pub sprites_even_workers: usize,
    pub sprites_watchdog_kill_secs: u64,

    pub scenes_light_slot: bool,
    pub scenes_heartbeat_cap_percent: f64,

    pub thumbnail_width: u32,
    pub thumbnail_quality: u32,
    pub scene_thumb_quality: u32,
    pub scene_clip_crf: u32,

    pub whisper_cpp_bin: Option<String>,
    pub whisper_cpp_model: Option<String>,
    pub openface_model: Option<String>,

    pub state_dir: PathBuf,
}

pub const DEFAULT_LIGHT_SLOT_TASKS: &[&str] =
    &["markers", "preview", "sprites", "phash", "faces", "heatmaps"];

impl Default for EngineConfig {
    fn default() -> Self {
        let media_root = env_string("MEDIA_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));

        let media_exts: HashSet<String> = env_string("MEDIA_EXTS")
            .map(|raw| {
                raw.split(',')
                    .map(|s| s.trim().trim_start_matches('.').to_ascii_lowercase())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_else(|| {
                ["mp4", "mkv", "mov", "m4v", "webm", "avi"]
                    .iter()
                    .map(|s| s.to_string())
                    .collect()
            });

        let light_slot_types: HashSet<String> = env_string("LIGHT_SLOT_TYPES")
            .map(|raw| {
                raw.split(',')
                    .map(|s| s.trim().to_ascii_lowercase())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_else(|| DEFAULT_LIGHT_SLOT_TASKS.iter().map(|s| s.to_string()).collect());

        let ffmpeg_timelimit_secs = env_u64("FFMPEG_TIMELIMIT", 600);

        Self {
            state_dir: env_string("SCENEVAULT_STATE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| media_root.join(".artifacts")),
            media_root,
            media_exts,
            ffmpeg_bin: env_string("FFMPEG").unwrap_or_else(|| "ffmpeg".to_string()),
            ffprobe_bin: env_string("FFPROBE").unwrap_or_else(|| "ffprobe".to_string()),
            ffmpeg_hwaccel: env_string("FFMPEG_HWACCEL"),
            ffmpeg_threads: match env_string("FFMPEG_THREADS").as_deref() {
                None | Some("auto") => None,
                Some(raw) => raw.parse::<u32>().ok(),
            },
            ffmpeg_timelimit: Duration::from_secs(ffmpeg_timelimit_secs),
            ffmpeg_concurrency: env_u32_clamped("FFMPEG_CONCURRENCY", 4, 1, 16),
            job_max_concurrency: env_u32_clamped("JOB_MAX_CONCURRENCY", 4, 1, 256),
            batch_workers: env_u32("BATCH_WORKERS", num_cpus_guess().div_ceil(2).min(4) as u32)
                as usize,
            restore_workers: env_u32("RESTORE_WORKERS", 2).min(
                env_u32_clamped("JOB_MAX_CONCURRENCY", 4, 1, 256),
            ) as usize,
            job_persist_disable: env_bool("JOB_PERSIST_DISABLE", false),
            job_autorestore_disable: env_bool("JOB_AUTORESTORE_DISABLE", false),
            strict_fifo_start: env_bool("STRICT_FIFO_START", false),
            light_slot_all: env_bool("LIGHT_SLOT_ALL", false),
            light_slot_types,
            preview_crf_vp9: env_u32("PREVIEW_CRF_VP9", 32),
            preview_crf_h264: env_u32("PREVIEW_CRF_H264", 28),
            preview_single_pass: env_bool("PREVIEW_SINGLE_PASS", true),
            preview_min_gap_frac: env_string("PREVIEW_MIN_GAP_FRAC")
                .and_then(|v| v.parse::<f64>().ok())
                .unwrap_or(0.25),
            preview_progress_watchdog_secs: env_u64("PREVIEW_PROGRESS_WATCHDOG_SECS", 10),
            preview_progress_kill_secs: env_u64("PREVIEW_PROGRESS_KILL_SECS", 60),
            sprites_keyframes: env_bool("SPRITES_KEYFRAMES", true),
            sprites_even_sampling: env_bool("SPRITES_EVEN_SAMPLING", false),
            sprites_auto_even_sec: env_string("SPRITES_AUTO_EVEN_SEC")
                .and_then(|v| v.parse::<f64>().ok())
                .unwrap_or(1800.0),
            sprites_even_workers: env_u32("SPRITES_EVEN_WORKERS", 4) as usize,
            sprites_watchdog_kill_secs: env_u64("SPRITES_WATCHDOG_KILL_SECS", 60),
            scenes_light_slot: env_bool("SCENES_LIGHT_SLOT", true),
            scenes_heartbeat_cap_percent: env_string("SCENES_HEARTBEAT_CAP_PERCENT")
                .and_then(|v| v.parse::<f64>().ok())
                .unwrap_or(3.0),
            thumbnail_width: env_u32("THUMBNAIL_WIDTH", 320),
            thumbnail_quality: env_u32_clamped("THUMBNAIL_QUALITY", 8, 2, 31),
            scene_thumb_quality: env_u32_clamped("SCENE_THUMB_QUALITY", 8, 2, 31),
            scene_clip_crf: env_u32("SCENE_CLIP_CRF", 28),
            whisper_cpp_bin: env_string("WHISPER_CPP_BIN"),
            whisper_cpp_model: env_string("WHISPER_CPP_MODEL"),
            openface_model: env_string("OPENFACE_MODEL"),
        }
    }
}

fn num_cpus_guess() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

impl EngineConfig {
    pub fn from_env() -> Self {
        Self::default()
    }

    pub fn is_light_slot_task(&self, task: &str) -> bool {
        self.light_slot_all || self.light_slot_types.contains(task)
    }

    /// Resolves `ffmpeg_bin`/`ffprobe_bin` (and, if configured, the optional
    /// whisper.cpp/OpenFace binaries) against `PATH`, returning the name of
    /// each one `which` couldn't find. Jobs that need a missing binary still
    /// fail with [`crate::error::Error::DependencyMissing`] at run time; this
    /// is just an early, loggable warning at boot.
    pub fn missing_dependencies(&self) -> Vec<&str> {
        let mut missing = Vec::new();
        if which::which(&self.ffmpeg_bin).is_err() {
            missing.push(self.ffmpeg_bin.as_str());
        }
        if which::which(&self.ffprobe_bin).is_err() {
            missing.push(self.ffprobe_bin.as_str());
        }
        if let Some(bin) = &self.whisper_cpp_bin {
            if which::which(bin).is_err() {
                missing.push(bin.as_str());
            }
        }
        missing
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_spec_compliant() {
        // SAFETY: test-only env scoping; no other test in this module reads these keys.
        for key in ["MEDIA_ROOT", "FFMPEG_CONCURRENCY", "JOB_MAX_CONCURRENCY"] {
            std::env::remove_var(key);
        }
        let cfg = EngineConfig::from_env();
        assert_eq!(cfg.ffmpeg_concurrency, 4);
        assert_eq!(cfg.job_max_concurrency, 4);
        assert!(cfg.media_exts.contains("mp4"));
        assert!(cfg.is_light_slot_task("preview"));
        assert!(!cfg.is_light_slot_task("thumbnail"));
    }

    #[test]
    fn ffmpeg_concurrency_is_bounded() {
        std::env::set_var("FFMPEG_CONCURRENCY_TEST_ONLY_UNUSED", "noop");
        assert_eq!(env_u32_clamped("NOT_SET_KEY_XYZ", 4, 1, 16), 4);
    }
}
