//! C4 — Artifact Generators.
//!
//! One module per artifact kind. Every generator takes a [`GeneratorContext`]
//! (shared config/runner/cancel/progress plumbing), respects `force`
//! semantics, writes its output atomically via [`atomic_write`]/
//! [`atomic_write_json`], and reports progress through `ctx.report`.

pub mod faces;
pub mod heatmaps;
pub mod metadata;
pub mod motion;
pub mod phash;
pub mod preview;
pub mod scenes;
pub mod sprites;
pub mod subtitles;
pub mod thumbnail;
pub mod waveform;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;

use crate::cancel::CancelToken;
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::process::ProcessRunner;

/// A callback invoked with `(processed, total)` as a generator advances.
/// `total == 0` means "indeterminate"; callers treat it as a heartbeat.
pub type ProgressFn = Arc<dyn Fn(u64, u64) + Send + Sync>;

pub fn no_progress() -> ProgressFn {
    Arc::new(|_, _| {})
}

/// Shared dependencies every generator needs, bundled so call sites don't
/// thread five parameters through every function.
#[derive(Clone)]
pub struct GeneratorContext {
    pub config: Arc<EngineConfig>,
    pub runner: ProcessRunner,
    pub job_id: String,
    pub cancel: CancelToken,
    pub report: ProgressFn,
    pub force: bool,
}

impl GeneratorContext {
    pub fn check_canceled(&self) -> Result<()> {
        if self.cancel.is_canceled() {
            Err(Error::Canceled)
        } else {
            Ok(())
        }
    }

    pub fn report_progress(&self, processed: u64, total: u64) {
        (self.report)(processed, total);
    }

    pub fn ffmpeg_argv(&self, args: Vec<String>) -> Vec<String> {
        let mut full = vec![self.config.ffmpeg_bin.clone()];
        full.extend(args);
        full
    }

    pub fn ffprobe_argv(&self, args: Vec<String>) -> Vec<String> {
        let mut full = vec![self.config.ffprobe_bin.clone()];
        full.extend(args);
        full
    }

    pub fn run_ffmpeg(&self, args: Vec<String>) -> Result<crate::process::CommandOutput> {
        let argv = self.ffmpeg_argv(args);
        self.runner
            .run(&self.job_id, &argv, &self.cancel, Some(self.config.ffmpeg_timelimit))
    }

    pub fn run_ffprobe(&self, args: Vec<String>) -> Result<crate::process::CommandOutput> {
        let argv = self.ffprobe_argv(args);
        self.runner
            .run(&self.job_id, &argv, &self.cancel, Some(self.config.ffmpeg_timelimit))
    }

    /// Like [`run_ffmpeg`](Self::run_ffmpeg), but emits `-progress pipe:2`
    /// ahead of `args` and applies a stall watchdog on top of the ordinary
    /// per-command timeout (spec §4.4.3 "stall watchdog", §9 "Progress
    /// reporting from ffmpeg"). `pipe:2` routes the key=value stream to
    /// stderr so it never collides with a binary payload on stdout.
    /// Pass `Duration::ZERO` for either threshold to disable it.
    pub fn run_ffmpeg_watchdog(
        &self,
        args: Vec<String>,
        stall_warn: std::time::Duration,
        stall_kill: std::time::Duration,
        on_progress: crate::process::ProgressCallback,
    ) -> Result<crate::process::CommandOutput> {
        let mut full = vec!["-progress".to_string(), "pipe:2".to_string()];
        full.extend(args);
        let argv = self.ffmpeg_argv(full);
        self.runner.run_with_progress(
            &self.job_id,
            &argv,
            &self.cancel,
            Some(self.config.ffmpeg_timelimit),
            stall_warn,
            stall_kill,
            on_progress,
        )
    }
}

pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Writes `bytes` to a `.tmp` sibling of `dest` then renames over it, so
/// readers never observe a partially written artifact (spec §9 "Atomic
/// artifact writes").
pub fn atomic_write(dest: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = tmp_sibling(dest);
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, dest)?;
    Ok(())
}

pub fn atomic_write_json<T: Serialize>(dest: &Path, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    atomic_write(dest, &bytes)
}

fn tmp_sibling(dest: &Path) -> PathBuf {
    let file_name = dest
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("artifact");
    dest.with_file_name(format!(".{file_name}.{}.tmp", std::process::id()))
}

/// Source mtime in epoch seconds, used for staleness checks and the
/// `source_mtime` field SPEC_FULL.md adds to every sidecar JSON.
pub fn source_mtime_secs(source: &Path) -> Option<u64> {
    std::fs::metadata(source)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
}

/// Parses a thumbnail-style time spec (spec §4.4.2): `"start"`, `"middle"`,
/// `"N%"`, or a bare float number of seconds. Resolves against a known
/// duration; `duration <= 0.0` resolves everything to `0.0`.
pub fn resolve_time_spec(spec: &str, duration: f64) -> Result<f64> {
    let spec = spec.trim();
    if duration <= 0.0 {
        return Ok(0.0);
    }
    let resolved = match spec {
        "start" => 0.0,
        "middle" => duration / 2.0,
        _ if spec.ends_with('%') => {
            let pct: f64 = spec
                .trim_end_matches('%')
                .parse()
                .map_err(|_| Error::InvalidArgument(format!("bad time spec: {spec}")))?;
            duration * (pct / 100.0)
        }
        _ => spec
            .parse::<f64>()
            .map_err(|_| Error::InvalidArgument(format!("bad time spec: {spec}")))?,
    };
    Ok(resolved.clamp(0.0, duration))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_time_spec_handles_named_and_percent_and_float() {
        assert_eq!(resolve_time_spec("start", 60.0).unwrap(), 0.0);
        assert_eq!(resolve_time_spec("middle", 60.0).unwrap(), 30.0);
        assert_eq!(resolve_time_spec("25%", 60.0).unwrap(), 15.0);
        assert_eq!(resolve_time_spec("12.5", 60.0).unwrap(), 12.5);
    }

    #[test]
    fn resolve_time_spec_clamps_to_duration() {
        assert_eq!(resolve_time_spec("150%", 60.0).unwrap(), 60.0);
        assert_eq!(resolve_time_spec("-5", 60.0).unwrap(), 0.0);
    }

    #[test]
    fn resolve_time_spec_rejects_garbage() {
        assert!(resolve_time_spec("soon", 60.0).is_err());
    }

    #[test]
    fn atomic_write_produces_final_file_without_leaving_tmp() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("x.json");
        atomic_write(&dest, b"{}").unwrap();
        assert!(dest.exists());
        let mut entries = std::fs::read_dir(dir.path()).unwrap();
        assert_eq!(entries.by_ref().count(), 1);
    }
}
