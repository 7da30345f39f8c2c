//! Target resolution (spec §4.7 "Target resolution").
//!
//! Handlers consult `params.targets` first; when absent, they scan
//! `directory` (recursive or not per request) for source videos.

use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::config::EngineConfig;
use crate::domain::job::JobRequest;
use crate::paths;

/// Resolves the video list a job's task should run against.
pub fn resolve_targets(config: &EngineConfig, request: &JobRequest) -> Vec<PathBuf> {
    if let Some(targets) = request.targets() {
        return targets
            .into_iter()
            .map(|rel| config.media_root.join(rel))
            .filter(|p| p.is_file())
            .collect();
    }

    let dir = request
        .directory
        .as_ref()
        .map(|d| config.media_root.join(d))
        .unwrap_or_else(|| config.media_root.clone());

    list_videos(config, &dir, request.recursive)
}

/// Every source video under `dir` (spec §3.1), optionally recursing into
/// subdirectories. Entries are sorted for deterministic job ordering.
pub fn list_videos(config: &EngineConfig, dir: &Path, recursive: bool) -> Vec<PathBuf> {
    let max_depth = if recursive { usize::MAX } else { 1 };
    let mut videos: Vec<PathBuf> = WalkDir::new(dir)
        .max_depth(max_depth)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .filter(|p| paths::is_original_media_file(config, p))
        .collect();
    videos.sort();
    videos
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn cfg(root: &Path) -> EngineConfig {
        let mut cfg = EngineConfig::default();
        cfg.media_root = root.to_path_buf();
        cfg
    }

    #[test]
    fn list_videos_skips_nested_dirs_when_not_recursive() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.mp4"), b"x").unwrap();
        fs::create_dir_all(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("sub/b.mp4"), b"x").unwrap();

        let cfg = cfg(dir.path());
        let shallow = list_videos(&cfg, dir.path(), false);
        assert_eq!(shallow.len(), 1);
        let deep = list_videos(&cfg, dir.path(), true);
        assert_eq!(deep.len(), 2);
    }

    #[test]
    fn targets_param_resolves_under_root_and_drops_missing() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.mp4"), b"x").unwrap();
        let cfg = cfg(dir.path());
        let mut request = JobRequest::default();
        request.params.insert(
            "targets".into(),
            serde_json::json!(["a.mp4", "missing.mp4"]),
        );
        let resolved = resolve_targets(&cfg, &request);
        assert_eq!(resolved, vec![dir.path().join("a.mp4")]);
    }
}
