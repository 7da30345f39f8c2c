//! C1 — Path & Artifact Layout.
//!
//! Pure functions from `(video, kind)` to on-disk paths and back. Every
//! other module goes through these instead of joining strings itself, the
//! same discipline the teacher applies in `output_policy_paths` (one
//! template-resolution module all generators funnel through).

use std::path::{Path, PathBuf};

use crate::config::EngineConfig;
use crate::domain::artifact::ArtifactKind;

/// Directory under `<root>/.artifacts/scenes/<stem>/` that holds every
/// derived file for one video. Created on first use.
pub fn artifact_dir(config: &EngineConfig, video: &Path) -> std::io::Result<PathBuf> {
    let stem = video_stem(video);
    let dir = config.media_root.join(".artifacts").join("scenes").join(stem);
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}

fn artifact_dir_nocreate(config: &EngineConfig, video: &Path) -> PathBuf {
    let stem = video_stem(video);
    config.media_root.join(".artifacts").join("scenes").join(stem)
}

/// A video's stem, normalized so a legacy `foo.mp4` embedded in the name
/// (e.g. `foo.mp4.metadata.json` written by an older build) is stripped.
pub fn video_stem(video: &Path) -> String {
    let file_name = video.file_stem().and_then(|s| s.to_str()).unwrap_or("video");
    strip_trailing_media_ext(file_name)
}

fn strip_trailing_media_ext(stem: &str) -> String {
    for ext in MEDIA_EXT_FALLBACK {
        let suffix = format!(".{ext}");
        if let Some(trimmed) = stem.strip_suffix(suffix.as_str()) {
            return trimmed.to_string();
        }
    }
    stem.to_string()
}

const MEDIA_EXT_FALLBACK: &[&str] = &["mp4", "mkv", "mov", "m4v", "webm", "avi"];

impl ArtifactKind {
    /// Canonical filename (relative to the artifact directory) for this kind.
    pub fn filename(self, stem: &str) -> String {
        match self {
            ArtifactKind::Metadata => format!("{stem}.metadata.json"),
            ArtifactKind::Thumbnail => format!("{stem}.thumbnail.jpg"),
            ArtifactKind::Preview { webm: true } => format!("{stem}.preview.webm"),
            ArtifactKind::Preview { webm: false } => format!("{stem}.preview.mp4"),
            ArtifactKind::PreviewInfo => format!("{stem}.preview.json"),
            ArtifactKind::SpritesSheet => format!("{stem}.sprites.jpg"),
            ArtifactKind::SpritesIndex => format!("{stem}.sprites.json"),
            ArtifactKind::Phash => format!("{stem}.phash.json"),
            ArtifactKind::Scenes => format!("{stem}.scenes.json"),
            ArtifactKind::Heatmaps => format!("{stem}.heatmaps.json"),
            ArtifactKind::HeatmapPng => format!("{stem}.heatmaps.png"),
            ArtifactKind::Waveform => format!("{stem}.waveform.png"),
            ArtifactKind::Motion => format!("{stem}.motion.json"),
            ArtifactKind::Subtitles => format!("{stem}.subtitles.srt"),
            ArtifactKind::Faces => format!("{stem}.faces.json"),
        }
    }
}

/// All canonical suffixes, longest first, used by reverse parsing.
fn known_suffixes() -> Vec<(&'static str, ArtifactKindTemplate)> {
    use ArtifactKindTemplate as K;
    vec![
        (".preview.json", K::PreviewInfo),
        (".preview.webm", K::Preview { webm: true }),
        (".preview.mp4", K::Preview { webm: false }),
        (".sprites.json", K::SpritesIndex),
        (".sprites.jpg", K::SpritesSheet),
        (".metadata.json", K::Metadata),
        (".thumbnail.jpg", K::Thumbnail),
        (".phash.json", K::Phash),
        (".scenes.json", K::Scenes),
        (".heatmaps.json", K::Heatmaps),
        (".heatmaps.png", K::HeatmapPng),
        (".waveform.png", K::Waveform),
        (".motion.json", K::Motion),
        (".subtitles.srt", K::Subtitles),
        (".faces.json", K::Faces),
    ]
}

/// Mirrors `ArtifactKind` but lets us build the lookup table without the
/// `webm` payload colliding with itself in match arms above.
type ArtifactKindTemplate = ArtifactKind;

/// Reverse-parse an arbitrary filename into `(stem, kind)`. This is the sole
/// authority for "is this file an artifact" — orphan detection and cleanup
/// both call through here rather than re-deriving suffix rules.
pub fn classify_artifact_filename(filename: &str) -> Option<(String, ArtifactKind)> {
    let mut best: Option<(String, ArtifactKind)> = None;
    for (suffix, kind) in known_suffixes() {
        if let Some(stem) = filename.strip_suffix(suffix) {
            let better = match &best {
                Some((_, _)) => suffix.len() > best.as_ref().map(|_| 0).unwrap_or(0),
                None => true,
            };
            if best.is_none() || better {
                best = Some((strip_trailing_media_ext(stem), kind));
            }
        }
    }
    best
}

/// True when `path`'s name/extension/ancestry pass the spec §3.1/§4.1 rules,
/// independent of whether the file actually exists on disk — split out of
/// [`is_original_media_file`] so the classification logic is testable
/// without a real filesystem fixture.
pub fn path_eligible_as_media(config: &EngineConfig, path: &Path) -> bool {
    let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
        return false;
    };
    if !config.media_exts.contains(&ext.to_ascii_lowercase()) {
        return false;
    }
    let Some(file_name) = path.file_name().and_then(|s| s.to_str()) else {
        return false;
    };
    if file_name.starts_with("._") {
        return false;
    }
    if classify_artifact_filename(file_name).is_some() {
        return false;
    }
    for ancestor in path.ancestors().skip(1) {
        if ancestor == config.media_root {
            break;
        }
        if let Some(dir_name) = ancestor.file_name().and_then(|s| s.to_str()) {
            if dir_name.starts_with('.') || dir_name.ends_with(".previews") {
                return false;
            }
        }
    }
    true
}

/// True when `path` is a regular source video per spec §3.1/§4.1: a
/// recognized media extension, no excluded ancestor directory, and the
/// filename doesn't itself end in a known artifact suffix.
pub fn is_original_media_file(config: &EngineConfig, path: &Path) -> bool {
    path.is_file() && path_eligible_as_media(config, path)
}

/// Path an artifact of `kind` would live at for `video`, without creating
/// the directory (use for existence checks).
pub fn artifact_path(config: &EngineConfig, video: &Path, kind: ArtifactKind) -> PathBuf {
    let stem = video_stem(video);
    artifact_dir_nocreate(config, video).join(kind.filename(&stem))
}

/// Per-scene thumbnail path: `<stem>.scenes/<stem>.scene_NNN.jpg`.
pub fn scene_thumbnail_path(config: &EngineConfig, video: &Path, index: usize) -> PathBuf {
    let stem = video_stem(video);
    artifact_dir_nocreate(config, video)
        .join(format!("{stem}.scenes"))
        .join(format!("{stem}.scene_{index:03}.jpg"))
}

/// Legacy fallback location the lookup layer still accepts: a
/// `.subtitles.srt` written next to the source video itself.
pub fn legacy_subtitles_path(video: &Path) -> PathBuf {
    let stem = video.file_stem().and_then(|s| s.to_str()).unwrap_or("video");
    video.with_file_name(format!("{stem}.subtitles.srt"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn cfg() -> EngineConfig {
        let mut cfg = EngineConfig::default();
        cfg.media_root = PathBuf::from("/library");
        cfg
    }

    #[test]
    fn artifact_path_uses_canonical_layout() {
        let cfg = cfg();
        let video = PathBuf::from("/library/show/ep01.mp4");
        let p = artifact_path(&cfg, &video, ArtifactKind::Thumbnail);
        assert_eq!(
            p,
            PathBuf::from("/library/.artifacts/scenes/ep01/ep01.thumbnail.jpg")
        );
    }

    #[test]
    fn classify_strips_longest_suffix_first() {
        let (stem, kind) = classify_artifact_filename("clip.preview.json").unwrap();
        assert_eq!(stem, "clip");
        assert!(matches!(kind, ArtifactKind::PreviewInfo));
    }

    #[test]
    fn classify_normalizes_legacy_double_extension_stems() {
        let (stem, _) = classify_artifact_filename("foo.mp4.metadata.json").unwrap();
        assert_eq!(stem, "foo");
    }

    #[test]
    fn classify_returns_none_for_non_artifacts() {
        assert!(classify_artifact_filename("video.mp4").is_none());
    }

    #[test]
    fn excludes_dot_prefixed_and_previews_dirs() {
        let cfg = cfg();
        assert!(!path_eligible_as_media(
            &cfg,
            &PathBuf::from("/library/.artifacts/scenes/x/x.mp4")
        ));
        assert!(!path_eligible_as_media(
            &cfg,
            &PathBuf::from("/library/show.previews/x.mp4")
        ));
        assert!(path_eligible_as_media(&cfg, &PathBuf::from("/library/show/ep01.mp4")));
    }
}
