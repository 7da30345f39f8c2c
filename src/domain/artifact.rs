//! Closed artifact-kind enumeration and the presence/stub rules of spec §3.3.

use std::path::Path;

use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtifactKind {
    Metadata,
    Thumbnail,
    Preview { webm: bool },
    PreviewInfo,
    SpritesSheet,
    SpritesIndex,
    Phash,
    Scenes,
    Heatmaps,
    HeatmapPng,
    Waveform,
    Motion,
    Subtitles,
    Faces,
}

/// Minimum byte size for any artifact to be considered present (`_file_nonempty`).
pub const MIN_ARTIFACT_BYTES: u64 = 64;

pub fn file_nonempty(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.len() >= MIN_ARTIFACT_BYTES)
        .unwrap_or(false)
}

const SUBTITLE_STUB_SENTINEL: &str = "[stub transcription]";

/// Kind-specific "is this a real artifact or a graceful-degradation stub"
/// check. Kinds with no stub concept (sprites, scenes, heatmaps, waveform,
/// motion, preview-info) always return `true` once `file_nonempty` passes.
pub fn is_non_stub(kind: ArtifactKind, path: &Path) -> bool {
    match kind {
        ArtifactKind::Metadata => metadata_is_non_stub(path),
        ArtifactKind::Thumbnail => thumbnail_is_non_stub(path),
        ArtifactKind::Preview { .. } => preview_is_non_stub(path),
        ArtifactKind::Subtitles => subtitles_is_non_stub(path),
        ArtifactKind::Faces => faces_is_non_stub(path),
        _ => true,
    }
}

/// Authoritative presence check combining size and stub rules (spec §3.3).
pub fn artifact_present(kind: ArtifactKind, path: &Path) -> bool {
    file_nonempty(path) && is_non_stub(kind, path)
}

fn read_json(path: &Path) -> Option<Value> {
    let bytes = std::fs::read(path).ok()?;
    serde_json::from_slice(&bytes).ok()
}

fn metadata_is_non_stub(path: &Path) -> bool {
    match read_json(path) {
        Some(v) => !v.get("stub").and_then(Value::as_bool).unwrap_or(false),
        None => false,
    }
}

/// A 1x1 placeholder JPEG is ~a few hundred bytes of mostly zero padding;
/// the real discriminator is the `stub` flag generators set in the sidecar
/// `preview.json`/`metadata.json`. Thumbnails have no sidecar, so we fall
/// back to a minimum-plausible-size heuristic consistent with spec §3.3
/// ("1x1 placeholder bytes").
fn thumbnail_is_non_stub(path: &Path) -> bool {
    std::fs::metadata(path).map(|m| m.len() > 512).unwrap_or(false)
}

fn preview_is_non_stub(path: &Path) -> bool {
    file_nonempty(path)
}

fn subtitles_is_non_stub(path: &Path) -> bool {
    match std::fs::read_to_string(path) {
        Ok(text) => !text.contains(SUBTITLE_STUB_SENTINEL),
        Err(_) => false,
    }
}

fn faces_is_non_stub(path: &Path) -> bool {
    let Some(v) = read_json(path) else { return false };
    if v.get("stub").and_then(Value::as_bool).unwrap_or(false) {
        return false;
    }
    let Some(faces) = v.get("faces").and_then(Value::as_array) else {
        return false;
    };
    faces.iter().any(|f| {
        f.get("embedding")
            .and_then(Value::as_array)
            .map(|e| !e.is_empty())
            .unwrap_or(false)
    })
}

pub fn subtitle_stub_sentinel() -> &'static str {
    SUBTITLE_STUB_SENTINEL
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn faces_requires_nonempty_embedding() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.faces.json");
        std::fs::write(
            &path,
            r#"{"faces":[{"embedding":[]}],"backend":"stub","stub":false}"#,
        )
        .unwrap();
        assert!(!faces_is_non_stub(&path));

        std::fs::write(
            &path,
            r#"{"faces":[{"embedding":[0.1,0.2]}],"backend":"insightface","stub":false}"#,
        )
        .unwrap();
        assert!(faces_is_non_stub(&path));
    }

    #[test]
    fn subtitles_stub_sentinel_marks_file_as_stub() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.subtitles.srt");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "1\n00:00:00,000 --> 00:00:01,000\n[stub transcription]\n").unwrap();
        assert!(!subtitles_is_non_stub(&path));
    }

    #[test]
    fn metadata_stub_flag_is_respected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.metadata.json");
        std::fs::write(&path, r#"{"stub":true,"duration":0}"#).unwrap();
        assert!(!metadata_is_non_stub(&path));
    }
}
