//! Media and artifact file serving (spec §6.1/§6.2): `artifact_path`/
//! `artifact_exists` are the authoritative presence checks from §3.3, and
//! every served file — source video or derived artifact — goes out through
//! the same byte-range-aware responder so a browser `<video>` tag can seek
//! either one.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;

use crate::domain::artifact::ArtifactKind;
use crate::engine::Engine;
use crate::error::Error;
use crate::paths;

use super::error::{ApiError, ApiResult};

/// Resolves a caller-supplied relative path against the library root,
/// rejecting anything that would escape it (`..` components) or that
/// doesn't name a recognized source video (spec §3.1/§4.1).
pub fn resolve_video(engine: &Engine, relative: &str) -> ApiResult<PathBuf> {
    let relative = relative.trim_start_matches('/');
    if relative.split('/').any(|seg| seg == "..") {
        return Err(ApiError(Error::InvalidArgument("path escapes library root".into())));
    }
    let candidate = engine.config().media_root.join(relative);
    if !paths::is_original_media_file(engine.config(), &candidate) {
        return Err(ApiError(Error::NotFound(relative.to_string())));
    }
    Ok(candidate)
}

fn content_type_for(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()).unwrap_or("").to_ascii_lowercase().as_str() {
        "mp4" | "m4v" => "video/mp4",
        "webm" => "video/webm",
        "mkv" => "video/x-matroska",
        "mov" => "video/quicktime",
        "avi" => "video/x-msvideo",
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "json" => "application/json",
        "srt" => "application/x-subrip",
        _ => "application/octet-stream",
    }
}

/// Parses a single-range `Range: bytes=start-end` header (the only form
/// browsers send for `<video>` seeking). Multi-range requests fall back to
/// serving the whole file, same as most lightweight media servers.
fn parse_range(header: &str, len: u64) -> Option<(u64, u64)> {
    let spec = header.strip_prefix("bytes=")?;
    if spec.contains(',') {
        return None;
    }
    let (start_raw, end_raw) = spec.split_once('-')?;
    if start_raw.is_empty() {
        let suffix_len: u64 = end_raw.parse().ok()?;
        let start = len.saturating_sub(suffix_len);
        return Some((start, len.saturating_sub(1)));
    }
    let start: u64 = start_raw.parse().ok()?;
    let end: u64 = if end_raw.is_empty() { len.saturating_sub(1) } else { end_raw.parse().ok()? };
    if start > end || start >= len {
        return None;
    }
    Some((start, end.min(len.saturating_sub(1))))
}

/// Serves `path` with HTTP range support (spec §6.1 "serves media with
/// byte-range support"). `200 OK` with the full body when no (usable)
/// `Range` header is present, `206 Partial Content` otherwise.
pub fn serve_file_with_range(path: &Path, headers: &HeaderMap) -> Response {
    let Ok(mut file) = File::open(path) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let Ok(metadata) = file.metadata() else {
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    };
    let len = metadata.len();
    let content_type = HeaderValue::from_static(content_type_for(path));

    let range = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| parse_range(v, len));

    match range {
        Some((start, end)) => {
            let chunk_len = end - start + 1;
            let mut buf = vec![0u8; chunk_len as usize];
            if file.seek(SeekFrom::Start(start)).is_err() || file.read_exact(&mut buf).is_err() {
                return StatusCode::INTERNAL_SERVER_ERROR.into_response();
            }
            let mut response = (StatusCode::PARTIAL_CONTENT, buf).into_response();
            let hdrs = response.headers_mut();
            hdrs.insert(header::CONTENT_TYPE, content_type);
            hdrs.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
            hdrs.insert(
                header::CONTENT_RANGE,
                HeaderValue::from_str(&format!("bytes {start}-{end}/{len}")).unwrap(),
            );
            hdrs.insert(header::CONTENT_LENGTH, HeaderValue::from_str(&chunk_len.to_string()).unwrap());
            response
        }
        None => {
            let mut buf = Vec::with_capacity(len as usize);
            if file.read_to_end(&mut buf).is_err() {
                return StatusCode::INTERNAL_SERVER_ERROR.into_response();
            }
            let mut response = (StatusCode::OK, buf).into_response();
            let hdrs = response.headers_mut();
            hdrs.insert(header::CONTENT_TYPE, content_type);
            hdrs.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
            response
        }
    }
}

pub async fn serve_media(
    State(engine): State<Engine>,
    axum::extract::Path(relative): axum::extract::Path<String>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let video = resolve_video(&engine, &relative)?;
    Ok(serve_file_with_range(&video, &headers))
}

#[derive(Debug, Deserialize)]
pub struct ArtifactQuery {
    #[serde(default)]
    fmt: Option<String>,
}

fn kind_from_name(name: &str, fmt: Option<&str>) -> Option<ArtifactKind> {
    Some(match name {
        "metadata" => ArtifactKind::Metadata,
        "thumbnail" => ArtifactKind::Thumbnail,
        "preview" => ArtifactKind::Preview { webm: fmt != Some("mp4") },
        "preview-info" => ArtifactKind::PreviewInfo,
        "sprites-sheet" => ArtifactKind::SpritesSheet,
        "sprites-index" => ArtifactKind::SpritesIndex,
        "phash" => ArtifactKind::Phash,
        "scenes" | "markers" => ArtifactKind::Scenes,
        "heatmaps" => ArtifactKind::Heatmaps,
        "heatmap-png" => ArtifactKind::HeatmapPng,
        "waveform" => ArtifactKind::Waveform,
        "motion" => ArtifactKind::Motion,
        "subtitles" => ArtifactKind::Subtitles,
        "faces" => ArtifactKind::Faces,
        _ => return None,
    })
}

/// `artifact_path`/`artifact_exists` (spec §6.2), wired to an HTTP GET so a
/// UI can both probe presence and fetch bytes through one endpoint.
/// `*path` is the video's path relative to the library root, e.g.
/// `GET /artifacts/thumbnail/show/ep01.mp4`.
pub async fn serve_artifact(
    State(engine): State<Engine>,
    axum::extract::Path((kind_name, video_path)): axum::extract::Path<(String, String)>,
    Query(q): Query<ArtifactQuery>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let kind = kind_from_name(&kind_name, q.fmt.as_deref())
        .ok_or_else(|| ApiError(Error::InvalidArgument(format!("unknown artifact kind '{kind_name}'"))))?;
    let video = resolve_video(&engine, &video_path)?;
    let path = engine.artifact_path(&video, kind);
    if !engine.artifact_exists(&video, kind) {
        // Subtitles have a legacy next-to-source fallback (spec §3.2).
        if matches!(kind, ArtifactKind::Subtitles) {
            let legacy = paths::legacy_subtitles_path(&video);
            if legacy.is_file() {
                return Ok(serve_file_with_range(&legacy, &headers));
            }
        }
        return Err(ApiError(Error::NotFound(format!("{kind_name} not present for {video_path}"))));
    }
    Ok(serve_file_with_range(&path, &headers))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_range_handles_open_ended_and_suffix_forms() {
        assert_eq!(parse_range("bytes=0-99", 1000), Some((0, 99)));
        assert_eq!(parse_range("bytes=500-", 1000), Some((500, 999)));
        assert_eq!(parse_range("bytes=-100", 1000), Some((900, 999)));
        assert_eq!(parse_range("bytes=1,2", 1000), None);
        assert_eq!(parse_range("bytes=5000-6000", 1000), None);
    }
}
