//! Manual marker editing (spec §4.4.6). These act synchronously against
//! the scenes document rather than going through the job queue, matching
//! [`Engine::set_manual_marker`]/`set_intro_outro`/`delete_marker`.

use axum::extract::{Query, State};
use axum::Json;
use serde::Deserialize;

use crate::engine::Engine;

use super::error::ApiResult;
use super::media::resolve_video;

#[derive(Debug, Deserialize)]
pub struct VideoQuery {
    path: String,
}

#[derive(Debug, Deserialize)]
pub struct SetMarkerBody {
    time: f64,
    #[serde(rename = "type")]
    marker_type: Option<String>,
    label: Option<String>,
}

pub async fn set_marker(
    State(engine): State<Engine>,
    Query(q): Query<VideoQuery>,
    Json(body): Json<SetMarkerBody>,
) -> ApiResult<impl axum::response::IntoResponse> {
    let video = resolve_video(&engine, &q.path)?;
    let doc = engine.set_manual_marker(&video, body.time, body.marker_type, body.label)?;
    Ok(Json(doc))
}

#[derive(Debug, Deserialize)]
pub struct IntroOutroBody {
    time: f64,
}

pub async fn set_intro(
    State(engine): State<Engine>,
    Query(q): Query<VideoQuery>,
    Json(body): Json<IntroOutroBody>,
) -> ApiResult<impl axum::response::IntoResponse> {
    let video = resolve_video(&engine, &q.path)?;
    let doc = engine.set_intro_outro(&video, body.time, true)?;
    Ok(Json(doc))
}

pub async fn set_outro(
    State(engine): State<Engine>,
    Query(q): Query<VideoQuery>,
    Json(body): Json<IntroOutroBody>,
) -> ApiResult<impl axum::response::IntoResponse> {
    let video = resolve_video(&engine, &q.path)?;
    let doc = engine.set_intro_outro(&video, body.time, false)?;
    Ok(Json(doc))
}

#[derive(Debug, Deserialize)]
pub struct DeleteMarkerQuery {
    path: String,
    time: f64,
}

pub async fn delete_marker(
    State(engine): State<Engine>,
    Query(q): Query<DeleteMarkerQuery>,
) -> ApiResult<impl axum::response::IntoResponse> {
    let video = resolve_video(&engine, &q.path)?;
    let doc = engine.delete_marker(&video, q.time)?;
    Ok(Json(doc))
}
