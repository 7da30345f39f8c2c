//! Job lifecycle endpoints (spec §6.2 `submit_job`/`get_job`/`list_jobs`/
//! `cancel_*`/`set_*_concurrency`/`set_paused`) plus the SSE event stream
//! (spec §6.3). This is the thin out-of-scope HTTP handler layer spec §1
//! says only needs its contract honored — every handler here is a direct
//! pass-through to an [`Engine`] method, no business logic lives in this file.

use std::convert::Infallible;
use std::time::Duration;

use axum::extract::{Path as AxPath, Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::Json;
use futures_util::stream::Stream;
use serde::Deserialize;
use serde_json::json;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

use crate::domain::job::{JobRequest, JobState};
use crate::engine::Engine;
use crate::error::Error;
use crate::registry::JobFilter;

use super::error::{ApiError, ApiResult};

pub async fn submit(State(engine): State<Engine>, Json(request): Json<JobRequest>) -> ApiResult<impl IntoResponse> {
    let job = engine.submit(request)?;
    Ok(Json(job))
}

pub async fn get(State(engine): State<Engine>, AxPath(id): AxPath<String>) -> ApiResult<impl IntoResponse> {
    engine.get_job(&id).map(Json).ok_or_else(|| ApiError(Error::NotFound(id)))
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    state: Option<String>,
    since: Option<u64>,
}

fn parse_state(raw: &str) -> Option<JobState> {
    match raw.to_ascii_lowercase().as_str() {
        "queued" => Some(JobState::Queued),
        "running" => Some(JobState::Running),
        "done" => Some(JobState::Done),
        "failed" => Some(JobState::Failed),
        "canceled" => Some(JobState::Canceled),
        "restored" => Some(JobState::Restored),
        _ => None,
    }
}

pub async fn list(State(engine): State<Engine>, Query(q): Query<ListQuery>) -> impl IntoResponse {
    let filter = JobFilter {
        state: q.state.as_deref().and_then(parse_state),
        since: q.since,
        marker: std::marker::PhantomData,
    };
    Json(engine.list_jobs(filter))
}

pub async fn cancel(State(engine): State<Engine>, AxPath(id): AxPath<String>) -> impl IntoResponse {
    let ok = engine.cancel(&id);
    Json(json!({"id": id, "canceled": ok}))
}

pub async fn cancel_all(State(engine): State<Engine>) -> impl IntoResponse {
    Json(json!({"count": engine.cancel_all()}))
}

pub async fn cancel_queued(State(engine): State<Engine>) -> impl IntoResponse {
    Json(json!({"count": engine.cancel_queued()}))
}

pub async fn clear_completed(State(engine): State<Engine>) -> impl IntoResponse {
    Json(json!({"count": engine.clear_completed()}))
}

#[derive(Debug, Deserialize)]
pub struct ConcurrencyBody {
    n: usize,
}

pub async fn set_ffmpeg_concurrency(State(engine): State<Engine>, Json(body): Json<ConcurrencyBody>) -> impl IntoResponse {
    engine.set_ffmpeg_concurrency(body.n);
    Json(json!({"value": engine.ffmpeg_concurrency()}))
}

pub async fn set_job_concurrency(State(engine): State<Engine>, Json(body): Json<ConcurrencyBody>) -> impl IntoResponse {
    engine.set_job_concurrency(body.n);
    Json(json!({"value": engine.job_concurrency()}))
}

#[derive(Debug, Deserialize)]
pub struct PauseBody {
    paused: bool,
}

pub async fn set_paused(State(engine): State<Engine>, Json(body): Json<PauseBody>) -> impl IntoResponse {
    engine.set_paused(body.paused);
    Json(json!({"paused": engine.is_paused()}))
}

/// `subscribe_events` (spec §6.2/§6.3): a fresh broadcast subscription per
/// connection. A lagged subscriber (spec §4.8 "no guaranteed delivery")
/// just resumes from the next event rather than erroring the stream.
pub async fn events(State(engine): State<Engine>) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = engine.events().subscribe();
    let stream = BroadcastStream::new(rx).filter_map(|item| match item {
        Ok(value) => Some(Ok(Event::default().json_data(value).unwrap_or_else(|_| Event::default()))),
        Err(_lagged) => None,
    });
    Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
}
