//! HTTP handler layer — deliberately out of the core's scope (spec §1), but
//! wired up here so the crate runs end to end. Every handler is a thin
//! adapter over [`Engine`]'s public methods (spec §6.2's wire protocol
//! surface); none of the artifact/job/scheduling logic lives in this module.

mod error;
mod jobs;
mod markers;
mod media;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::engine::Engine;

pub fn router(engine: Engine) -> Router {
    Router::new()
        .route("/jobs", post(jobs::submit).get(jobs::list))
        .route("/jobs/:id", get(jobs::get))
        .route("/jobs/:id/cancel", post(jobs::cancel))
        .route("/jobs/cancel_all", post(jobs::cancel_all))
        .route("/jobs/cancel_queued", post(jobs::cancel_queued))
        .route("/jobs/clear_completed", post(jobs::clear_completed))
        .route("/events", get(jobs::events))
        .route("/concurrency/ffmpeg", post(jobs::set_ffmpeg_concurrency))
        .route("/concurrency/jobs", post(jobs::set_job_concurrency))
        .route("/pause", post(jobs::set_paused))
        .route("/markers", post(markers::set_marker).delete(markers::delete_marker))
        .route("/markers/intro", post(markers::set_intro))
        .route("/markers/outro", post(markers::set_outro))
        .route("/artifacts/:kind/*path", get(media::serve_artifact))
        .route("/media/*path", get(media::serve_media))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(engine)
}
