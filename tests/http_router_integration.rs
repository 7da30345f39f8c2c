//! End-to-end exercise of the `http` layer's wire contract (spec §6.2/§6.3)
//! against a real [`scenevault::Engine`] backed by a temp directory — no
//! real ffmpeg involved since these paths never reach a generator.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use scenevault::{Engine, EngineConfig};
use tower::ServiceExt;

fn test_engine(root: &std::path::Path) -> Engine {
    let mut config = EngineConfig::from_env();
    config.media_root = root.to_path_buf();
    config.state_dir = root.join(".artifacts");
    config.job_persist_disable = true;
    Engine::bootstrap(config).unwrap()
}

#[tokio::test]
async fn submitting_an_unknown_task_is_rejected_with_bad_request() {
    let dir = tempfile::tempdir().unwrap();
    let engine = test_engine(dir.path());
    let app = scenevault::http::router(engine);

    let body = serde_json::json!({"task": "not-a-real-task"});
    let request = Request::builder()
        .method("POST")
        .uri("/jobs")
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_vec(&body).unwrap()))
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn missing_artifact_returns_404() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("clip.mp4"), b"not a real video, just needs to exist").unwrap();
    let engine = test_engine(dir.path());
    let app = scenevault::http::router(engine);

    let request = Request::builder()
        .uri("/artifacts/thumbnail/clip.mp4")
        .body(Body::empty())
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn job_list_starts_empty_and_reflects_a_submitted_metadata_job() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("clip.mp4"), b"not a real video, just needs to exist").unwrap();
    let engine = test_engine(dir.path());
    let app = scenevault::http::router(engine);

    let body = serde_json::json!({"task": "metadata", "params": {"targets": ["clip.mp4"]}});
    let request = Request::builder()
        .method("POST")
        .uri("/jobs")
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_vec(&body).unwrap()))
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let request = Request::builder().uri("/jobs").body(Body::empty()).unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let jobs: Vec<serde_json::Value> = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0]["type"], "metadata");
}
