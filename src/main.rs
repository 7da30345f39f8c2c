//! `scenevaultd` — boots an [`scenevault::Engine`], restores any jobs
//! persisted by a prior run, and serves the HTTP surface from spec §6.

use std::time::Duration;

use scenevault::{Engine, EngineConfig};

const ORPHAN_REAPER_POLL: Duration = Duration::from_secs(30);
const ORPHAN_REAPER_MAX_IDLE: Duration = Duration::from_secs(120);
const ORPHAN_REAPER_MIN_AGE: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = EngineConfig::from_env();
    tracing::info!(media_root = %config.media_root.display(), "starting scenevaultd");

    let missing = config.missing_dependencies();
    if !missing.is_empty() {
        tracing::warn!(?missing, "one or more configured binaries are not on PATH; jobs that need them will fail");
    }

    let engine = Engine::bootstrap(config)?;
    engine.start_orphan_reaper(ORPHAN_REAPER_POLL, ORPHAN_REAPER_MAX_IDLE, ORPHAN_REAPER_MIN_AGE);

    let addr = std::env::var("SCENEVAULT_HTTP_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "listening");

    let app = scenevault::http::router(engine);
    axum::serve(listener, app).await?;
    Ok(())
}
