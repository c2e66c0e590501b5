use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use reelcast_server::catalog::DirectoryCatalog;
use reelcast_server::config::ServerConfig;
use reelcast_server::lifecycle::{serve_until, shutdown_signal};
use reelcast_server::state::AppState;
use reelcast_transcoder::registry::IdleTimeout;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const MIN_REAP_INTERVAL: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = ServerConfig::from_env();
    info!(
        media_dir = %config.media_dir.display(),
        transcode_dir = %config.transcoder.transcode_dir.display(),
        ffmpeg = %config.transcoder.ffmpeg_path.display(),
        segment_secs = config.transcoder.segment_duration.as_secs_f64(),
        segments_per_session = config.transcoder.segments_per_session,
        max_sessions = config.transcoder.max_sessions,
        "starting reelcast"
    );

    std::fs::create_dir_all(&config.transcoder.transcode_dir)
        .context("failed to create transcode dir")?;
    match reelcast_transcoder::session::sweep_orphans(&config.transcoder.transcode_dir).await {
        Ok(0) => {}
        Ok(removed) => info!(removed, "removed leftover transcode dirs"),
        Err(e) => warn!(error = %e, "failed to sweep transcode dir"),
    }

    let catalog = Arc::new(DirectoryCatalog::new(&config.media_dir));
    let state = AppState::new(config.transcoder.clone(), catalog);

    let every = (config.transcoder.idle_timeout / 4).max(MIN_REAP_INTERVAL);
    let reaper = state
        .sessions
        .spawn_reaper(IdleTimeout(config.transcoder.idle_timeout), every);

    let listener = tokio::net::TcpListener::bind(&config.bind)
        .await
        .with_context(|| format!("failed to bind {}", config.bind))?;
    info!(addr = %config.bind, "server listening");

    let result = serve_until(listener, state, shutdown_signal()).await;
    reaper.abort();
    result.map(|_| ())
}
