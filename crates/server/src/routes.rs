use std::path::Path as FsPath;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use reelcast_core::error::ApiError;
use reelcast_transcoder::TranscodeError;
use reelcast_transcoder::catalog::split_representation_id;
use reelcast_transcoder::hls::{PLAYLIST_CONTENT_TYPE, build_master_playlist, build_media_playlist};
use reelcast_transcoder::manifest::{DASH_CONTENT_TYPE, build_dash_manifest};
use reelcast_transcoder::registry::SessionKey;
use reelcast_transcoder::session::TranscodingSession;
use reelcast_transcoder::timeline::PlannedSession;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::error::AppError;
use crate::state::AppState;
use crate::streaming::{serve_file, stream_media_file};

const SEGMENT_CACHE_CONTROL: &str = "public, max-age=3600";

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/files/{file}", get(stream_media_file))
        .route("/{file}/manifest.mpd", get(dash_manifest))
        .route("/{file}/master.m3u8", get(hls_master))
        // Covers media.m3u8, init and numbered segments.
        .route("/{file}/{sid}/{rep}/{segment}", get(serve_segment))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "sessions": state.sessions.len().await,
    }))
}

/// GET /{file}/manifest.mpd
///
/// Every manifest request probes the file afresh and hands out a new playback
/// session id through the MPD's BaseURL.
async fn dash_manifest(
    State(state): State<AppState>,
    Path(file): Path<String>,
) -> Result<Response, AppError> {
    let path = state.catalog.find_media_file(&file).await?;
    let timeline = state.timelines.refresh(&state.config, &path).await?;
    let sid = uuid::Uuid::new_v4().to_string();
    let mpd = build_dash_manifest(&timeline, Some(&format!("{sid}/")))?;
    info!(file = %file, sid = %sid, tracks = timeline.tracks.len(), "served DASH manifest");
    Ok(playlist_response(DASH_CONTENT_TYPE, mpd))
}

/// GET /{file}/master.m3u8
async fn hls_master(
    State(state): State<AppState>,
    Path(file): Path<String>,
) -> Result<Response, AppError> {
    let path = state.catalog.find_media_file(&file).await?;
    let timeline = state.timelines.refresh(&state.config, &path).await?;
    let sid = uuid::Uuid::new_v4().to_string();
    let playlist = build_master_playlist(&timeline, &format!("{sid}/"));
    info!(file = %file, sid = %sid, "served HLS master playlist");
    Ok(playlist_response(PLAYLIST_CONTENT_TYPE, playlist))
}

fn playlist_response(content_type: &'static str, body: String) -> Response {
    (
        [
            (header::CONTENT_TYPE, content_type),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        body,
    )
        .into_response()
}

/// What the last path component of a segment URL asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SegmentRequest {
    Playlist,
    Init,
    Media(u32),
}

impl SegmentRequest {
    fn parse(raw: &str) -> Result<Self, ApiError> {
        match raw {
            "media.m3u8" => Ok(Self::Playlist),
            "init" | "init.mp4" => Ok(Self::Init),
            _ => {
                let number = raw.strip_suffix(".m4s").unwrap_or(raw);
                let valid = !number.is_empty() && number.bytes().all(|b| b.is_ascii_digit());
                number
                    .parse()
                    .ok()
                    .filter(|_| valid)
                    .map(Self::Media)
                    .ok_or_else(|| ApiError::BadRequest(format!("invalid segment name: {raw}")))
            }
        }
    }
}

fn validate_sid(sid: &str) -> Result<(), ApiError> {
    let ok = !sid.is_empty()
        && sid.len() <= 64
        && sid.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-');
    if ok {
        Ok(())
    } else {
        Err(ApiError::BadRequest(format!("invalid playback session id: {sid}")))
    }
}

/// GET /{file}/{sid}/{rep}/{segment}
async fn serve_segment(
    State(state): State<AppState>,
    Path((file, sid, rep, segment)): Path<(String, String, String, String)>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    validate_sid(&sid)?;
    let request = SegmentRequest::parse(&segment)?;
    let (_, stream_id) = split_representation_id(&rep)?;

    let path = state.catalog.find_media_file(&file).await?;
    let timeline = state.timelines.get_or_load(&state.config, &path).await?;

    let segment_id = match request {
        SegmentRequest::Playlist => {
            let playlist = build_media_playlist(&timeline, &rep)?;
            return Ok(playlist_response(PLAYLIST_CONTENT_TYPE, playlist));
        }
        SegmentRequest::Init => 0,
        SegmentRequest::Media(n) => n,
    };

    let planned = timeline.locate(&rep, segment_id)?;
    let content_type = planned.track.stream.kind.mp4_mime();
    // The init segment is the same for every session of a representation, so
    // a player seeking mid-stream takes it from whichever session it is
    // already pulling from instead of starting one at segment 0.
    let live = match request {
        SegmentRequest::Init => {
            state
                .sessions
                .most_recent(|k| k.file == path && k.representation_id == rep)
                .await
        }
        _ => None,
    };
    let (key, session, created) = match live {
        Some((key, session)) => (key, session, false),
        None => resolve_session(&state, &path, planned).await?,
    };

    let timeout = if created || !session.init_ready().await {
        state.config.timeouts.startup
    } else {
        state.config.timeouts.steady
    };
    debug!(
        sid = %sid,
        session_id = session.id(),
        segment = ?request,
        timeout_ms = timeout.as_millis() as u64,
        "waiting for segment"
    );

    let result = match request {
        SegmentRequest::Init => session.initial_segment(stream_id, timeout).await,
        _ => session.get_segment(stream_id, segment_id, timeout).await,
    };
    let output = match result {
        Ok(output) => output,
        Err(e @ TranscodeError::SegmentTimeout { .. }) => {
            // A dead encoder will never produce the segment; drop it so the
            // next request starts a fresh one.
            if !session.is_running().await && state.sessions.evict(&key, &session).await {
                warn!(session_id = session.id(), "evicted exited transcoding session");
            }
            return Err(e.into());
        }
        Err(e) => return Err(e.into()),
    };
    serve_file(&output, content_type, Some(SEGMENT_CACHE_CONTROL), &headers).await
}

/// Find or create the session producing `planned`, starting it if this call
/// created it. A session that fails to start is unregistered again.
async fn resolve_session(
    state: &AppState,
    path: &FsPath,
    planned: PlannedSession<'_>,
) -> Result<(SessionKey, Arc<TranscodingSession>, bool), AppError> {
    let key = SessionKey {
        file: path.to_path_buf(),
        representation_id: planned.representation.representation.id.clone(),
        start_index: planned.start_index(),
    };
    let (session, created) = state
        .sessions
        .get_or_create(key.clone(), || {
            TranscodingSession::new(
                &state.config,
                path,
                planned.representation.clone(),
                planned.segments,
            )
        })
        .await?;

    if created {
        if let Err(e) = session.start().await {
            state.sessions.remove_and_destroy(&key).await;
            return Err(e.into());
        }
        if !state.config.warmup_delay.is_zero() {
            tokio::time::sleep(state.config.warmup_delay).await;
        }
    }
    Ok((key, session, created))
}
