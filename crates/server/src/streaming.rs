use std::path::Path as FsPath;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::Response;
use reelcast_core::error::ApiError;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::debug;

use crate::error::AppError;
use crate::state::AppState;

/// A single satisfiable byte range.
#[derive(Debug, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end_inclusive: u64,
}

impl ByteRange {
    pub fn content_length(&self) -> u64 {
        self.end_inclusive - self.start + 1
    }
}

/// Parse an HTTP Range header per RFC 7233.
/// Only supports single byte ranges: `bytes=start-end`, `bytes=start-` and `bytes=-suffix`.
pub fn parse_range_header(range_str: &str, file_size: u64) -> Result<ByteRange, ApiError> {
    let spec = range_str
        .trim()
        .strip_prefix("bytes=")
        .ok_or_else(|| ApiError::BadRequest("only bytes ranges supported".into()))?;

    if spec.contains(',') {
        return Err(ApiError::BadRequest("multi-range not supported".into()));
    }
    if file_size == 0 {
        return Err(ApiError::BadRequest("range on empty file".into()));
    }

    let (start_s, end_s) = spec
        .split_once('-')
        .ok_or_else(|| ApiError::BadRequest("malformed range".into()))?;

    if start_s.is_empty() {
        let suffix: u64 = end_s
            .parse()
            .map_err(|_| ApiError::BadRequest("bad range suffix".into()))?;
        if suffix == 0 {
            return Err(ApiError::BadRequest("empty suffix range".into()));
        }
        return Ok(ByteRange {
            start: file_size.saturating_sub(suffix),
            end_inclusive: file_size - 1,
        });
    }

    let start: u64 = start_s
        .parse()
        .map_err(|_| ApiError::BadRequest("bad range start".into()))?;
    let end: u64 = if end_s.is_empty() {
        file_size - 1
    } else {
        end_s
            .parse()
            .map_err(|_| ApiError::BadRequest("bad range end".into()))?
    };

    if start >= file_size {
        return Err(ApiError::BadRequest(format!(
            "range start {start} >= file size {file_size}"
        )));
    }
    let end = end.min(file_size - 1);
    if start > end {
        return Err(ApiError::BadRequest("range start > end".into()));
    }

    Ok(ByteRange {
        start,
        end_inclusive: end,
    })
}

/// Content-type guess from file extension.
pub fn content_type_for_path(path: &FsPath) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
        .as_deref()
    {
        Some("mp4" | "m4v") => "video/mp4",
        Some("m4a") => "audio/mp4",
        Some("m4s") => "video/iso.segment",
        Some("mkv") => "video/x-matroska",
        Some("webm") => "video/webm",
        Some("mov") => "video/quicktime",
        Some("ts") => "video/mp2t",
        Some("mp3") => "audio/mpeg",
        Some("flac") => "audio/flac",
        _ => "application/octet-stream",
    }
}

/// Direct play of a catalog file with Range support.
/// GET /files/{file}
pub async fn stream_media_file(
    State(state): State<AppState>,
    Path(file): Path<String>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let path = state.catalog.find_media_file(&file).await?;
    let content_type = content_type_for_path(&path);
    serve_file(&path, content_type, None, &headers).await
}

/// Stream `path` honouring an optional `Range` request header.
pub async fn serve_file(
    path: &FsPath,
    content_type: &str,
    cache_control: Option<&str>,
    headers: &HeaderMap,
) -> Result<Response, AppError> {
    let mut file = tokio::fs::File::open(path)
        .await
        .map_err(|e| ApiError::Internal(format!("file open error: {e}")))?;
    let file_size = file
        .metadata()
        .await
        .map_err(|e| ApiError::Internal(format!("stat error: {e}")))?
        .len();

    let range_header = headers.get(header::RANGE).and_then(|v| v.to_str().ok());
    let mut builder = Response::builder()
        .header(header::CONTENT_TYPE, content_type)
        .header(header::ACCEPT_RANGES, "bytes");
    if let Some(cc) = cache_control {
        builder = builder.header(header::CACHE_CONTROL, cc);
    }

    let response = match range_header {
        Some(raw) => {
            let range = match parse_range_header(raw, file_size) {
                Ok(r) => r,
                Err(e) => {
                    debug!(range = raw, file_size, error = %e, "unsatisfiable range");
                    return finish(
                        Response::builder()
                            .status(StatusCode::RANGE_NOT_SATISFIABLE)
                            .header(header::CONTENT_RANGE, format!("bytes */{file_size}"))
                            .body(Body::empty()),
                    );
                }
            };
            file.seek(std::io::SeekFrom::Start(range.start))
                .await
                .map_err(|e| ApiError::Internal(format!("seek error: {e}")))?;
            let stream = tokio_util::io::ReaderStream::new(file.take(range.content_length()));
            builder
                .status(StatusCode::PARTIAL_CONTENT)
                .header(header::CONTENT_LENGTH, range.content_length().to_string())
                .header(
                    header::CONTENT_RANGE,
                    format!("bytes {}-{}/{file_size}", range.start, range.end_inclusive),
                )
                .body(Body::from_stream(stream))
        }
        None => {
            let stream = tokio_util::io::ReaderStream::new(file);
            builder
                .status(StatusCode::OK)
                .header(header::CONTENT_LENGTH, file_size.to_string())
                .body(Body::from_stream(stream))
        }
    };
    finish(response)
}

fn finish(response: Result<Response, axum::http::Error>) -> Result<Response, AppError> {
    response.map_err(|e| ApiError::Internal(format!("response build error: {e}")).into())
}
