use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use reelcast_core::error::{ApiError, ErrorEnvelope};
use reelcast_transcoder::TranscodeError;

use crate::catalog::CatalogError;

/// Newtype wrapper so we can implement `IntoResponse` in this crate.
pub struct AppError(pub ApiError);

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.status_code())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            tracing::warn!(status = status.as_u16(), error = %self.0, "request failed");
        }
        let envelope = ErrorEnvelope::from(&self.0);
        (status, Json(envelope)).into_response()
    }
}

impl From<ApiError> for AppError {
    fn from(e: ApiError) -> Self {
        Self(e)
    }
}

impl From<TranscodeError> for AppError {
    fn from(e: TranscodeError) -> Self {
        let msg = e.to_string();
        let api = match e {
            TranscodeError::InvalidRepresentationId(_) => ApiError::BadRequest(msg),
            TranscodeError::NoSuchSegment(_) => ApiError::NotFound(msg),
            TranscodeError::ProbeFailed(_) | TranscodeError::InvalidInterval(_) => {
                ApiError::Unprocessable(msg)
            }
            TranscodeError::SegmentTimeout { .. } | TranscodeError::SessionLimit(_) => {
                ApiError::Unavailable(msg)
            }
            TranscodeError::UnknownPreset(_)
            | TranscodeError::SessionCreate(_)
            | TranscodeError::SessionStart(_)
            | TranscodeError::InvalidPlan(_)
            | TranscodeError::Manifest(_)
            | TranscodeError::Io(_) => ApiError::Internal(msg),
        };
        Self(api)
    }
}

impl From<CatalogError> for AppError {
    fn from(e: CatalogError) -> Self {
        let msg = e.to_string();
        Self(match e {
            CatalogError::InvalidId(_) => ApiError::BadRequest(msg),
            CatalogError::NotFound(_) => ApiError::NotFound(msg),
            CatalogError::Io(_) => ApiError::Internal(msg),
        })
    }
}
