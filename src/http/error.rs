//! Maps the core's error taxonomy (spec §7) onto HTTP status codes for the
//! handful of endpoints in [`super`] that can fail synchronously (job
//! submission, artifact lookup, manual marker edits). Job *execution*
//! failures never go through here — those land on the job record's
//! `error` field and are observed via polling or SSE, per spec §6.2/§6.3.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

use crate::error::Error;

pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            Error::Conflict(_) => StatusCode::CONFLICT,
            Error::Canceled => StatusCode::OK,
            Error::Timeout(_)
            | Error::NonzeroExit { .. }
            | Error::DependencyMissing(_)
            | Error::StubRejected { .. }
            | Error::Other(_)
            | Error::Io(_)
            | Error::Json(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = json!({"error": self.0.to_string()});
        (status, axum::Json(body)).into_response()
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;
