use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use reel_protocol::UploadResponse;
use thiserror::Error;

/// Error kinds surfaced by the relay core.
///
/// The HTTP boundary serializes `BadRequest`/`NotFound` as 400/404 with the
/// JSON envelope; everything else that reaches a handler is a server-side
/// failure. Transient errors on signaling or RTSP sessions never reach the
/// HTTP boundary — they close the offending peer or session only.
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("transient: {0}")]
    Transient(String),
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("fatal: {0}")]
    Fatal(String),
}

pub type Result<T> = std::result::Result<T, RelayError>;

impl RelayError {
    fn status(&self) -> StatusCode {
        match self {
            RelayError::BadRequest(_) => StatusCode::BAD_REQUEST,
            RelayError::NotFound(_) => StatusCode::NOT_FOUND,
            RelayError::Transient(_) => StatusCode::INTERNAL_SERVER_ERROR,
            RelayError::ResourceExhausted(_) => StatusCode::SERVICE_UNAVAILABLE,
            RelayError::InvalidState(_) => StatusCode::CONFLICT,
            RelayError::Fatal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<std::io::Error> for RelayError {
    fn from(err: std::io::Error) -> Self {
        RelayError::Transient(err.to_string())
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = Json(UploadResponse::failure(status.as_u16(), self.to_string()));
        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert_eq!(
            RelayError::BadRequest("x".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            RelayError::NotFound("x".into()).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            RelayError::ResourceExhausted("x".into()).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            RelayError::Transient("x".into()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn io_error_is_transient() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe");
        let err: RelayError = io.into();
        assert!(matches!(err, RelayError::Transient(_)));
    }
}
