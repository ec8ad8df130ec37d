//! Error-to-HTTP response conversion.
//!
//! Route handlers return `Result<T, AppError>`; `?` on a
//! [`reel_core::Error`] converts automatically.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

/// Wrapper so we can implement `IntoResponse` for an external type.
pub struct AppError {
    inner: reel_core::Error,
    request_id: Option<String>,
}

impl AppError {
    pub fn new(inner: reel_core::Error) -> Self {
        Self {
            inner,
            request_id: None,
        }
    }

    pub fn with_request_id(mut self, id: String) -> Self {
        self.request_id = Some(id);
        self
    }

    pub fn inner(&self) -> &reel_core::Error {
        &self.inner
    }
}

impl From<reel_core::Error> for AppError {
    fn from(e: reel_core::Error) -> Self {
        Self::new(e)
    }
}

/// Stable machine-readable code for an error.
pub fn error_code(error: &reel_core::Error) -> &'static str {
    use reel_core::Error;
    match error {
        Error::InvalidIdentifier(_) => "invalid_identifier",
        Error::Probe(_) => "probe_error",
        Error::Transcode { .. } => "transcode_error",
        Error::Derivative(_) => "derivative_error",
        Error::ConcurrentUpload { .. } => "concurrent_upload",
        Error::Cancelled(_) => "cancelled",
        Error::Tool { .. } => "tool_error",
        Error::Validation(_) => "validation_error",
        Error::NotFound { .. } => "not_found",
        Error::Unauthorized(_) => "unauthorized",
        Error::Database { .. } => "database_error",
        Error::Io { .. } => "io_error",
        Error::Internal(_) => "internal_error",
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.inner.http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        if status.is_server_error() {
            tracing::error!(
                status = %status,
                error = %self.inner,
                "Server error in API handler"
            );
        }

        let body = json!({
            "error": self.inner.to_string(),
            "code": error_code(&self.inner),
            "request_id": self.request_id,
        });

        (status, axum::Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_produces_404() {
        let err = AppError::new(reel_core::Error::not_found("video", "abc"));
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn concurrent_upload_produces_409() {
        let err = AppError::new(reel_core::Error::concurrent_upload("video:abc"));
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[test]
    fn invalid_identifier_produces_400() {
        let err = AppError::new(reel_core::Error::InvalidIdentifier("..".into()));
        assert_eq!(err.into_response().status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn with_request_id() {
        let err = AppError::new(reel_core::Error::Internal("oops".into()))
            .with_request_id("req-123".into());
        assert_eq!(err.request_id.as_deref(), Some("req-123"));
    }
}
