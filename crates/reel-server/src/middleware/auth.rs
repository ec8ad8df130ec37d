//! Shared-secret authentication.
//!
//! When `auth.transcoder_secret` is configured every protected route
//! requires a matching `X-Transcoder-Secret` header. Without a configured
//! secret the surface is open.

use axum::extract::State;
use axum::http::{HeaderName, Request};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use crate::context::AppContext;
use crate::error::AppError;

/// Header carrying the shared secret, in both directions.
pub static X_TRANSCODER_SECRET: HeaderName = HeaderName::from_static("x-transcoder-secret");

/// Compare without short-circuiting on the first differing byte.
pub fn secrets_match(expected: &str, provided: &str) -> bool {
    let (a, b) = (expected.as_bytes(), provided.as_bytes());
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

pub async fn secret_middleware(
    State(ctx): State<AppContext>,
    request: Request<axum::body::Body>,
    next: Next,
) -> Response {
    let Some(expected) = ctx.config.auth.transcoder_secret.as_deref() else {
        return next.run(request).await;
    };

    let provided = request
        .headers()
        .get(&X_TRANSCODER_SECRET)
        .and_then(|v| v.to_str().ok());

    match provided {
        Some(p) if secrets_match(expected, p) => next.run(request).await,
        Some(_) => {
            tracing::warn!(path = %request.uri().path(), "Rejected request with wrong secret");
            AppError::new(reel_core::Error::Unauthorized("invalid transcoder secret".into()))
                .into_response()
        }
        None => AppError::new(reel_core::Error::Unauthorized(
            "missing X-Transcoder-Secret header".into(),
        ))
        .into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matching_requires_equal_bytes() {
        assert!(secrets_match("s3cret", "s3cret"));
        assert!(!secrets_match("s3cret", "s3cres"));
        assert!(!secrets_match("s3cret", "s3cret!"));
        assert!(!secrets_match("s3cret", ""));
    }
}
