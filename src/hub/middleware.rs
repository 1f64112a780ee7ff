//! Bearer credential check for the REST surface

use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Request, State},
    http::header,
    middleware::Next,
    response::Response,
};
use tracing::debug;

use super::error::{HubError, HubResult};

/// Extract the token from an `Authorization: Bearer <token>` header value.
fn bearer(value: &str) -> Option<&str> {
    let (scheme, token) = value.split_once(' ')?;
    scheme
        .eq_ignore_ascii_case("bearer")
        .then(|| token.trim())
        .filter(|token| !token.is_empty())
}

pub async fn require_api_token(
    State(expected): State<Arc<str>>,
    request: Request<Body>,
    next: Next,
) -> HubResult<Response> {
    let presented = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or(HubError::Unauthorized("missing Authorization header"))?;

    let token = bearer(presented).ok_or(HubError::Unauthorized(
        "expected Authorization: Bearer <token>",
    ))?;

    if token != &*expected {
        debug!("rejected api request to {}", request.uri().path());
        return Err(HubError::Unauthorized("invalid api token"));
    }

    Ok(next.run(request).await)
}
