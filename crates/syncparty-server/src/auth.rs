use axum::body::Body;
use axum::extract::Request;
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::Response;

use crate::error::AppError;

/// Operator API authentication.
#[derive(Debug, Clone, Default)]
pub struct AuthConfig {
    /// Bearer token for REST API access. None = auth disabled.
    pub bearer_token: Option<String>,
}

impl AuthConfig {
    /// Whether `headers` carry the configured token (always true when
    /// auth is disabled).
    pub fn authorizes(&self, headers: &HeaderMap) -> bool {
        let Some(expected) = &self.bearer_token else {
            return true;
        };
        headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .is_some_and(|token| token == expected)
    }
}

/// Axum middleware that validates Bearer token authentication.
/// Expects the [`AuthConfig`] in the request extensions; without one, all
/// requests are allowed through.
pub async fn bearer_auth_middleware(request: Request<Body>, next: Next) -> Result<Response, AppError> {
    let auth_config = request
        .extensions()
        .get::<AuthConfig>()
        .cloned()
        .unwrap_or_default();

    if !auth_config.authorizes(request.headers()) {
        return Err(AppError::Unauthorized("missing or invalid bearer token".into()));
    }

    Ok(next.run(request).await)
}
