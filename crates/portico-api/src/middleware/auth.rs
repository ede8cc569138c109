//! Bearer token authentication
//!
//! Every protected route requires `Authorization: Bearer <token>` matching the
//! configured admin token. Without a configured token the check is disabled.

use axum::{
    extract::{Request, State},
    http::{header, StatusCode},
    middleware::Next,
    response::Response,
    Json,
};
use std::sync::Arc;
use tracing::debug;

use crate::models::ErrorResponse;

/// Token protected routes are checked against
#[derive(Clone, Default)]
pub struct AdminToken(Option<String>);

impl AdminToken {
    pub fn new(token: Option<String>) -> Self {
        Self(token.filter(|t| !t.is_empty()))
    }

    pub fn is_enabled(&self) -> bool {
        self.0.is_some()
    }

    fn matches(&self, presented: &str) -> bool {
        match &self.0 {
            Some(expected) => constant_time_eq(expected.as_bytes(), presented.as_bytes()),
            None => true,
        }
    }
}

impl std::fmt::Debug for AdminToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("AdminToken")
            .field(&self.0.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

fn unauthorized(error: &str, code: &str) -> (StatusCode, Json<ErrorResponse>) {
    (
        StatusCode::UNAUTHORIZED,
        Json(ErrorResponse {
            error: error.to_string(),
            code: Some(code.to_string()),
        }),
    )
}

/// Reject requests without the admin bearer token
///
/// # Errors
/// Returns 401 Unauthorized if:
/// - The Authorization header is missing
/// - The header is not a Bearer token
/// - The token does not match
pub async fn require_admin_token(
    State(token): State<Arc<AdminToken>>,
    request: Request,
    next: Next,
) -> Result<Response, (StatusCode, Json<ErrorResponse>)> {
    if !token.is_enabled() {
        return Ok(next.run(request).await);
    }

    let auth_header = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .ok_or_else(|| unauthorized("Missing Authorization header", "MISSING_AUTH"))?;

    let presented = auth_header.strip_prefix("Bearer ").ok_or_else(|| {
        unauthorized(
            "Invalid Authorization header format. Expected 'Bearer <token>'",
            "INVALID_AUTH_FORMAT",
        )
    })?;

    if !token.matches(presented.trim()) {
        debug!(path = %request.uri().path(), "Rejected request with invalid admin token");
        return Err(unauthorized("Invalid admin token", "INVALID_TOKEN"));
    }

    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_matching() {
        let token = AdminToken::new(Some("s3cret".to_string()));
        assert!(token.is_enabled());
        assert!(token.matches("s3cret"));
        assert!(!token.matches("s3cre"));
        assert!(!token.matches("s3cret!"));

        let open = AdminToken::new(Some(String::new()));
        assert!(!open.is_enabled());
        assert!(open.matches("anything"));
    }

    #[test]
    fn test_debug_redacts_token() {
        let token = AdminToken::new(Some("s3cret".to_string()));
        assert!(!format!("{token:?}").contains("s3cret"));
    }
}
