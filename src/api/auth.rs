// =============================================================================
// Dashboard Authentication — shared bearer token
// =============================================================================
//
// A single shared token, read from `VIGIL_API_TOKEN`, gates every endpoint
// except the health check. The REST surface consumes it from the
// `Authorization: Bearer` header via the `AuthBearer` extractor; the
// WebSocket upgrade passes it as a query parameter through
// [`validate_token`]. Comparison is constant-time in both paths.
// =============================================================================

use axum::{
    extract::FromRequestParts,
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
};
use tracing::warn;

/// Constant-time byte comparison. Every byte of both slices is examined even
/// after a mismatch, so timing reveals nothing about the prefix. A length
/// mismatch short-circuits: the attacker does not control the expected
/// token's length.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff: u8 = 0;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// The expected token. Read from the environment per call so rotation does
/// not require a restart; empty means authentication is unconfigured and
/// everything is rejected.
fn expected_token() -> String {
    std::env::var("VIGIL_API_TOKEN").unwrap_or_default()
}

/// Validate a raw token string. Used by the WebSocket upgrade, where the
/// token arrives as a query parameter and gates the first-frame handshake.
pub fn validate_token(token: &str) -> bool {
    let expected = expected_token();
    if expected.is_empty() {
        return false;
    }
    constant_time_eq(token.as_bytes(), expected.as_bytes())
}

/// Axum extractor for `Authorization: Bearer <token>`.
///
/// On failure the request is short-circuited with 403 before the handler
/// body runs.
pub struct AuthBearer(pub String);

pub struct AuthRejection(&'static str);

impl IntoResponse for AuthRejection {
    fn into_response(self) -> Response {
        (
            StatusCode::FORBIDDEN,
            axum::Json(serde_json::json!({ "error": self.0 })),
        )
            .into_response()
    }
}

#[axum::async_trait]
impl<S> FromRequestParts<S> for AuthBearer
where
    S: Send + Sync,
{
    type Rejection = AuthRejection;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let expected = expected_token();
        if expected.is_empty() {
            warn!("VIGIL_API_TOKEN is not set — rejecting authenticated request");
            return Err(AuthRejection("server authentication not configured"));
        }

        let token = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "));

        match token {
            Some(token) if constant_time_eq(token.as_bytes(), expected.as_bytes()) => {
                Ok(AuthBearer(token.to_string()))
            }
            Some(_) => {
                warn!("invalid API token presented");
                Err(AuthRejection("invalid authorization token"))
            }
            None => Err(AuthRejection("missing or malformed authorization header")),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
