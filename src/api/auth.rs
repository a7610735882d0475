// =============================================================================
// Bearer Token Authentication — Axum extractor
// =============================================================================
//
// Validates `Authorization: Bearer <token>` against the admin token captured
// at startup from `HEDGE_ADMIN_TOKEN`. Comparison runs in constant time.
//
//   async fn handler(_auth: AuthBearer, ...) { ... }
//
// A missing, malformed or wrong token short-circuits with 403 before the
// handler body executes.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{FromRef, FromRequestParts},
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
};
use tracing::warn;

use super::ApiState;

/// Environment variable holding the admin token.
pub const ADMIN_TOKEN_ENV: &str = "HEDGE_ADMIN_TOKEN";

/// Byte-wise comparison that always walks the full slice.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result: u8 = 0;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}

/// Proof that the request carried the admin token.
pub struct AuthBearer;

/// Rejection type returned when authentication fails.
pub struct AuthRejection {
    status: StatusCode,
    message: &'static str,
}

impl AuthRejection {
    fn forbidden(message: &'static str) -> Self {
        Self {
            status: StatusCode::FORBIDDEN,
            message,
        }
    }
}

impl IntoResponse for AuthRejection {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": self.message,
        });
        (self.status, axum::Json(body)).into_response()
    }
}

#[axum::async_trait]
impl<S> FromRequestParts<S> for AuthBearer
where
    Arc<ApiState>: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = AuthRejection;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let api = Arc::<ApiState>::from_ref(state);
        let expected = api.admin_token.as_str();

        if expected.is_empty() {
            warn!("{ADMIN_TOKEN_ENV} is not set — authenticated requests rejected");
            return Err(AuthRejection::forbidden("Server authentication not configured"));
        }

        let token = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "));

        let Some(token) = token else {
            warn!("Missing or malformed Authorization header");
            return Err(AuthRejection::forbidden("Missing or invalid authorization token"));
        };

        if !constant_time_eq(token.as_bytes(), expected.as_bytes()) {
            warn!("Invalid admin token presented");
            return Err(AuthRejection::forbidden("Invalid authorization token"));
        }

        Ok(AuthBearer)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_time_eq_identical() {
        assert!(constant_time_eq(b"hedge-admin", b"hedge-admin"));
    }

    #[test]
    fn constant_time_eq_different() {
        assert!(!constant_time_eq(b"hedge-admin", b"hedge-admim"));
    }

    #[test]
    fn constant_time_eq_different_lengths() {
        assert!(!constant_time_eq(b"short", b"longer_string"));
    }

    #[test]
    fn constant_time_eq_empty() {
        assert!(constant_time_eq(b"", b""));
    }
}
