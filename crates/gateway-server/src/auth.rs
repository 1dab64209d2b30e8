//! Request Authentication
//!
//! Static bearer-token check against `GATEWAY_AUTH_TOKEN`. When the
//! variable is unset the gateway runs open, which is the expected mode
//! for local single-user deployments. The token may arrive in the
//! `Authorization` header or, for older clients, in the request body.

use axum::http::HeaderMap;

use gateway_core::{GatewayError, Result};

/// Read the expected token from the environment at startup
pub fn expected_token() -> Option<String> {
    std::env::var("GATEWAY_AUTH_TOKEN")
        .ok()
        .filter(|t| !t.is_empty())
}

/// Check a request's credentials against the configured token.
///
/// Rejections happen before any provider call or persistence write.
pub fn authorize(
    expected: Option<&str>,
    headers: &HeaderMap,
    body_token: Option<&str>,
) -> Result<()> {
    let Some(expected) = expected else {
        return Ok(());
    };

    let header_token = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    match header_token.or(body_token) {
        Some(token) if token == expected => Ok(()),
        Some(_) => Err(GatewayError::Unauthorized("invalid token".into())),
        None => Err(GatewayError::Unauthorized("missing token".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::header::AUTHORIZATION;

    #[test]
    fn test_open_mode_accepts_everything() {
        assert!(authorize(None, &HeaderMap::new(), None).is_ok());
    }

    #[test]
    fn test_bearer_header_is_accepted() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, "Bearer sekrit".parse().unwrap());
        assert!(authorize(Some("sekrit"), &headers, None).is_ok());
    }

    #[test]
    fn test_body_token_is_accepted() {
        assert!(authorize(Some("sekrit"), &HeaderMap::new(), Some("sekrit")).is_ok());
    }

    #[test]
    fn test_wrong_or_missing_token_is_rejected() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, "Bearer nope".parse().unwrap());
        assert!(authorize(Some("sekrit"), &headers, None).is_err());
        assert!(authorize(Some("sekrit"), &HeaderMap::new(), None).is_err());
    }
}
