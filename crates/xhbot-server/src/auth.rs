//! Handshake authentication.
//!
//! Runs before the WebSocket upgrade completes, so a rejected client never
//! reaches the registry or the message loop.

use axum::http::header::AUTHORIZATION;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use xhbot_core::security::parse_token_header;
use xhbot_core::{AuthError, BotToken, TokenValidator};

/// Check `Authorization: Token <value>` against the validator.
///
/// The validator is only consulted for a well-formed header.
pub fn authenticate(headers: &HeaderMap, validator: &dyn TokenValidator) -> Result<BotToken, AuthError> {
    let header = headers
        .get(AUTHORIZATION)
        .ok_or(AuthError::Missing("no Authorization header"))?;
    let value = header
        .to_str()
        .map_err(|_| AuthError::Missing("Authorization header is not visible ASCII"))?;
    let token = parse_token_header(value).ok_or(AuthError::Missing("expected `Token <value>`"))?;

    if !validator.validate(token.expose()) {
        return Err(AuthError::Invalid);
    }
    Ok(token)
}

/// HTTP response for a failed handshake.
pub fn rejection(err: &AuthError) -> Response {
    let status = StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::UNAUTHORIZED);
    let body = serde_json::json!({
        "error": err.error_kind(),
        "message": err.to_string(),
    });
    (status, Json(body)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingValidator {
        accept: &'static str,
        calls: AtomicUsize,
    }

    impl CountingValidator {
        fn new(accept: &'static str) -> Self {
            Self {
                accept,
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl TokenValidator for CountingValidator {
        fn validate(&self, token: &str) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst);
            token == self.accept
        }
    }

    fn headers(auth: Option<&'static str>) -> HeaderMap {
        let mut h = HeaderMap::new();
        if let Some(v) = auth {
            h.insert(AUTHORIZATION, HeaderValue::from_static(v));
        }
        h
    }

    #[test]
    fn valid_token_accepted() {
        let v = CountingValidator::new("abc123");
        let token = authenticate(&headers(Some("Token abc123")), &v).unwrap();
        assert_eq!(token.expose(), "abc123");
        assert_eq!(v.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn lowercase_scheme_accepted() {
        let v = CountingValidator::new("abc123");
        assert!(authenticate(&headers(Some("token abc123")), &v).is_ok());
    }

    #[test]
    fn malformed_headers_never_reach_validator() {
        let v = CountingValidator::new("abc123");
        for h in [
            headers(None),
            headers(Some("Bearer abc123")),
            headers(Some("Token ")),
            headers(Some("Token    ")),
            headers(Some("abc123")),
        ] {
            let err = authenticate(&h, &v).unwrap_err();
            assert_eq!(err.status_code(), 401, "got: {err}");
        }
        assert_eq!(v.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn unknown_token_is_forbidden() {
        let v = CountingValidator::new("abc123");
        let err = authenticate(&headers(Some("Token nope")), &v).unwrap_err();
        assert_eq!(err, AuthError::Invalid);
        assert_eq!(err.status_code(), 403);
    }

    #[test]
    fn non_ascii_header_is_unauthorized() {
        let v = CountingValidator::new("abc123");
        let mut h = HeaderMap::new();
        h.insert(AUTHORIZATION, HeaderValue::from_bytes(b"Token \xff\xfe").unwrap());
        assert!(matches!(authenticate(&h, &v), Err(AuthError::Missing(_))));
    }

    #[test]
    fn rejection_statuses() {
        assert_eq!(
            rejection(&AuthError::Missing("x")).status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(rejection(&AuthError::Invalid).status(), StatusCode::FORBIDDEN);
    }
}
