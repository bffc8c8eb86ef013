//! Authentication for the local device API and the owner account.
//!
//! The API is guarded by a pre-shared key; the owner role by a PIN.
//! Secrets are always compared in constant time.

mod accounts;

pub use accounts::*;

use axum::{
    extract::Request,
    http::{header, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use subtle::ConstantTimeEq;

use crate::errors::{codes, ErrorDetails, ErrorResponse};

/// Header carrying the device API key.
pub const API_KEY_HEADER: &str = "x-api-key";

/// Key presented by the caller, from `x-api-key` or a bearer token.
fn presented_key(request: &Request) -> Option<&str> {
    let headers = request.headers();
    headers
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .or_else(|| {
            headers
                .get(header::AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.strip_prefix("Bearer "))
        })
}

/// Reject requests whose key does not match `expected_psk`.
///
/// With no key configured the API is open, which is only meant for development.
pub async fn psk_auth_layer(
    expected_psk: Option<String>,
    request: Request,
    next: Next,
) -> Response {
    let Some(expected) = expected_psk else {
        return next.run(request).await;
    };

    let matches = presented_key(&request).map(|key| constant_time_compare(key, &expected));
    match matches {
        Some(true) => next.run(request).await,
        Some(false) => {
            tracing::warn!(path = %request.uri().path(), "Rejected request with invalid API key");
            unauthorized_response("Invalid API key")
        }
        None => unauthorized_response("Missing API key"),
    }
}

/// Perform constant-time string comparison.
pub(crate) fn constant_time_compare(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

fn unauthorized_response(message: &str) -> Response {
    let body = ErrorResponse {
        success: false,
        error: ErrorDetails {
            code: codes::UNAUTHORIZED.to_string(),
            message: message.to_string(),
            details: None,
        },
        revision_id: 0,
    };

    (StatusCode::UNAUTHORIZED, Json(body)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    use axum::body::Body;

    #[test]
    fn test_constant_time_compare() {
        assert!(constant_time_compare("device-key", "device-key"));
        assert!(!constant_time_compare("device-key", "device-kez"));
        assert!(!constant_time_compare("short", "much-longer-key"));
        assert!(!constant_time_compare("", "not-empty"));
    }

    #[test]
    fn test_presented_key_prefers_api_key_header() {
        let request = Request::builder()
            .header(API_KEY_HEADER, "from-header")
            .header(header::AUTHORIZATION, "Bearer from-bearer")
            .body(Body::empty())
            .unwrap();
        assert_eq!(presented_key(&request), Some("from-header"));

        let request = Request::builder()
            .header(header::AUTHORIZATION, "Bearer from-bearer")
            .body(Body::empty())
            .unwrap();
        assert_eq!(presented_key(&request), Some("from-bearer"));

        let request = Request::builder().body(Body::empty()).unwrap();
        assert_eq!(presented_key(&request), None);
    }
}
