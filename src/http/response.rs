//! Response handling and transformation.
//!
//! # Responsibilities
//! - Strip hop-by-hop headers from upstream responses
//! - Map upstream failures to JSON error responses
//!
//! # Design Decisions
//! - Streaming responses avoid buffering entire body
//! - Upstream timeouts result in 504 Gateway Timeout
//! - Error bodies never include upstream internals

use axum::{
    http::{header, HeaderMap, HeaderName, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// Headers meaningful only for a single transport hop.
const HOP_BY_HOP: [HeaderName; 7] = [
    header::CONNECTION,
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP.iter() {
        headers.remove(name);
    }
    headers.remove("keep-alive");
}

/// JSON error body in the same shape the security layer uses.
pub fn error_response(status: StatusCode, code: &str, message: &str) -> Response {
    (status, Json(json!({ "error": code, "message": message }))).into_response()
}

pub fn bad_gateway() -> Response {
    error_response(StatusCode::BAD_GATEWAY, "upstream_error", "Upstream request failed")
}

pub fn gateway_timeout() -> Response {
    error_response(StatusCode::GATEWAY_TIMEOUT, "upstream_timeout", "Upstream did not respond in time")
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_strip_hop_by_hop() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert(header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/html"));

        strip_hop_by_hop(&mut headers);
        assert_eq!(headers.len(), 1);
        assert!(headers.contains_key(header::CONTENT_TYPE));
    }

    #[test]
    fn test_error_statuses() {
        assert_eq!(bad_gateway().status(), StatusCode::BAD_GATEWAY);
        assert_eq!(gateway_timeout().status(), StatusCode::GATEWAY_TIMEOUT);
    }
}
