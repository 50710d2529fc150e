//! Request identification.
//!
//! # Responsibilities
//! - Generate a unique request ID (UUID v4) for every inbound request
//! - Propagate it to the upstream and back to the client
//!
//! # Design Decisions
//! - Request ID added as early as possible for tracing
//! - A client-supplied `x-request-id` is kept as-is

use axum::http::{HeaderName, HeaderValue, Request};
use tower_http::request_id::{
    MakeRequestId, PropagateRequestIdLayer, RequestId as TowerRequestId, SetRequestIdLayer,
};
use uuid::Uuid;

pub const X_REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");

/// Generates UUID v4 request IDs.
#[derive(Debug, Clone, Copy, Default)]
pub struct RequestId;

impl MakeRequestId for RequestId {
    fn make_request_id<B>(&mut self, _request: &Request<B>) -> Option<TowerRequestId> {
        HeaderValue::from_str(&Uuid::new_v4().to_string())
            .ok()
            .map(TowerRequestId::new)
    }
}

/// Layers that set and echo `x-request-id`.
pub struct RequestIdLayer;

impl RequestIdLayer {
    pub fn set() -> SetRequestIdLayer<RequestId> {
        SetRequestIdLayer::new(X_REQUEST_ID, RequestId)
    }

    pub fn propagate() -> PropagateRequestIdLayer {
        PropagateRequestIdLayer::new(X_REQUEST_ID)
    }
}

/// Access to the request ID on a request.
pub trait RequestIdExt {
    fn request_id(&self) -> &str;
}

impl<B> RequestIdExt for Request<B> {
    fn request_id(&self) -> &str {
        self.headers()
            .get(X_REQUEST_ID)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("unknown")
    }
}
