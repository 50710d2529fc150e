//! Security error taxonomy and its HTTP rendering.

use axum::{
    http::{HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

use crate::security::csrf::CsrfFailure;
use crate::security::rate_limit::RateLimitDecision;

/// Terminal outcomes of the security pipeline.
#[derive(Debug, Clone, Error)]
pub enum SecurityError {
    #[error("rate limit exceeded for class {}", .0.class)]
    RateLimitExceeded(RateLimitDecision),

    #[error("CSRF validation failed: {0}")]
    CsrfInvalid(CsrfFailure),

    #[error("client blocked: {reason}")]
    AutoBlocked { reason: String, retry_after: u64 },

    #[error("dependency unavailable: {0}")]
    UpstreamDependencyUnavailable(String),

    #[error("malformed request: {0}")]
    MalformedRequest(String),

    #[error("address denied: {0}")]
    IpDenied(String),

    #[error("app attestation header required")]
    AppCheckRequired,
}

/// Failures while assembling the guard from configuration.
#[derive(Debug, Error)]
pub enum SetupError {
    #[error("invalid CSRF secret: {0}")]
    CsrfSecret(String),

    #[error("failed to build HTTP client: {0}")]
    HttpClient(String),

    #[error("failed to compile attack signatures: {0}")]
    Signatures(String),
}

/// JSON body for every deny response.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    /// Error code identifier.
    pub error: &'static str,
    /// Human-readable message.
    pub message: String,
    /// CSRF failure reason.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<&'static str>,
    /// Seconds to wait before retrying.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining: Option<u32>,
}

impl ErrorBody {
    fn new(error: &'static str, message: impl Into<String>) -> Self {
        Self {
            error,
            message: message.into(),
            reason: None,
            retry_after: None,
            limit: None,
            remaining: None,
        }
    }
}

impl SecurityError {
    /// Stable error code used in bodies, events and metrics.
    pub fn code(&self) -> &'static str {
        match self {
            Self::RateLimitExceeded(_) => "rate_limit_exceeded",
            Self::CsrfInvalid(_) => "csrf_invalid",
            Self::AutoBlocked { .. } => "auto_blocked",
            Self::UpstreamDependencyUnavailable(_) => "dependency_unavailable",
            Self::MalformedRequest(_) => "malformed_request",
            Self::IpDenied(_) => "ip_denied",
            Self::AppCheckRequired => "app_check_required",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::RateLimitExceeded(_) => StatusCode::TOO_MANY_REQUESTS,
            Self::CsrfInvalid(_) | Self::AutoBlocked { .. } | Self::IpDenied(_) => StatusCode::FORBIDDEN,
            Self::UpstreamDependencyUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::MalformedRequest(_) => StatusCode::BAD_REQUEST,
            Self::AppCheckRequired => StatusCode::UNAUTHORIZED,
        }
    }
}

impl IntoResponse for SecurityError {
    fn into_response(self) -> Response {
        let status = self.status();
        let code = self.code();
        match self {
            Self::RateLimitExceeded(decision) => {
                let mut body = ErrorBody::new(
                    code,
                    format!("Too many requests. Wait {} seconds.", decision.retry_after),
                );
                body.retry_after = Some(decision.retry_after);
                body.limit = Some(decision.limit);
                body.remaining = Some(0);

                let mut response = (status, Json(body)).into_response();
                let headers = response.headers_mut();
                decision.apply_headers(headers);
                headers.insert("retry-after", HeaderValue::from(decision.retry_after));
                response
            }
            Self::CsrfInvalid(failure) => {
                let mut body = ErrorBody::new(code, failure.to_string());
                body.reason = Some(failure.as_str());
                (status, Json(body)).into_response()
            }
            Self::AutoBlocked { retry_after, .. } => {
                let mut body = ErrorBody::new(code, "Access temporarily blocked.");
                body.retry_after = Some(retry_after);
                let mut response = (status, Json(body)).into_response();
                response
                    .headers_mut()
                    .insert("retry-after", HeaderValue::from(retry_after));
                response
            }
            Self::UpstreamDependencyUnavailable(_) => {
                // Internal dependency names stay out of the body.
                (status, Json(ErrorBody::new(code, "Service temporarily unavailable."))).into_response()
            }
            Self::MalformedRequest(message) => (status, Json(ErrorBody::new(code, message))).into_response(),
            Self::IpDenied(_) => (status, Json(ErrorBody::new(code, "Access denied."))).into_response(),
            Self::AppCheckRequired => {
                (status, Json(ErrorBody::new(code, "App attestation required."))).into_response()
            }
        }
    }
}
