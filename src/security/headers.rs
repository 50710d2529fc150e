//! CSP nonce generation and security response headers.
//!
//! # Responsibilities
//! - One random nonce per request, exposed to the upstream renderer through
//!   the `x-nonce` request header and a request extension
//! - Content-Security-Policy embedding that nonce
//! - Static hardening headers on every response, deny responses included
//!
//! # Design Decisions
//! - Nonces are never cached or reused; the CSP header is rebuilt per response
//! - Upstream-provided values for these headers are overwritten

use std::sync::Arc;

use axum::http::{HeaderMap, HeaderName, HeaderValue};
use base64::{engine::general_purpose::STANDARD, Engine};
use rand::{thread_rng, RngCore};

use crate::config::HeadersConfig;

/// Raw random bytes per nonce (128 bits).
const NONCE_BYTES_LEN: usize = 16;

/// Header carrying the nonce to the upstream.
pub const X_NONCE: &str = "x-nonce";

/// Base64 of 16 random bytes.
pub fn generate_csp_nonce() -> String {
    let mut bytes = [0u8; NONCE_BYTES_LEN];
    thread_rng().fill_bytes(&mut bytes);
    STANDARD.encode(bytes)
}

/// Request extension holding the current request's nonce.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CspNonce {
    value: Arc<String>,
    /// Unix milliseconds.
    pub created_at: u64,
}

impl CspNonce {
    pub fn new(created_at: u64) -> Self {
        Self {
            value: Arc::new(generate_csp_nonce()),
            created_at,
        }
    }

    pub fn value(&self) -> &str {
        &self.value
    }
}

/// Builds and applies security headers.
#[derive(Debug, Clone)]
pub struct SecurityHeaders {
    config: HeadersConfig,
    static_headers: Vec<(HeaderName, HeaderValue)>,
}

impl SecurityHeaders {
    pub fn new(config: HeadersConfig) -> Self {
        let hsts = format!("max-age={}; includeSubDomains; preload", config.hsts_max_age_secs);
        let mut static_headers = vec![
            (HeaderName::from_static("x-frame-options"), HeaderValue::from_static("DENY")),
            (HeaderName::from_static("x-content-type-options"), HeaderValue::from_static("nosniff")),
            (
                HeaderName::from_static("referrer-policy"),
                HeaderValue::from_static("strict-origin-when-cross-origin"),
            ),
            (
                HeaderName::from_static("permissions-policy"),
                HeaderValue::from_static("camera=(), microphone=(), geolocation=(), payment=(self)"),
            ),
            (
                HeaderName::from_static("cross-origin-opener-policy"),
                HeaderValue::from_static("same-origin"),
            ),
            (HeaderName::from_static("x-dns-prefetch-control"), HeaderValue::from_static("off")),
        ];
        if let Ok(value) = HeaderValue::from_str(&hsts) {
            static_headers.push((HeaderName::from_static("strict-transport-security"), value));
        }
        Self {
            config,
            static_headers,
        }
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    /// Content-Security-Policy for a nonce.
    pub fn build_csp(&self, nonce: &str) -> String {
        let mut script_src = format!("'self' 'nonce-{nonce}' 'strict-dynamic'");
        if self.config.dev_mode {
            script_src.push_str(" 'unsafe-eval'");
        }

        let mut connect_src = String::from("'self'");
        for src in &self.config.connect_src {
            connect_src.push(' ');
            connect_src.push_str(src);
        }
        let mut img_src = String::from("'self' data: blob:");
        for src in &self.config.img_src {
            img_src.push(' ');
            img_src.push_str(src);
        }

        let mut csp = format!(
            "default-src 'self'; script-src {script_src}; style-src 'self' 'nonce-{nonce}'; \
             img-src {img_src}; font-src 'self' data:; connect-src {connect_src}; \
             object-src 'none'; base-uri 'self'; form-action 'self'; frame-ancestors 'none'; \
             upgrade-insecure-requests"
        );
        if let Some(uri) = &self.config.report_uri {
            csp.push_str("; report-uri ");
            csp.push_str(uri);
        }
        csp
    }

    /// Overwrite the security headers on a response.
    pub fn apply(&self, headers: &mut HeaderMap, nonce: &CspNonce) {
        if !self.config.enabled {
            return;
        }
        for (name, value) in &self.static_headers {
            headers.insert(name.clone(), value.clone());
        }
        match HeaderValue::from_str(&self.build_csp(nonce.value())) {
            Ok(value) => {
                headers.insert(HeaderName::from_static("content-security-policy"), value);
            }
            Err(e) => tracing::error!(error = %e, "Generated CSP is not a valid header value"),
        }
    }
}
