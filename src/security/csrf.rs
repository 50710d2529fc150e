//! Double-submit CSRF protection with signed cookies and rotation.
//!
//! # Responsibilities
//! - Issue signed token cookies (`value.issued_at.expires_at.signature`)
//! - Validate unsafe requests: submitted token must equal the cookie token,
//!   the signature must verify and the token must not be expired
//! - Consume tokens on replay-protected routes and rotate the cookie
//!
//! # Design Decisions
//! - Timestamps are unix milliseconds
//! - Comparisons are constant-time
//! - Consumption is a set-if-absent in the shared store, so a token is
//!   accepted once across all instances

use std::time::Duration;

use axum::http::HeaderMap;
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::Serialize;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;

use crate::config::CsrfConfig;
use crate::security::endpoint::prefix_matches;
use crate::security::error::SetupError;
use crate::store::{KeySpace, SharedStore, StoreError};

type HmacSha256 = Hmac<Sha256>;

/// Random bytes in a token value.
const TOKEN_BYTES: usize = 32;

/// Why a CSRF check failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CsrfFailure {
    #[error("CSRF cookie missing")]
    MissingCookie,
    #[error("CSRF token missing from request")]
    MissingToken,
    #[error("CSRF token does not match cookie")]
    Mismatch,
    #[error("CSRF token expired")]
    Expired,
    #[error("CSRF cookie signature invalid")]
    BadSignature,
    #[error("CSRF token already used")]
    Replayed,
}

impl CsrfFailure {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MissingCookie => "missing_cookie",
            Self::MissingToken => "missing_token",
            Self::Mismatch => "mismatch",
            Self::Expired => "expired",
            Self::BadSignature => "bad_signature",
            Self::Replayed => "replayed",
        }
    }
}

/// A decoded token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CsrfToken {
    pub value: String,
    pub issued_at: u64,
    pub expires_at: u64,
}

/// Issues and validates CSRF tokens.
#[derive(Clone)]
pub struct CsrfGuard {
    config: CsrfConfig,
    mac: HmacSha256,
    store: SharedStore,
    keys: KeySpace,
}

impl CsrfGuard {
    pub fn new(config: CsrfConfig, store: SharedStore, keys: KeySpace) -> Result<Self, SetupError> {
        let mac = HmacSha256::new_from_slice(config.secret.as_bytes())
            .map_err(|e| SetupError::CsrfSecret(e.to_string()))?;
        Ok(Self {
            config,
            mac,
            store,
            keys,
        })
    }

    pub fn config(&self) -> &CsrfConfig {
        &self.config
    }

    /// Whether requests to `path` skip validation.
    pub fn is_exempt(&self, path: &str) -> bool {
        !self.config.enabled
            || self
                .config
                .exempt_paths
                .iter()
                .any(|p| prefix_matches(path, p))
    }

    /// Whether tokens presented to `path` are single-use.
    pub fn should_consume(&self, path: &str) -> bool {
        self.config
            .consume_paths
            .iter()
            .any(|p| prefix_matches(path, p))
    }

    /// Create a fresh token.
    pub fn issue(&self, now_ms: u64) -> CsrfToken {
        let mut bytes = [0u8; TOKEN_BYTES];
        rand::thread_rng().fill_bytes(&mut bytes);
        CsrfToken {
            value: URL_SAFE_NO_PAD.encode(bytes),
            issued_at: now_ms,
            expires_at: now_ms + self.config.token_ttl_secs * 1000,
        }
    }

    /// Serialize a token into its signed cookie form.
    pub fn encode(&self, token: &CsrfToken) -> String {
        let payload = format!("{}.{}.{}", token.value, token.issued_at, token.expires_at);
        let mut mac = self.mac.clone();
        mac.update(payload.as_bytes());
        let signature = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());
        format!("{payload}.{signature}")
    }

    /// Parse a signed cookie value and verify its signature.
    pub fn decode(&self, raw: &str) -> Result<CsrfToken, CsrfFailure> {
        let (payload, signature) = raw.rsplit_once('.').ok_or(CsrfFailure::BadSignature)?;
        let signature = URL_SAFE_NO_PAD
            .decode(signature)
            .map_err(|_| CsrfFailure::BadSignature)?;

        let mut mac = self.mac.clone();
        mac.update(payload.as_bytes());
        mac.verify_slice(&signature)
            .map_err(|_| CsrfFailure::BadSignature)?;

        let mut parts = payload.splitn(3, '.');
        let value = parts.next().filter(|v| !v.is_empty());
        let issued_at = parts.next().and_then(|v| v.parse().ok());
        let expires_at = parts.next().and_then(|v| v.parse().ok());
        match (value, issued_at, expires_at) {
            (Some(value), Some(issued_at), Some(expires_at)) => Ok(CsrfToken {
                value: value.to_string(),
                issued_at,
                expires_at,
            }),
            _ => Err(CsrfFailure::BadSignature),
        }
    }

    /// Build the `Set-Cookie` for a token.
    ///
    /// Not `HttpOnly`: the client script reads it to mirror into the header.
    pub fn cookie(&self, token: &CsrfToken) -> Cookie<'static> {
        let max_age = token.expires_at.saturating_sub(token.issued_at) / 1000;
        Cookie::build((self.config.cookie_name.clone(), self.encode(token)))
            .path("/")
            .same_site(SameSite::Strict)
            .secure(self.config.secure_cookie)
            .http_only(false)
            .max_age(time::Duration::seconds(max_age as i64))
            .build()
    }

    /// For safe requests: a new cookie when the current one is absent,
    /// invalid, or close to expiry.
    pub fn ensure_csrf_cookie(&self, headers: &HeaderMap, now_ms: u64) -> Option<Cookie<'static>> {
        if !self.config.enabled {
            return None;
        }
        let jar = CookieJar::from_headers(headers);
        let current = jar
            .get(&self.config.cookie_name)
            .and_then(|c| self.decode(c.value()).ok());

        let refresh_at_ms = self.config.refresh_before_secs * 1000;
        match current {
            Some(token) if token.expires_at > now_ms + refresh_at_ms => None,
            _ => Some(self.cookie(&self.issue(now_ms))),
        }
    }

    /// Token submitted in the header, if any.
    pub fn header_token<'a>(&self, headers: &'a HeaderMap) -> Option<&'a str> {
        headers
            .get(self.config.header_name.as_str())
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    }

    /// Token submitted in an urlencoded form body.
    pub fn form_token(&self, body: &[u8]) -> Option<String> {
        url::form_urlencoded::parse(body)
            .find(|(k, _)| k == self.config.form_field.as_str())
            .map(|(_, v)| v.into_owned())
            .filter(|v| !v.is_empty())
    }

    /// Validate an unsafe request.
    ///
    /// `submitted` may be the bare token value or the whole cookie string.
    pub fn validate(
        &self,
        headers: &HeaderMap,
        submitted: Option<&str>,
        now_ms: u64,
    ) -> Result<CsrfToken, CsrfFailure> {
        let jar = CookieJar::from_headers(headers);
        let raw = jar
            .get(&self.config.cookie_name)
            .map(|c| c.value().to_string())
            .ok_or(CsrfFailure::MissingCookie)?;

        let token = self.decode(&raw)?;
        let submitted = submitted.ok_or(CsrfFailure::MissingToken)?;

        let matches = bool::from(submitted.as_bytes().ct_eq(token.value.as_bytes()))
            || bool::from(submitted.as_bytes().ct_eq(raw.as_bytes()));
        if !matches {
            return Err(CsrfFailure::Mismatch);
        }

        if token.expires_at <= now_ms {
            return Err(CsrfFailure::Expired);
        }

        Ok(token)
    }

    /// Mark a token used. Returns `false` if it was already consumed.
    #[tracing::instrument(level = "debug", skip_all)]
    pub async fn consume_token(&self, token: &CsrfToken, now_ms: u64) -> Result<bool, StoreError> {
        let ttl = Duration::from_millis(token.expires_at.saturating_sub(now_ms).max(1000));
        let key = self.keys.key("csrf:used", &token.value);
        self.store.set_nx(&key, "1", ttl).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use axum::http::HeaderValue;

    use crate::store::MemoryStore;

    const NOW: u64 = 1_700_000_000_000;

    fn guard() -> CsrfGuard {
        let config = CsrfConfig {
            secret: "unit-test-secret-0123456789".to_string(),
            ..CsrfConfig::default()
        };
        CsrfGuard::new(config, Arc::new(MemoryStore::new()), KeySpace::new("test")).unwrap()
    }

    fn with_cookie(guard: &CsrfGuard, token: &CsrfToken) -> HeaderMap {
        let mut headers = HeaderMap::new();
        let cookie = format!("{}={}", guard.config.cookie_name, guard.encode(token));
        headers.insert("cookie", HeaderValue::from_str(&cookie).unwrap());
        headers
    }

    #[test]
    fn test_encode_decode() {
        let guard = guard();
        let token = guard.issue(NOW);
        assert_eq!(token.expires_at, NOW + 3_600_000);
        assert_eq!(guard.decode(&guard.encode(&token)), Ok(token));
    }

    #[test]
    fn test_tampered_cookie_rejected() {
        let guard = guard();
        let token = guard.issue(NOW);
        let encoded = guard.encode(&token);

        // Extend the expiry without re-signing
        let forged = encoded.replace(&token.expires_at.to_string(), &(token.expires_at + 1).to_string());
        assert_eq!(guard.decode(&forged), Err(CsrfFailure::BadSignature));
        assert_eq!(guard.decode("garbage"), Err(CsrfFailure::BadSignature));

        let other = CsrfGuard::new(
            CsrfConfig {
                secret: "a-different-secret-value".to_string(),
                ..CsrfConfig::default()
            },
            Arc::new(MemoryStore::new()),
            KeySpace::new("test"),
        )
        .unwrap();
        assert_eq!(other.decode(&encoded), Err(CsrfFailure::BadSignature));
    }

    #[test]
    fn test_validate_matching_token() {
        let guard = guard();
        let token = guard.issue(NOW);
        let headers = with_cookie(&guard, &token);

        assert_eq!(guard.validate(&headers, Some(&token.value), NOW + 1), Ok(token.clone()));
        let raw = guard.encode(&token);
        assert!(guard.validate(&headers, Some(&raw), NOW + 1).is_ok());
    }

    #[test]
    fn test_validate_failures() {
        let guard = guard();
        let token = guard.issue(NOW);
        let headers = with_cookie(&guard, &token);

        assert_eq!(
            guard.validate(&HeaderMap::new(), Some(&token.value), NOW),
            Err(CsrfFailure::MissingCookie)
        );
        assert_eq!(guard.validate(&headers, None, NOW), Err(CsrfFailure::MissingToken));
        assert_eq!(
            guard.validate(&headers, Some("not-the-token"), NOW),
            Err(CsrfFailure::Mismatch)
        );
    }

    #[test]
    fn test_expired_token_rejected_even_when_matching() {
        let guard = guard();
        let token = guard.issue(NOW);
        let headers = with_cookie(&guard, &token);

        assert_eq!(
            guard.validate(&headers, Some(&token.value), token.expires_at + 1),
            Err(CsrfFailure::Expired)
        );
        assert_eq!(
            guard.validate(&headers, Some(&token.value), token.expires_at),
            Err(CsrfFailure::Expired)
        );
        assert!(guard.validate(&headers, Some(&token.value), token.expires_at - 1).is_ok());
    }

    #[test]
    fn test_ensure_cookie() {
        let guard = guard();
        assert!(guard.ensure_csrf_cookie(&HeaderMap::new(), NOW).is_some());

        let token = guard.issue(NOW);
        let headers = with_cookie(&guard, &token);
        assert!(guard.ensure_csrf_cookie(&headers, NOW + 1000).is_none());

        // Inside the refresh window a new cookie is issued
        let near_expiry = token.expires_at - 60_000;
        let cookie = guard.ensure_csrf_cookie(&headers, near_expiry).unwrap();
        assert_eq!(cookie.name(), "csrf_token");
        assert_ne!(guard.decode(cookie.value()).unwrap().value, token.value);
    }

    #[test]
    fn test_form_token() {
        let guard = guard();
        assert_eq!(
            guard.form_token(b"amount=10&csrf_token=abc%2Bdef"),
            Some("abc+def".to_string())
        );
        assert_eq!(guard.form_token(b"amount=10"), None);
    }

    #[test]
    fn test_paths() {
        let guard = guard();
        assert!(guard.should_consume("/api/auth/2fa/verify"));
        assert!(!guard.should_consume("/api/articles"));
        assert!(guard.is_exempt("/api/webhooks/stripe"));
        assert!(!guard.is_exempt("/api/articles"));
    }

    #[tokio::test]
    async fn test_consume_once() {
        let guard = guard();
        let token = guard.issue(NOW);
        assert!(guard.consume_token(&token, NOW).await.unwrap());
        assert!(!guard.consume_token(&token, NOW).await.unwrap());
    }
}
