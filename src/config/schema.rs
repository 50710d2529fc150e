//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the guard.
//! All types derive Serde traits for deserialization from config files.

use std::collections::{BTreeMap, HashSet};
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

/// Root configuration for the edge guard.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct GuardConfig {
    /// Listener configuration (bind address, connection cap).
    pub listener: ListenerConfig,

    /// The protected application.
    pub upstream: UpstreamConfig,

    /// Timeout configuration.
    pub timeouts: TimeoutConfig,

    /// Shared key-value store.
    pub store: StoreConfig,

    /// Client identity resolution.
    pub identity: IdentityConfig,

    /// Distributed rate limiting.
    pub rate_limit: RateLimitConfig,

    /// CSRF double-submit protection.
    pub csrf: CsrfConfig,

    /// IP geolocation / reputation.
    pub ip_intel: IpIntelConfig,

    /// Behavioral anomaly detection and auto-blocking.
    pub anomaly: AnomalyConfig,

    /// CSP nonce and hardening headers.
    pub headers: HeadersConfig,

    /// App attestation header enforcement.
    pub app_check: AppCheckConfig,

    /// Security event log.
    pub events: EventsConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,

    /// Admin API.
    pub admin: AdminConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    pub bind_address: String,

    /// Maximum concurrent in-flight requests (backpressure).
    pub max_connections: usize,

    /// Maximum request body size forwarded upstream.
    pub max_body_bytes: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
            max_connections: 10_000,
            max_body_bytes: 10 * 1024 * 1024,
        }
    }
}

/// The application requests are forwarded to.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Base URL, e.g. "http://127.0.0.1:3000".
    pub url: String,

    /// Path prefixes served without security checks (static assets).
    pub static_prefixes: Vec<String>,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:3000".to_string(),
            static_prefixes: vec![
                "/_next/static".to_string(),
                "/_next/image".to_string(),
                "/favicon.ico".to_string(),
                "/robots.txt".to_string(),
            ],
        }
    }
}

/// Timeout configuration for various operations.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Upstream connection establishment timeout in seconds.
    pub connect_secs: u64,

    /// Total time for the upstream request/response in seconds.
    pub request_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_secs: 5,
            request_secs: 30,
        }
    }
}

/// What a component does when the store (or another dependency) fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Let the request through and record the outage.
    #[default]
    Open,
    /// Deny the request with 503.
    Closed,
}

impl FailurePolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Closed => "closed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Memory,
    Redis,
}

/// Shared store configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,

    /// Redis connection URL.
    pub redis_url: String,

    /// Prefix for every key written by the guard.
    pub key_prefix: String,

    /// Connection timeout in milliseconds.
    pub connect_timeout_ms: u64,

    /// Per-operation timeout in milliseconds.
    pub op_timeout_ms: u64,

    /// Startup connection attempts before giving up.
    pub connect_attempts: u32,

    /// Behavior when the store cannot answer.
    pub failure_policy: FailurePolicy,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            redis_url: "redis://127.0.0.1:6379".to_string(),
            key_prefix: "eg".to_string(),
            connect_timeout_ms: 2_000,
            op_timeout_ms: 50,
            connect_attempts: 5,
            failure_policy: FailurePolicy::Open,
        }
    }
}

/// Client identity resolution.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Honour X-Forwarded-For / X-Real-IP.
    pub trust_proxy: bool,

    /// When non-empty, forwarded headers are honoured only from these peers.
    pub trusted_proxies: Vec<IpAddr>,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            trust_proxy: true,
            trusted_proxies: Vec::new(),
        }
    }
}

/// A single rate limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct LimitConfig {
    /// Maximum requests allowed in the window.
    pub requests: u32,
    /// Window duration in seconds.
    pub window_secs: u64,
}

/// Maps requests to an endpoint class. First match wins.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct EndpointRule {
    /// Path prefix to match.
    pub path_prefix: String,

    /// Methods to match; empty matches any method.
    #[serde(default)]
    pub methods: Vec<String>,

    /// Endpoint class name (`auth`, `sensitive`, `admin`, `write`, `read`, `page`).
    pub class: String,
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Enable rate limiting.
    pub enabled: bool,

    /// Identities (normalized IPs) that bypass rate limiting.
    pub allowlist: HashSet<String>,

    /// Per-class limits keyed by class name.
    pub classes: BTreeMap<String, LimitConfig>,

    /// Ordered endpoint rules; requests matching none fall back by method.
    pub rules: Vec<EndpointRule>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        let classes = BTreeMap::from([
            ("auth".to_string(), LimitConfig { requests: 10, window_secs: 60 }),
            ("sensitive".to_string(), LimitConfig { requests: 5, window_secs: 300 }),
            ("admin".to_string(), LimitConfig { requests: 60, window_secs: 60 }),
            ("write".to_string(), LimitConfig { requests: 30, window_secs: 60 }),
            ("read".to_string(), LimitConfig { requests: 120, window_secs: 60 }),
            ("page".to_string(), LimitConfig { requests: 300, window_secs: 60 }),
        ]);

        let rule = |prefix: &str, methods: &[&str], class: &str| EndpointRule {
            path_prefix: prefix.to_string(),
            methods: methods.iter().map(|m| m.to_string()).collect(),
            class: class.to_string(),
        };

        Self {
            enabled: true,
            allowlist: HashSet::new(),
            classes,
            rules: vec![
                rule("/api/auth/2fa", &[], "sensitive"),
                rule("/api/auth/reset-password", &[], "sensitive"),
                rule("/api/auth", &[], "auth"),
                rule("/api/admin", &[], "admin"),
                rule("/api", &["POST", "PUT", "PATCH", "DELETE"], "write"),
                rule("/api", &[], "read"),
            ],
        }
    }
}

/// CSRF configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CsrfConfig {
    pub enabled: bool,

    /// Cookie holding the signed token.
    pub cookie_name: String,

    /// Request header mirroring the token.
    pub header_name: String,

    /// Urlencoded form field accepted when the header is absent.
    pub form_field: String,

    /// HMAC key for cookie signatures. Must be set in production.
    pub secret: String,

    /// Token lifetime in seconds.
    pub token_ttl_secs: u64,

    /// Re-issue on safe requests when less than this many seconds remain.
    pub refresh_before_secs: u64,

    /// Path prefixes whose tokens are single-use (replay protection).
    pub consume_paths: Vec<String>,

    /// Path prefixes exempt from validation (e.g. signed webhooks).
    pub exempt_paths: Vec<String>,

    /// Mark the cookie `Secure`.
    pub secure_cookie: bool,
}

impl Default for CsrfConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            cookie_name: "csrf_token".to_string(),
            header_name: "x-csrf-token".to_string(),
            form_field: "csrf_token".to_string(),
            // WARNING: This is a placeholder! Change this in production.
            secret: "CHANGE_ME_IN_PRODUCTION".to_string(),
            token_ttl_secs: 3600,
            refresh_before_secs: 600,
            consume_paths: vec!["/api/auth/2fa".to_string(), "/api/payouts".to_string()],
            exempt_paths: vec!["/api/webhooks".to_string()],
            secure_cookie: true,
        }
    }
}

/// IP intelligence configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct IpIntelConfig {
    pub enabled: bool,

    /// Provider URL template; `{ip}` is replaced with the address.
    pub provider_url: String,

    /// Optional API key sent as a bearer token.
    pub api_key: Option<String>,

    /// Lookup timeout in milliseconds.
    pub timeout_ms: u64,

    /// Cache lifetime in seconds.
    pub cache_ttl_secs: u64,

    /// ISO country codes denied outright.
    pub denied_countries: Vec<String>,

    /// Autonomous system numbers denied outright.
    pub denied_asns: Vec<u32>,

    /// Consecutive provider failures before the breaker opens.
    pub breaker_threshold: u32,

    /// Seconds the breaker stays open.
    pub breaker_cooldown_secs: u64,
}

impl Default for IpIntelConfig {
    fn default() -> Self {
        Self {
            // Requires a provider endpoint; off until one is configured.
            enabled: false,
            provider_url: "https://ipinfo.example.net/v1/lookup/{ip}".to_string(),
            api_key: None,
            timeout_ms: 150,
            cache_ttl_secs: 3600,
            denied_countries: Vec::new(),
            denied_asns: Vec::new(),
            breaker_threshold: 5,
            breaker_cooldown_secs: 30,
        }
    }
}

/// Anomaly detection configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AnomalyConfig {
    pub enabled: bool,

    /// Score (0-100) at which a client is auto-blocked.
    pub block_threshold: u8,

    /// Entries kept in the rolling profile.
    pub profile_size: usize,

    /// Seconds a profile survives without traffic.
    pub profile_ttl_secs: u64,

    /// Requests per minute considered normal before a baseline exists.
    pub min_rate_per_minute: f64,

    /// Current rate / baseline ratio treated as a deviation.
    pub rate_deviation_factor: f64,

    /// First block duration in seconds.
    pub base_block_secs: u64,

    /// Upper bound on block duration in seconds.
    pub max_block_secs: u64,

    /// Window in seconds over which violations escalate.
    pub lookback_secs: u64,

    /// Window in seconds for the error-ratio signal.
    pub error_window_secs: u64,
}

impl Default for AnomalyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            block_threshold: 70,
            profile_size: 50,
            profile_ttl_secs: 3600,
            min_rate_per_minute: 60.0,
            rate_deviation_factor: 4.0,
            base_block_secs: 300,
            max_block_secs: 7 * 24 * 3600,
            lookback_secs: 24 * 3600,
            error_window_secs: 300,
        }
    }
}

/// Security header configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HeadersConfig {
    /// Emit security headers.
    pub enabled: bool,

    /// Add `'unsafe-eval'` to script-src (development builds only).
    pub dev_mode: bool,

    /// Extra sources for `connect-src`.
    pub connect_src: Vec<String>,

    /// Extra sources for `img-src`.
    pub img_src: Vec<String>,

    /// HSTS max-age in seconds.
    pub hsts_max_age_secs: u64,

    /// Optional CSP report endpoint.
    pub report_uri: Option<String>,
}

impl Default for HeadersConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dev_mode: false,
            connect_src: Vec::new(),
            img_src: Vec::new(),
            hsts_max_age_secs: 63_072_000,
            report_uri: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AppCheckMode {
    Off,
    #[default]
    Lenient,
    Strict,
}

/// App attestation enforcement.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AppCheckConfig {
    pub mode: AppCheckMode,

    /// Header carrying the attestation token.
    pub header_name: String,

    /// Path prefixes that require the header.
    pub protected_paths: Vec<String>,
}

impl Default for AppCheckConfig {
    fn default() -> Self {
        Self {
            mode: AppCheckMode::Lenient,
            header_name: "x-app-check".to_string(),
            protected_paths: vec!["/api".to_string()],
        }
    }
}

/// Security event log.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct EventsConfig {
    /// Events retained in the shared log.
    pub max_events: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self { max_events: 10_000 }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// "pretty" or "json".
    pub log_format: String,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
            metrics_enabled: true,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}

/// Admin API configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AdminConfig {
    /// Enable admin API.
    pub enabled: bool,

    /// API key for authentication (Bearer token).
    pub api_key: String,

    /// Admin API bind address.
    pub bind_address: String,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            // WARNING: This is a placeholder! Change this in production.
            api_key: "CHANGE_ME_IN_PRODUCTION".to_string(),
            bind_address: "127.0.0.1:8081".to_string(),
        }
    }
}
