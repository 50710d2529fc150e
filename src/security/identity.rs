//! Client identity resolution.
//!
//! # Responsibilities
//! - Pick the client address from forwarded headers or the socket peer
//! - Normalize addresses (IPv6 folded to its /64 allocation)
//! - Derive a coarse browser fingerprint for churn detection
//!
//! # Design Decisions
//! - Never fails: malformed headers fall through to the next source
//! - Forwarded headers are honoured only when the proxy is trusted

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use axum::http::HeaderMap;
use sha2::{Digest, Sha256};

use crate::config::IdentityConfig;

/// IPv6 segments kept when normalizing (a /64 allocation).
const IPV6_PREFIX_SEGMENTS: usize = 4;

/// Hex characters kept from the fingerprint digest.
const FINGERPRINT_LEN: usize = 16;

/// Resolved client identity, stored in request extensions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity {
    /// Address the client connected from (after proxy resolution).
    pub ip: IpAddr,
    /// Normalized address used as the bucket and profile key.
    pub normalized: String,
    /// Short digest of user-agent and accept-language, if either is present.
    pub fingerprint: Option<String>,
}

impl ClientIdentity {
    pub fn new(ip: IpAddr, fingerprint: Option<String>) -> Self {
        Self {
            normalized: normalize_ip(ip),
            ip,
            fingerprint,
        }
    }

    /// Key for rate-limit buckets, profiles and block state.
    pub fn key(&self) -> &str {
        &self.normalized
    }
}

/// Resolve the identity of a request.
pub fn resolve(headers: &HeaderMap, peer: Option<SocketAddr>, config: &IdentityConfig) -> ClientIdentity {
    let trust = config.trust_proxy
        && (config.trusted_proxies.is_empty()
            || peer.is_some_and(|p| config.trusted_proxies.contains(&p.ip())));

    let ip = extract_client_ip(headers, peer, trust);
    ClientIdentity::new(ip, fingerprint(headers))
}

/// Extract the client address.
///
/// With `trust_proxy`, the first hop of `X-Forwarded-For` wins, then
/// `X-Real-IP`. Falls back to the socket peer, then to 127.0.0.1.
pub fn extract_client_ip(headers: &HeaderMap, peer: Option<SocketAddr>, trust_proxy: bool) -> IpAddr {
    if trust_proxy {
        if let Some(forwarded) = headers.get("x-forwarded-for") {
            if let Ok(s) = forwarded.to_str() {
                if let Some(first_ip) = s.split(',').next() {
                    if let Ok(ip) = first_ip.trim().parse() {
                        return ip;
                    }
                }
            }
        }
        if let Some(real_ip) = headers.get("x-real-ip") {
            if let Ok(s) = real_ip.to_str() {
                if let Ok(ip) = s.trim().parse() {
                    return ip;
                }
            }
        }
    }
    peer.map(|p| p.ip())
        .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
}

/// IPv4 as-is; IPv6 reduced to its /64 prefix so a client cannot rotate
/// through its own allocation.
pub fn normalize_ip(ip: IpAddr) -> String {
    match ip {
        IpAddr::V4(v4) => v4.to_string(),
        IpAddr::V6(v6) => {
            if let Some(v4) = v6.to_ipv4_mapped() {
                return v4.to_string();
            }
            let seg = v6.segments();
            let prefix: Vec<String> = seg[..IPV6_PREFIX_SEGMENTS]
                .iter()
                .map(|s| format!("{s:x}"))
                .collect();
            format!("{}::/64", prefix.join(":"))
        }
    }
}

fn fingerprint(headers: &HeaderMap) -> Option<String> {
    let ua = headers.get("user-agent").and_then(|v| v.to_str().ok());
    let lang = headers.get("accept-language").and_then(|v| v.to_str().ok());
    if ua.is_none() && lang.is_none() {
        return None;
    }

    let mut hasher = Sha256::new();
    hasher.update(ua.unwrap_or_default().as_bytes());
    hasher.update(b"\n");
    hasher.update(lang.unwrap_or_default().as_bytes());
    let mut digest = hex::encode(hasher.finalize());
    digest.truncate(FINGERPRINT_LEN);
    Some(digest)
}
