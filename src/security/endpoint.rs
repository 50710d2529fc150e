//! Endpoint classification for rate limiting.

use std::borrow::Cow;

use axum::http::Method;

use crate::config::{LimitConfig, RateLimitConfig};

/// Classes used when no rule matches; they must always be configured.
pub const FALLBACK_CLASSES: &[&str] = &["page", "read", "write"];

/// A resolved endpoint class with its limit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointLimit {
    pub class: String,
    pub limit: LimitConfig,
}

/// Resolve the class and limit for a request.
///
/// Rules are checked in order; the first whose prefix matches the path (on a
/// segment boundary) and whose method list is empty or contains the method
/// wins. Unmatched API paths fall back to `write`/`read` by method; anything
/// else is a `page`.
pub fn get_rate_limit_config_for_endpoint(
    config: &RateLimitConfig,
    path: &str,
    method: &Method,
) -> Option<EndpointLimit> {
    let class = config
        .rules
        .iter()
        .find(|rule| {
            prefix_matches(path, &rule.path_prefix)
                && (rule.methods.is_empty()
                    || rule.methods.iter().any(|m| m.eq_ignore_ascii_case(method.as_str())))
        })
        .map(|rule| rule.class.as_str())
        .unwrap_or_else(|| fallback_class(path, method));

    config.classes.get(class).map(|limit| EndpointLimit {
        class: class.to_string(),
        limit: *limit,
    })
}

fn fallback_class(path: &str, method: &Method) -> &'static str {
    if prefix_matches(path, "/api") {
        if is_unsafe(method) {
            "write"
        } else {
            "read"
        }
    } else {
        "page"
    }
}

/// `true` when `path` equals `prefix` or continues it with a `/`. Runs of
/// slashes in `path` count as one.
pub fn prefix_matches(path: &str, prefix: &str) -> bool {
    let path = normalize_path(path);
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/') || prefix.ends_with('/'),
        None => false,
    }
}

/// Collapse repeated slashes, borrowing when there are none.
pub fn normalize_path(path: &str) -> Cow<'_, str> {
    if !path.contains("//") {
        return Cow::Borrowed(path);
    }
    let mut out = String::with_capacity(path.len());
    for c in path.chars() {
        if c == '/' && out.ends_with('/') {
            continue;
        }
        out.push(c);
    }
    Cow::Owned(out)
}

/// POST, PUT, PATCH and DELETE.
pub fn is_unsafe(method: &Method) -> bool {
    matches!(*method, Method::POST | Method::PUT | Method::PATCH | Method::DELETE)
}
