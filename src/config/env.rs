//! Environment variable overrides.
//!
//! Environment variables:
//! - `EDGE_GUARD_BIND`: listener bind address
//! - `EDGE_GUARD_UPSTREAM`: upstream base URL
//! - `EDGE_GUARD_STORE`: `memory` or `redis`
//! - `REDIS_URL`: Redis connection URL (implies the redis backend)
//! - `EDGE_GUARD_FAILURE_POLICY`: `open` or `closed`
//! - `EDGE_GUARD_TRUST_PROXY`: trust X-Forwarded-For (default: true)
//! - `RATE_LIMIT_ENABLED`: enable/disable rate limiting
//! - `RATE_LIMIT_ALLOWLIST`: comma-separated identity allowlist
//! - `RATE_LIMIT_<CLASS>`: class limit as "requests,window_secs"
//! - `CSRF_SECRET`: cookie signing key
//! - `CSRF_CONSUME_PATHS`: comma-separated replay-protected prefixes
//! - `APP_CHECK_MODE`: `off`, `lenient` or `strict`
//! - `IP_INTEL_URL` / `IP_INTEL_API_KEY`: reputation provider
//! - `ADMIN_API_KEY`: admin bearer token (enables the admin API)

use crate::config::schema::{AppCheckMode, FailurePolicy, GuardConfig, LimitConfig, StoreBackend};

/// Apply overrides from the process environment.
pub fn apply_env_overrides(config: &mut GuardConfig) {
    apply_overrides(config, |name| std::env::var(name).ok());
}

/// Apply overrides from an arbitrary lookup (testable without touching the process env).
pub fn apply_overrides<F>(config: &mut GuardConfig, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(val) = lookup("EDGE_GUARD_BIND") {
        config.listener.bind_address = val;
    }
    if let Some(val) = lookup("EDGE_GUARD_UPSTREAM") {
        config.upstream.url = val;
    }
    if let Some(val) = lookup("EDGE_GUARD_STORE") {
        match val.trim().to_ascii_lowercase().as_str() {
            "redis" => config.store.backend = StoreBackend::Redis,
            "memory" => config.store.backend = StoreBackend::Memory,
            other => tracing::warn!(value = %other, "Ignoring unknown EDGE_GUARD_STORE"),
        }
    }
    if let Some(val) = lookup("REDIS_URL") {
        config.store.redis_url = val;
        config.store.backend = StoreBackend::Redis;
    }
    if let Some(val) = lookup("EDGE_GUARD_FAILURE_POLICY") {
        match val.trim().to_ascii_lowercase().as_str() {
            "open" => config.store.failure_policy = FailurePolicy::Open,
            "closed" => config.store.failure_policy = FailurePolicy::Closed,
            other => tracing::warn!(value = %other, "Ignoring unknown EDGE_GUARD_FAILURE_POLICY"),
        }
    }
    if let Some(val) = lookup("EDGE_GUARD_TRUST_PROXY") {
        config.identity.trust_proxy = val.parse().unwrap_or(config.identity.trust_proxy);
    }

    if let Some(val) = lookup("RATE_LIMIT_ENABLED") {
        config.rate_limit.enabled = val.parse().unwrap_or(true);
    }
    if let Some(val) = lookup("RATE_LIMIT_ALLOWLIST") {
        config.rate_limit.allowlist = val
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
    }
    let classes: Vec<String> = config.rate_limit.classes.keys().cloned().collect();
    for class in classes {
        let var = format!("RATE_LIMIT_{}", class.to_ascii_uppercase());
        if let Some(val) = lookup(&var) {
            match parse_limit_config(&val) {
                Some(limit) => {
                    config.rate_limit.classes.insert(class, limit);
                }
                None => tracing::warn!(var = %var, value = %val, "Ignoring malformed rate limit"),
            }
        }
    }

    if let Some(val) = lookup("CSRF_SECRET") {
        config.csrf.secret = val;
    }
    if let Some(val) = lookup("CSRF_CONSUME_PATHS") {
        config.csrf.consume_paths = split_list(&val);
    }

    if let Some(val) = lookup("APP_CHECK_MODE") {
        match val.trim().to_ascii_lowercase().as_str() {
            "off" => config.app_check.mode = AppCheckMode::Off,
            "lenient" => config.app_check.mode = AppCheckMode::Lenient,
            "strict" => config.app_check.mode = AppCheckMode::Strict,
            other => tracing::warn!(value = %other, "Ignoring unknown APP_CHECK_MODE"),
        }
    }

    if let Some(val) = lookup("IP_INTEL_URL") {
        config.ip_intel.provider_url = val;
    }
    if let Some(val) = lookup("IP_INTEL_API_KEY") {
        config.ip_intel.api_key = Some(val);
    }

    if let Some(val) = lookup("ADMIN_API_KEY") {
        config.admin.api_key = val;
        config.admin.enabled = true;
    }
}

/// Parses a limit from "requests,window_secs" format.
pub fn parse_limit_config(val: &str) -> Option<LimitConfig> {
    let parts: Vec<&str> = val.split(',').collect();
    if parts.len() == 2 {
        let requests = parts[0].trim().parse().ok()?;
        let window_secs = parts[1].trim().parse().ok()?;
        Some(LimitConfig { requests, window_secs })
    } else {
        None
    }
}

fn split_list(val: &str) -> Vec<String> {
    val.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_parse_limit_config() {
        let limit = parse_limit_config("10,60").unwrap();
        assert_eq!(limit.requests, 10);
        assert_eq!(limit.window_secs, 60);

        let limit = parse_limit_config(" 20 , 120 ").unwrap();
        assert_eq!(limit.requests, 20);
        assert_eq!(limit.window_secs, 120);

        assert!(parse_limit_config("10").is_none());
        assert!(parse_limit_config("10,60,extra").is_none());
        assert!(parse_limit_config("abc,60").is_none());
    }

    #[test]
    fn test_class_limit_override() {
        let mut config = GuardConfig::default();
        apply_overrides(&mut config, lookup_from(&[("RATE_LIMIT_AUTH", "3,30")]));
        assert_eq!(
            config.rate_limit.classes["auth"],
            LimitConfig { requests: 3, window_secs: 30 }
        );
        // Other classes untouched
        assert_eq!(config.rate_limit.classes["read"].requests, 120);
    }

    #[test]
    fn test_redis_url_selects_backend() {
        let mut config = GuardConfig::default();
        apply_overrides(
            &mut config,
            lookup_from(&[
                ("REDIS_URL", "redis://cache:6379"),
                ("EDGE_GUARD_FAILURE_POLICY", "closed"),
            ]),
        );
        assert_eq!(config.store.backend, StoreBackend::Redis);
        assert_eq!(config.store.redis_url, "redis://cache:6379");
        assert_eq!(config.store.failure_policy, FailurePolicy::Closed);
    }

    #[test]
    fn test_app_check_and_admin() {
        let mut config = GuardConfig::default();
        apply_overrides(
            &mut config,
            lookup_from(&[("APP_CHECK_MODE", "STRICT"), ("ADMIN_API_KEY", "k")]),
        );
        assert_eq!(config.app_check.mode, AppCheckMode::Strict);
        assert!(config.admin.enabled);
        assert_eq!(config.admin.api_key, "k");
    }

    #[test]
    fn test_unknown_values_are_ignored() {
        let mut config = GuardConfig::default();
        apply_overrides(
            &mut config,
            lookup_from(&[("APP_CHECK_MODE", "maybe"), ("EDGE_GUARD_STORE", "etcd")]),
        );
        assert_eq!(config.app_check.mode, AppCheckMode::Lenient);
        assert_eq!(config.store.backend, StoreBackend::Memory);
    }
}
