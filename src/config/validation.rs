//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Check referential integrity (rules reference defined classes)
//! - Validate value ranges (timeouts > 0, windows > 0, thresholds in range)
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: GuardConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::net::SocketAddr;

use thiserror::Error;

use crate::config::schema::GuardConfig;
use crate::security::endpoint::FALLBACK_CLASSES;

/// A single semantic problem in the configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{field}: {message}")]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Validate a configuration, collecting every error.
pub fn validate_config(config: &GuardConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listener.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::new("listener.bind_address", "not a socket address"));
    }
    if config.listener.max_connections == 0 {
        errors.push(ValidationError::new("listener.max_connections", "must be > 0"));
    }

    match url::Url::parse(&config.upstream.url) {
        Ok(u) if u.scheme() == "http" && u.host().is_some() => {}
        Ok(_) => errors.push(ValidationError::new("upstream.url", "must be an http:// URL with a host")),
        Err(e) => errors.push(ValidationError::new("upstream.url", e.to_string())),
    }

    if config.timeouts.request_secs == 0 {
        errors.push(ValidationError::new("timeouts.request_secs", "must be > 0"));
    }
    if config.store.op_timeout_ms == 0 {
        errors.push(ValidationError::new("store.op_timeout_ms", "must be > 0"));
    }
    if config.store.key_prefix.is_empty() {
        errors.push(ValidationError::new("store.key_prefix", "must not be empty"));
    }

    for (class, limit) in &config.rate_limit.classes {
        if limit.requests == 0 {
            errors.push(ValidationError::new(
                format!("rate_limit.classes.{class}.requests"),
                "must be > 0",
            ));
        }
        if limit.window_secs == 0 {
            errors.push(ValidationError::new(
                format!("rate_limit.classes.{class}.window_secs"),
                "must be > 0",
            ));
        }
    }
    for class in FALLBACK_CLASSES {
        if !config.rate_limit.classes.contains_key(*class) {
            errors.push(ValidationError::new(
                format!("rate_limit.classes.{class}"),
                "fallback class must be defined",
            ));
        }
    }
    for (i, rule) in config.rate_limit.rules.iter().enumerate() {
        if !config.rate_limit.classes.contains_key(&rule.class) {
            errors.push(ValidationError::new(
                format!("rate_limit.rules[{i}].class"),
                format!("unknown class '{}'", rule.class),
            ));
        }
        if !rule.path_prefix.starts_with('/') {
            errors.push(ValidationError::new(
                format!("rate_limit.rules[{i}].path_prefix"),
                "must start with '/'",
            ));
        }
    }

    if config.csrf.enabled {
        if config.csrf.secret.len() < 16 {
            errors.push(ValidationError::new("csrf.secret", "must be at least 16 bytes"));
        }
        if config.csrf.token_ttl_secs == 0 {
            errors.push(ValidationError::new("csrf.token_ttl_secs", "must be > 0"));
        }
        if config.csrf.cookie_name.is_empty() || config.csrf.header_name.is_empty() {
            errors.push(ValidationError::new("csrf", "cookie_name and header_name are required"));
        }
    }

    if config.ip_intel.enabled {
        if !config.ip_intel.provider_url.contains("{ip}") {
            errors.push(ValidationError::new("ip_intel.provider_url", "must contain '{ip}'"));
        }
        if config.ip_intel.timeout_ms == 0 {
            errors.push(ValidationError::new("ip_intel.timeout_ms", "must be > 0"));
        }
    }

    let anomaly = &config.anomaly;
    if anomaly.block_threshold == 0 || anomaly.block_threshold > 100 {
        errors.push(ValidationError::new("anomaly.block_threshold", "must be within 1..=100"));
    }
    if anomaly.base_block_secs == 0 || anomaly.base_block_secs > anomaly.max_block_secs {
        errors.push(ValidationError::new(
            "anomaly.base_block_secs",
            "must be > 0 and <= max_block_secs",
        ));
    }
    if anomaly.profile_size < 2 {
        errors.push(ValidationError::new("anomaly.profile_size", "must be >= 2"));
    }
    if anomaly.lookback_secs == 0 {
        errors.push(ValidationError::new("anomaly.lookback_secs", "must be > 0"));
    }

    if config.events.max_events == 0 {
        errors.push(ValidationError::new("events.max_events", "must be > 0"));
    }

    if !matches!(config.observability.log_format.as_str(), "pretty" | "json") {
        errors.push(ValidationError::new("observability.log_format", "must be 'pretty' or 'json'"));
    }

    if config.admin.enabled {
        if config.admin.api_key.is_empty() {
            errors.push(ValidationError::new("admin.api_key", "must not be empty"));
        }
        if config.admin.bind_address.parse::<SocketAddr>().is_err() {
            errors.push(ValidationError::new("admin.bind_address", "not a socket address"));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
