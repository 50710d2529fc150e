//! IP geolocation and reputation with a shared one-hour cache.
//!
//! # Responsibilities
//! - Look up country, ASN and reputation for a client address
//! - Cache records in the shared store so each address costs at most one
//!   provider call per cache lifetime across all instances
//! - Apply the country/ASN deny policy
//!
//! # Design Decisions
//! - Provider failures degrade to "no signal"; they never deny a request
//! - A circuit breaker stops calling a failing provider for a cooldown
//! - Private, loopback and link-local addresses never leave the process

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::IpIntelConfig;
use crate::resilience::CircuitBreaker;
use crate::security::error::SetupError;
use crate::security::unix_millis;
use crate::store::{get_json, set_json, KeySpace, SharedStore};

/// Cached intelligence about one address. Replaced, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IpIntelligenceRecord {
    pub ip: String,
    pub country: Option<String>,
    pub asn: Option<u32>,
    /// 0-100, higher is riskier.
    pub reputation_score: u8,
    pub is_proxy: bool,
    pub is_vpn: bool,
    /// Unix milliseconds when the record was fetched.
    pub cached_at: u64,
}

impl IpIntelligenceRecord {
    fn neutral(ip: IpAddr, now_ms: u64) -> Self {
        Self {
            ip: ip.to_string(),
            country: None,
            asn: None,
            reputation_score: 0,
            is_proxy: false,
            is_vpn: false,
            cached_at: now_ms,
        }
    }
}

/// A record plus where it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct IpIntelligence {
    pub record: IpIntelligenceRecord,
    pub cache_hit: bool,
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("request failed: {0}")]
    Request(String),

    #[error("provider returned status {0}")]
    Status(u16),

    #[error("invalid provider response: {0}")]
    Decode(String),
}

/// Why a lookup produced no signal.
#[derive(Debug, Error)]
pub enum IntelError {
    #[error("IP provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("IP provider timed out after {0:?}")]
    Timeout(Duration),

    #[error("IP provider circuit open")]
    CircuitOpen,
}

/// Source of reputation data.
#[async_trait]
pub trait IpReputationProvider: Send + Sync {
    fn name(&self) -> &'static str;

    async fn lookup(&self, ip: IpAddr) -> Result<IpIntelligenceRecord, ProviderError>;
}

/// JSON body returned by the HTTP provider.
#[derive(Debug, Deserialize)]
struct ProviderResponse {
    #[serde(default, alias = "country_code")]
    country: Option<String>,
    #[serde(default)]
    asn: Option<u32>,
    #[serde(default, alias = "risk_score", alias = "abuse_score")]
    reputation: Option<f64>,
    #[serde(default, alias = "proxy")]
    is_proxy: bool,
    #[serde(default, alias = "vpn")]
    is_vpn: bool,
}

/// Provider speaking a simple JSON-over-HTTP API.
pub struct HttpIpProvider {
    client: reqwest::Client,
    url_template: String,
    api_key: Option<String>,
}

impl HttpIpProvider {
    pub fn new(config: &IpIntelConfig) -> Result<Self, SetupError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| SetupError::HttpClient(e.to_string()))?;

        Ok(Self {
            client,
            url_template: config.provider_url.clone(),
            api_key: config.api_key.clone(),
        })
    }
}

#[async_trait]
impl IpReputationProvider for HttpIpProvider {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn lookup(&self, ip: IpAddr) -> Result<IpIntelligenceRecord, ProviderError> {
        let url = self.url_template.replace("{ip}", &ip.to_string());
        let mut request = self.client.get(&url);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ProviderError::Request(e.to_string()))?;
        if !response.status().is_success() {
            return Err(ProviderError::Status(response.status().as_u16()));
        }

        let body: ProviderResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Decode(e.to_string()))?;

        Ok(IpIntelligenceRecord {
            ip: ip.to_string(),
            country: body.country.map(|c| c.to_ascii_uppercase()),
            asn: body.asn,
            reputation_score: body.reputation.unwrap_or(0.0).clamp(0.0, 100.0).round() as u8,
            is_proxy: body.is_proxy,
            is_vpn: body.is_vpn,
            cached_at: 0,
        })
    }
}

/// Cache-first intelligence lookups.
#[derive(Clone)]
pub struct IpIntelService {
    provider: Arc<dyn IpReputationProvider>,
    store: SharedStore,
    keys: KeySpace,
    config: IpIntelConfig,
    breaker: Arc<CircuitBreaker>,
}

impl IpIntelService {
    pub fn new(
        provider: Arc<dyn IpReputationProvider>,
        store: SharedStore,
        keys: KeySpace,
        config: IpIntelConfig,
    ) -> Self {
        let breaker = Arc::new(CircuitBreaker::new(
            config.breaker_threshold,
            Duration::from_secs(config.breaker_cooldown_secs),
        ));
        Self {
            provider,
            store,
            keys,
            config,
            breaker,
        }
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    /// Intelligence for `ip`; `Ok(None)` when the feature is disabled.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn analyze_request(&self, ip: IpAddr) -> Result<Option<IpIntelligence>, IntelError> {
        if !self.config.enabled {
            return Ok(None);
        }
        let now_ms = unix_millis();
        if is_internal(ip) {
            return Ok(Some(IpIntelligence {
                record: IpIntelligenceRecord::neutral(ip, now_ms),
                cache_hit: false,
            }));
        }

        let ttl = Duration::from_secs(self.config.cache_ttl_secs);
        let key = self.keys.key("ip", &ip.to_string());

        match get_json::<IpIntelligenceRecord>(self.store.as_ref(), &key).await {
            Ok(Some(record)) if now_ms.saturating_sub(record.cached_at) <= ttl.as_millis() as u64 => {
                return Ok(Some(IpIntelligence {
                    record,
                    cache_hit: true,
                }));
            }
            Ok(_) => {}
            Err(e) => tracing::debug!(error = %e, "IP cache read failed; treating as miss"),
        }

        if !self.breaker.allow() {
            return Err(IntelError::CircuitOpen);
        }

        let timeout = Duration::from_millis(self.config.timeout_ms);
        let mut record = match tokio::time::timeout(timeout, self.provider.lookup(ip)).await {
            Ok(Ok(record)) => {
                self.breaker.record_success();
                record
            }
            Ok(Err(e)) => {
                self.breaker.record_failure();
                return Err(e.into());
            }
            Err(_) => {
                self.breaker.record_failure();
                return Err(IntelError::Timeout(timeout));
            }
        };
        record.cached_at = now_ms;

        if let Err(e) = set_json(self.store.as_ref(), &key, &record, ttl).await {
            tracing::warn!(error = %e, "Failed to cache IP intelligence");
        }

        Ok(Some(IpIntelligence {
            record,
            cache_hit: false,
        }))
    }

    /// Deny reason when the record matches the country/ASN policy.
    pub fn policy_violation(&self, record: &IpIntelligenceRecord) -> Option<String> {
        if let Some(country) = &record.country {
            if self
                .config
                .denied_countries
                .iter()
                .any(|c| c.eq_ignore_ascii_case(country))
            {
                return Some(format!("country {country} denied"));
            }
        }
        if let Some(asn) = record.asn {
            if self.config.denied_asns.contains(&asn) {
                return Some(format!("AS{asn} denied"));
            }
        }
        None
    }
}

fn is_internal(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_private() || v4.is_loopback() || v4.is_link_local() || v4.is_unspecified(),
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unspecified()
                // fc00::/7 unique local, fe80::/10 link local
                || (v6.segments()[0] & 0xfe00) == 0xfc00
                || (v6.segments()[0] & 0xffc0) == 0xfe80
        }
    }
}
