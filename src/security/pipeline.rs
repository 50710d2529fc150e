//! The request interceptor composing every security component.
//!
//! # Responsibilities
//! - Run the checks in latency order, short-circuiting on the first deny
//! - Apply the store failure policy uniformly
//! - Decorate every response (allowed or denied) with security headers
//!
//! # Design Decisions
//! - The guard is immutable; hot reload swaps a whole new guard in via
//!   `ArcSwap`, built over the same store and monitor
//! - Independent store round-trips are awaited together with `tokio::join!`

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use arc_swap::ArcSwap;
use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{header, HeaderMap, HeaderValue, Method, Request},
    middleware::Next,
    response::{IntoResponse, Response},
};
use axum_extra::extract::cookie::Cookie;
use serde_json::json;

use crate::config::{FailurePolicy, GuardConfig};
use crate::observability::events::{EventLog, EventType, SecurityEvent, Severity};
use crate::observability::metrics;
use crate::observability::monitor::SecurityMonitor;
use crate::security::anomaly::{AnomalyDetector, AnomalyVerdict, RequestContext};
use crate::security::app_check::{AppCheckGate, AppCheckOutcome};
use crate::security::csrf::{CsrfFailure, CsrfGuard};
use crate::security::endpoint::{get_rate_limit_config_for_endpoint, is_unsafe, prefix_matches, EndpointLimit};
use crate::security::error::{SecurityError, SetupError};
use crate::security::headers::{CspNonce, SecurityHeaders, X_NONCE};
use crate::security::identity::{self, ClientIdentity};
use crate::security::ip_intel::{HttpIpProvider, IntelError, IpIntelService, IpReputationProvider};
use crate::security::rate_limit::{RateLimitDecision, RateLimiter};
use crate::security::signatures::SignatureSet;
use crate::security::unix_millis;
use crate::store::{KeySpace, SharedStore, StoreError};

/// Shared, swappable guard used by the middleware and the admin API.
pub type GuardHandle = Arc<ArcSwap<Guard>>;

/// What an admitted request carries back to its response.
#[derive(Default)]
struct Admission {
    rate: Option<RateLimitDecision>,
    cookie: Option<Cookie<'static>>,
}

/// All security components for one configuration.
pub struct Guard {
    config: GuardConfig,
    store: SharedStore,
    rate_limiter: RateLimiter,
    csrf: CsrfGuard,
    ip_intel: IpIntelService,
    anomaly: AnomalyDetector,
    headers: SecurityHeaders,
    app_check: AppCheckGate,
    monitor: SecurityMonitor,
    provider_override: Option<Arc<dyn IpReputationProvider>>,
}

impl Guard {
    /// Assemble the guard. `provider` overrides the configured HTTP
    /// reputation provider.
    pub fn new(
        config: GuardConfig,
        store: SharedStore,
        monitor: SecurityMonitor,
        provider: Option<Arc<dyn IpReputationProvider>>,
    ) -> Result<Self, SetupError> {
        let keys = KeySpace::new(config.store.key_prefix.clone());
        let provider_override = provider;
        let provider: Arc<dyn IpReputationProvider> = match &provider_override {
            Some(p) => p.clone(),
            None => Arc::new(HttpIpProvider::new(&config.ip_intel)?),
        };
        let signatures = Arc::new(SignatureSet::builtin()?);

        Ok(Self {
            rate_limiter: RateLimiter::new(store.clone(), keys.clone(), config.rate_limit.clone()),
            csrf: CsrfGuard::new(config.csrf.clone(), store.clone(), keys.clone())?,
            ip_intel: IpIntelService::new(provider, store.clone(), keys.clone(), config.ip_intel.clone()),
            anomaly: AnomalyDetector::new(store.clone(), keys, config.anomaly.clone(), signatures),
            headers: SecurityHeaders::new(config.headers.clone()),
            app_check: AppCheckGate::new(config.app_check.clone()),
            monitor,
            provider_override,
            store,
            config,
        })
    }

    /// A guard for `config` sharing this guard's store and monitor.
    pub fn rebuild(&self, config: GuardConfig) -> Result<Self, SetupError> {
        Self::new(
            config,
            self.store.clone(),
            self.monitor.clone(),
            self.provider_override.clone(),
        )
    }

    /// Monitor writing events into `store` under the configured prefix.
    pub fn new_monitor(config: &GuardConfig, store: SharedStore) -> SecurityMonitor {
        let key = format!("{}:events", config.store.key_prefix);
        SecurityMonitor::new(EventLog::new(store, key, config.events.max_events))
    }

    pub fn config(&self) -> &GuardConfig {
        &self.config
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    pub fn anomaly(&self) -> &AnomalyDetector {
        &self.anomaly
    }

    pub fn monitor(&self) -> &SecurityMonitor {
        &self.monitor
    }

    fn is_static(&self, path: &str) -> bool {
        self.config
            .upstream
            .static_prefixes
            .iter()
            .any(|p| prefix_matches(path, p))
    }

    /// Run the pipeline for one request.
    pub async fn handle(&self, peer: Option<SocketAddr>, mut request: Request<Body>, next: Next) -> Response {
        let started = Instant::now();
        let now_ms = unix_millis();
        let nonce = CspNonce::new(now_ms);
        let path = request.uri().path().to_string();

        if self.is_static(&path) {
            let mut response = next.run(request).await;
            self.headers.apply(response.headers_mut(), &nonce);
            return response;
        }

        let identity = identity::resolve(request.headers(), peer, &self.config.identity);
        let endpoint = get_rate_limit_config_for_endpoint(&self.config.rate_limit, &path, request.method());
        let class = endpoint
            .as_ref()
            .map(|e| e.class.clone())
            .unwrap_or_else(|| "unclassified".to_string());

        if let Ok(value) = HeaderValue::from_str(nonce.value()) {
            request.headers_mut().insert(X_NONCE, value);
        }
        request.extensions_mut().insert(identity.clone());
        request.extensions_mut().insert(nonce.clone());

        let mut admission = Admission::default();
        let verdict = self
            .evaluate(&identity, endpoint.as_ref(), &mut request, now_ms, &mut admission)
            .await;

        match verdict {
            Ok(()) => {
                let mut response = next.run(request).await;
                let status = response.status();
                let headers = response.headers_mut();
                if let Some(rate) = &admission.rate {
                    rate.apply_headers(headers);
                }
                if let Some(cookie) = admission.cookie {
                    if let Ok(value) = HeaderValue::from_str(&cookie.to_string()) {
                        headers.append(header::SET_COOKIE, value);
                    }
                }
                self.headers.apply(headers, &nonce);

                let outcome = if status.is_server_error() { "upstream_error" } else { "allowed" };
                self.monitor.record_response_time(&class, outcome, started.elapsed());
                self.monitor.update_ip_metrics(identity.key(), false);

                if self.anomaly.enabled() && status.is_client_error() {
                    let anomaly = self.anomaly.clone();
                    let code = status.as_u16();
                    tokio::spawn(async move {
                        if let Err(e) = anomaly.record_outcome(&identity, code).await {
                            tracing::debug!(error = %e, "Failed to record response outcome");
                        }
                    });
                }
                response
            }
            Err(err) => {
                metrics::record_denial(err.code());
                let code = err.code();
                let mut response = err.into_response();
                let headers = response.headers_mut();
                if let Some(rate) = &admission.rate {
                    if !headers.contains_key("x-ratelimit-limit") {
                        rate.apply_headers(headers);
                    }
                }
                self.headers.apply(headers, &nonce);

                self.monitor.record_response_time(&class, code, started.elapsed());
                self.monitor.update_ip_metrics(identity.key(), true);
                response
            }
        }
    }

    async fn evaluate(
        &self,
        identity: &ClientIdentity,
        endpoint: Option<&EndpointLimit>,
        request: &mut Request<Body>,
        now_ms: u64,
        admission: &mut Admission,
    ) -> Result<(), SecurityError> {
        let path = request.uri().path().to_string();
        let method = request.method().clone();

        // Active blocks preempt everything; the limiter still counts this request.
        let block_check = async {
            if self.anomaly.enabled() {
                self.anomaly.check_block(identity, now_ms).await
            } else {
                Ok(None)
            }
        };
        let rate_check = async {
            match endpoint {
                Some(ep) if self.rate_limiter.applies_to(identity) => {
                    self.rate_limiter.check_rate_limit(identity, ep).await.map(Some)
                }
                _ => Ok(None),
            }
        };
        let (block, rate) = tokio::join!(block_check, rate_check);

        match block {
            Ok(Some(state)) => {
                self.event(
                    EventType::BlockedRequest,
                    identity,
                    Severity::Medium,
                    json!({
                        "path": path,
                        "blocked_until": state.blocked_until,
                        "violations": state.violation_count,
                    }),
                )
                .await;
                return Err(SecurityError::AutoBlocked {
                    retry_after: state.retry_after(now_ms),
                    reason: state.reason,
                });
            }
            Ok(None) => {}
            Err(e) => self.on_store_failure("auto_block", identity, &e).await?,
        }

        match rate {
            Ok(Some(decision)) if !decision.allowed => {
                self.monitor
                    .log_rate_limit_exceeded(identity.key(), &path, &decision)
                    .await;
                return Err(SecurityError::RateLimitExceeded(decision));
            }
            Ok(decision) => admission.rate = decision,
            Err(e) => self.on_store_failure("rate_limit", identity, &e).await?,
        }

        match self.app_check.check(&path, request.headers()) {
            AppCheckOutcome::Pass => {}
            AppCheckOutcome::MissingAllowed => {
                self.event(
                    EventType::AppCheckMissing,
                    identity,
                    Severity::Low,
                    json!({ "path": path, "mode": "lenient" }),
                )
                .await;
            }
            AppCheckOutcome::Denied => {
                self.event(
                    EventType::AppCheckMissing,
                    identity,
                    Severity::Medium,
                    json!({ "path": path, "mode": "strict" }),
                )
                .await;
                return Err(SecurityError::AppCheckRequired);
            }
        }

        self.check_csrf(identity, &path, &method, request, now_ms, admission)
            .await?;

        let ctx = RequestContext {
            method: method.to_string(),
            path: path.clone(),
            query: request.uri().query().map(str::to_string),
            user_agent: request
                .headers()
                .get(header::USER_AGENT)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string),
            has_accept: request.headers().contains_key(header::ACCEPT),
            timestamp_ms: now_ms,
        };

        let profile_update = async {
            if self.anomaly.enabled() {
                Some(self.anomaly.record_request(identity, &ctx).await)
            } else {
                None
            }
        };
        let (intel, profile) = tokio::join!(self.ip_intel.analyze_request(identity.ip), profile_update);

        let intel = match intel {
            Ok(Some(intel)) => {
                metrics::record_ip_lookup(if intel.cache_hit { "hit" } else { "miss" });
                Some(intel)
            }
            Ok(None) => None,
            Err(IntelError::CircuitOpen) => {
                metrics::record_ip_lookup("error");
                None
            }
            Err(e) => {
                metrics::record_ip_lookup("error");
                tracing::warn!(client = %identity.key(), error = %e, "IP intelligence unavailable");
                self.event(
                    EventType::UpstreamDependencyUnavailable,
                    identity,
                    Severity::Low,
                    json!({ "dependency": "ip_intel", "error": e.to_string() }),
                )
                .await;
                None
            }
        };

        if let Some(intel) = &intel {
            if let Some(reason) = self.ip_intel.policy_violation(&intel.record) {
                self.event(
                    EventType::IpDenied,
                    identity,
                    Severity::High,
                    json!({
                        "path": path,
                        "reason": reason,
                        "country": intel.record.country,
                        "asn": intel.record.asn,
                    }),
                )
                .await;
                return Err(SecurityError::IpDenied(reason));
            }
        }

        match profile {
            Some(Ok(profile)) => {
                match self
                    .anomaly
                    .analyze_and_block(identity, &ctx, &profile, intel.as_ref())
                    .await
                {
                    Ok(verdict) => self.handle_verdict(identity, &path, verdict, now_ms).await?,
                    Err(e) => self.on_store_failure("anomaly", identity, &e).await?,
                }
            }
            Some(Err(e)) => self.on_store_failure("anomaly", identity, &e).await?,
            None => {}
        }

        Ok(())
    }

    async fn check_csrf(
        &self,
        identity: &ClientIdentity,
        path: &str,
        method: &Method,
        request: &mut Request<Body>,
        now_ms: u64,
        admission: &mut Admission,
    ) -> Result<(), SecurityError> {
        if !is_unsafe(method) {
            admission.cookie = self.csrf.ensure_csrf_cookie(request.headers(), now_ms);
            return Ok(());
        }
        if self.csrf.is_exempt(path) {
            return Ok(());
        }

        let from_header = self.csrf.header_token(request.headers()).map(str::to_string);
        let submitted = match from_header {
            Some(token) => Some(token),
            None if is_form(request.headers()) => {
                let body = std::mem::take(request.body_mut());
                let bytes = match axum::body::to_bytes(body, self.config.listener.max_body_bytes).await {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        self.event(
                            EventType::MalformedRequest,
                            identity,
                            Severity::Low,
                            json!({ "path": path, "error": e.to_string() }),
                        )
                        .await;
                        return Err(SecurityError::MalformedRequest("unreadable request body".into()));
                    }
                };
                let token = self.csrf.form_token(&bytes);
                *request.body_mut() = Body::from(bytes);
                token
            }
            None => None,
        };

        let token = match self.csrf.validate(request.headers(), submitted.as_deref(), now_ms) {
            Ok(token) => token,
            Err(failure) => return Err(self.csrf_denied(identity, path, failure).await),
        };

        if self.csrf.should_consume(path) {
            match self.csrf.consume_token(&token, now_ms).await {
                Ok(true) => admission.cookie = Some(self.csrf.cookie(&self.csrf.issue(now_ms))),
                Ok(false) => return Err(self.csrf_denied(identity, path, CsrfFailure::Replayed).await),
                Err(e) => self.on_store_failure("csrf", identity, &e).await?,
            }
        }
        Ok(())
    }

    async fn csrf_denied(&self, identity: &ClientIdentity, path: &str, failure: CsrfFailure) -> SecurityError {
        let severity = if failure == CsrfFailure::Replayed || failure == CsrfFailure::BadSignature {
            Severity::High
        } else {
            Severity::Medium
        };
        self.event(
            EventType::CsrfInvalid,
            identity,
            severity,
            json!({ "path": path, "reason": failure.as_str() }),
        )
        .await;
        SecurityError::CsrfInvalid(failure)
    }

    async fn handle_verdict(
        &self,
        identity: &ClientIdentity,
        path: &str,
        verdict: AnomalyVerdict,
        now_ms: u64,
    ) -> Result<(), SecurityError> {
        metrics::record_anomaly_score(verdict.score);

        if verdict.blocked {
            metrics::record_auto_block();
            let until = verdict.blocked_until.unwrap_or(now_ms);
            self.event(
                EventType::AutoBlocked,
                identity,
                verdict.severity.unwrap_or(Severity::High),
                json!({
                    "path": path,
                    "score": verdict.score,
                    "reasons": verdict.reasons,
                    "blocked_until": until,
                    "violations": verdict.violation_count,
                }),
            )
            .await;
            return Err(SecurityError::AutoBlocked {
                reason: verdict.reasons.join(", "),
                retry_after: until.saturating_sub(now_ms).div_ceil(1000).max(1),
            });
        }

        if let Some(severity) = verdict.severity {
            self.event(
                EventType::AnomalyDetected,
                identity,
                severity,
                json!({ "path": path, "score": verdict.score, "reasons": verdict.reasons }),
            )
            .await;
        }
        Ok(())
    }

    /// Record a store outage and apply the failure policy.
    async fn on_store_failure(
        &self,
        component: &'static str,
        identity: &ClientIdentity,
        error: &StoreError,
    ) -> Result<(), SecurityError> {
        let policy = self.config.store.failure_policy;
        metrics::record_store_error(component, policy.as_str());
        tracing::warn!(
            component,
            policy = policy.as_str(),
            client = %identity.key(),
            error = %error,
            "Shared store failure"
        );
        self.event(
            EventType::UpstreamDependencyUnavailable,
            identity,
            Severity::Medium,
            json!({
                "dependency": "store",
                "component": component,
                "policy": policy.as_str(),
                "error": error.to_string(),
            }),
        )
        .await;

        match policy {
            FailurePolicy::Open => Ok(()),
            FailurePolicy::Closed => Err(SecurityError::UpstreamDependencyUnavailable(format!(
                "{component}: {error}"
            ))),
        }
    }

    async fn event(&self, event_type: EventType, identity: &ClientIdentity, severity: Severity, metadata: serde_json::Value) {
        self.monitor
            .log_security_event(SecurityEvent::new(event_type, identity.key(), severity, metadata))
            .await;
    }
}

fn is_form(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with("application/x-www-form-urlencoded"))
}

/// Axum middleware entry point.
pub async fn guard_middleware(State(guards): State<GuardHandle>, request: Request<Body>, next: Next) -> Response {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let guard = guards.load_full();
    guard.handle(peer, request, next).await
}
