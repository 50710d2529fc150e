//! Security monitoring: event writes plus in-process aggregation for the
//! admin surface.
//!
//! # Responsibilities
//! - Persist security events and emit a matching structured log line
//! - Count outcomes and response times per endpoint class
//! - Track the noisiest client addresses
//!
//! # Design Decisions
//! - Event writes are awaited so a deny is never returned before its event
//!   is stored; a failed write is logged and never changes the response
//! - Aggregates are per instance; the event log is shared

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Serialize;

use crate::observability::events::{EventLog, EventPage, EventQuery, EventType, SecurityEvent, Severity};
use crate::observability::metrics;
use crate::security::rate_limit::RateLimitDecision;
use crate::store::StoreError;

/// Addresses tracked before the coldest are evicted.
const MAX_TRACKED_IPS: usize = 10_000;

/// Offenders listed in a snapshot.
const TOP_OFFENDERS: usize = 10;

#[derive(Debug, Default, Clone, Copy)]
struct TimingAccumulator {
    count: u64,
    total_micros: u64,
    max_micros: u64,
}

#[derive(Debug, Default, Clone, Copy)]
struct IpCounters {
    requests: u64,
    denials: u64,
    /// Sequence number of the latest request.
    last_seen: u64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ResponseTimeSummary {
    pub count: u64,
    pub avg_ms: f64,
    pub max_ms: f64,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct IpActivity {
    pub ip: String,
    pub requests: u64,
    pub denials: u64,
}

/// Aggregated view served by the admin API.
#[derive(Debug, Clone, Serialize)]
pub struct SecurityMetrics {
    pub uptime_secs: u64,
    pub counters: BTreeMap<String, u64>,
    pub response_times: BTreeMap<String, ResponseTimeSummary>,
    pub top_offenders: Vec<IpActivity>,
    pub tracked_ips: usize,
}

#[derive(Clone)]
pub struct SecurityMonitor {
    events: EventLog,
    started_at: Instant,
    counters: Arc<DashMap<String, u64>>,
    timings: Arc<DashMap<String, TimingAccumulator>>,
    ips: Arc<DashMap<String, IpCounters>>,
    ip_capacity: usize,
    ip_sequence: Arc<AtomicU64>,
    pruning: Arc<AtomicBool>,
}

impl SecurityMonitor {
    pub fn new(events: EventLog) -> Self {
        Self {
            events,
            started_at: Instant::now(),
            counters: Arc::new(DashMap::new()),
            timings: Arc::new(DashMap::new()),
            ips: Arc::new(DashMap::new()),
            ip_capacity: MAX_TRACKED_IPS,
            ip_sequence: Arc::new(AtomicU64::new(0)),
            pruning: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Override how many client addresses are tracked.
    pub fn with_ip_capacity(mut self, capacity: usize) -> Self {
        self.ip_capacity = capacity.max(1);
        self
    }

    /// Add `value` to a named counter.
    pub fn record_metric(&self, name: &str, value: u64) {
        *self.counters.entry(name.to_string()).or_insert(0) += value;
    }

    /// Record one request's latency and outcome for its endpoint class.
    pub fn record_response_time(&self, class: &str, outcome: &str, elapsed: Duration) {
        let micros = elapsed.as_micros() as u64;
        let mut timing = self.timings.entry(class.to_string()).or_default();
        timing.count += 1;
        timing.total_micros += micros;
        timing.max_micros = timing.max_micros.max(micros);
        drop(timing);

        self.record_metric(&format!("outcome.{outcome}"), 1);
        metrics::record_request(class, outcome, elapsed);
    }

    /// Count a request (and whether it was denied) for a client address.
    pub fn update_ip_metrics(&self, ip: &str, denied: bool) {
        let seq = self.ip_sequence.fetch_add(1, Ordering::Relaxed);
        let fresh = {
            let mut entry = self.ips.entry(ip.to_string()).or_default();
            entry.requests += 1;
            entry.last_seen = seq;
            if denied {
                entry.denials += 1;
            }
            entry.requests == 1
        };
        if fresh && self.ips.len() > self.ip_capacity {
            self.evict_cold_ips();
        }
    }

    /// Drop the least-denied, least-active, longest-idle addresses down to
    /// 90% of capacity, so eviction runs once per tenth of capacity in new
    /// addresses.
    fn evict_cold_ips(&self) {
        if self.pruning.swap(true, Ordering::AcqRel) {
            return;
        }
        let target = self.ip_capacity - self.ip_capacity / 10;
        let excess = self.ips.len().saturating_sub(target);
        if excess > 0 {
            let mut coldest: Vec<(u64, u64, u64, String)> = self
                .ips
                .iter()
                .map(|e| {
                    let c = e.value();
                    (c.denials, c.requests, c.last_seen, e.key().clone())
                })
                .collect();
            coldest.sort_unstable();
            for (.., ip) in coldest.into_iter().take(excess) {
                self.ips.remove(&ip);
            }
            tracing::debug!(evicted = excess, tracked = self.ips.len(), "Evicted cold client addresses");
        }
        self.pruning.store(false, Ordering::Release);
    }

    /// Persist an event, log it, and count it.
    pub async fn log_security_event(&self, event: SecurityEvent) {
        match event.severity {
            Severity::High | Severity::Critical => tracing::warn!(
                event_id = %event.id,
                event_type = event.event_type.as_str(),
                identity = %event.identity,
                severity = event.severity.as_str(),
                metadata = %event.metadata,
                "Security event"
            ),
            _ => tracing::info!(
                event_id = %event.id,
                event_type = event.event_type.as_str(),
                identity = %event.identity,
                severity = event.severity.as_str(),
                metadata = %event.metadata,
                "Security event"
            ),
        }

        metrics::record_security_event(event.event_type.as_str(), event.severity.as_str());
        self.record_metric(&format!("events.{}", event.event_type.as_str()), 1);

        if let Err(e) = self.events.append(&event).await {
            tracing::error!(error = %e, event_id = %event.id, "Failed to persist security event");
            self.record_metric("events.write_failures", 1);
        }
    }

    pub async fn log_rate_limit_exceeded(&self, identity: &str, path: &str, decision: &RateLimitDecision) {
        let event = SecurityEvent::new(
            EventType::RateLimitExceeded,
            identity,
            Severity::Medium,
            serde_json::json!({
                "path": path,
                "class": decision.class,
                "limit": decision.limit,
                "retry_after": decision.retry_after,
            }),
        );
        self.log_security_event(event).await;
    }

    /// Event feed page for the admin API.
    pub async fn events(&self, query: &EventQuery) -> Result<EventPage, StoreError> {
        self.events.page(query).await
    }

    pub fn snapshot(&self) -> SecurityMetrics {
        let counters = self
            .counters
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect();

        let response_times = self
            .timings
            .iter()
            .map(|e| {
                let t = e.value();
                let avg_ms = if t.count == 0 {
                    0.0
                } else {
                    t.total_micros as f64 / t.count as f64 / 1000.0
                };
                (
                    e.key().clone(),
                    ResponseTimeSummary {
                        count: t.count,
                        avg_ms,
                        max_ms: t.max_micros as f64 / 1000.0,
                    },
                )
            })
            .collect();

        let mut offenders: Vec<IpActivity> = self
            .ips
            .iter()
            .filter(|e| e.value().denials > 0)
            .map(|e| IpActivity {
                ip: e.key().clone(),
                requests: e.value().requests,
                denials: e.value().denials,
            })
            .collect();
        offenders.sort_by(|a, b| b.denials.cmp(&a.denials).then_with(|| a.ip.cmp(&b.ip)));
        offenders.truncate(TOP_OFFENDERS);

        SecurityMetrics {
            uptime_secs: self.started_at.elapsed().as_secs(),
            counters,
            response_times,
            top_offenders: offenders,
            tracked_ips: self.ips.len(),
        }
    }
}
