//! Append-only security event log in the shared store.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::store::{SharedStore, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Tier for an anomaly score; `None` below `low`.
    pub fn from_score(score: u8) -> Option<Self> {
        match score {
            85..=u8::MAX => Some(Self::Critical),
            70..=84 => Some(Self::High),
            50..=69 => Some(Self::Medium),
            25..=49 => Some(Self::Low),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "critical" => Ok(Self::Critical),
            other => Err(format!("unknown severity '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    RateLimitExceeded,
    CsrfInvalid,
    AutoBlocked,
    BlockedRequest,
    IpDenied,
    AnomalyDetected,
    AppCheckMissing,
    UpstreamDependencyUnavailable,
    MalformedRequest,
    Unblocked,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RateLimitExceeded => "rate_limit_exceeded",
            Self::CsrfInvalid => "csrf_invalid",
            Self::AutoBlocked => "auto_blocked",
            Self::BlockedRequest => "blocked_request",
            Self::IpDenied => "ip_denied",
            Self::AnomalyDetected => "anomaly_detected",
            Self::AppCheckMissing => "app_check_missing",
            Self::UpstreamDependencyUnavailable => "upstream_dependency_unavailable",
            Self::MalformedRequest => "malformed_request",
            Self::Unblocked => "unblocked",
        }
    }
}

impl FromStr for EventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_value(serde_json::Value::String(s.to_string()))
            .map_err(|_| format!("unknown event type '{s}'"))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityEvent {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub identity: String,
    pub severity: Severity,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl SecurityEvent {
    pub fn new(
        event_type: EventType,
        identity: impl Into<String>,
        severity: Severity,
        metadata: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type,
            identity: identity.into(),
            severity,
            timestamp: Utc::now(),
            metadata,
        }
    }
}

/// Filters and paging for the event feed.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EventQuery {
    pub offset: usize,
    pub limit: Option<usize>,
    pub severity: Option<Severity>,
    #[serde(rename = "type")]
    pub event_type: Option<EventType>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventPage {
    pub events: Vec<SecurityEvent>,
    pub total: usize,
    pub offset: usize,
    pub limit: usize,
}

const DEFAULT_PAGE: usize = 50;
const MAX_PAGE: usize = 500;

/// Capped event list, newest first.
#[derive(Clone)]
pub struct EventLog {
    store: SharedStore,
    key: String,
    max_events: usize,
}

impl EventLog {
    pub fn new(store: SharedStore, key: String, max_events: usize) -> Self {
        Self {
            store,
            key,
            max_events,
        }
    }

    pub async fn append(&self, event: &SecurityEvent) -> Result<(), StoreError> {
        let raw = serde_json::to_string(event).map_err(|e| StoreError::Serialization(e.to_string()))?;
        self.store.push_capped(&self.key, &raw, self.max_events).await
    }

    /// One page of events matching the query.
    pub async fn page(&self, query: &EventQuery) -> Result<EventPage, StoreError> {
        let limit = query.limit.unwrap_or(DEFAULT_PAGE).clamp(1, MAX_PAGE);

        if query.severity.is_none() && query.event_type.is_none() {
            let total = self.store.list_len(&self.key).await?;
            let events = self
                .store
                .range(&self.key, query.offset, limit)
                .await?
                .iter()
                .filter_map(|raw| decode(raw))
                .collect();
            return Ok(EventPage {
                events,
                total,
                offset: query.offset,
                limit,
            });
        }

        let matching: Vec<SecurityEvent> = self
            .store
            .range(&self.key, 0, self.max_events)
            .await?
            .iter()
            .filter_map(|raw| decode(raw))
            .filter(|e| query.severity.is_none_or(|s| e.severity == s))
            .filter(|e| query.event_type.is_none_or(|t| e.event_type == t))
            .collect();
        let total = matching.len();
        let events = matching.into_iter().skip(query.offset).take(limit).collect();

        Ok(EventPage {
            events,
            total,
            offset: query.offset,
            limit,
        })
    }
}

fn decode(raw: &str) -> Option<SecurityEvent> {
    match serde_json::from_str(raw) {
        Ok(event) => Some(event),
        Err(e) => {
            tracing::debug!(error = %e, "Skipping undecodable security event");
            None
        }
    }
}
