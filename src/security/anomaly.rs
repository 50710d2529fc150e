//! Behavioral anomaly detection and progressive auto-blocking.
//!
//! # Responsibilities
//! - Maintain a rolling per-client profile in the shared store
//! - Score each request (0-100) from rate deviation, header heuristics,
//!   IP reputation, attack signatures and recent error ratio
//! - Block clients crossing the threshold, doubling the block for every
//!   violation within the lookback window
//!
//! # Block escalation
//! ```text
//! violation n (within lookback of n-1) → block for base * 2^(n-1), capped at max
//! clean requests never reset n; only a full lookback without violations does
//! offending requests while a block is in force are not new violations
//! ```

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::AnomalyConfig;
use crate::observability::events::Severity;
use crate::security::identity::ClientIdentity;
use crate::security::ip_intel::IpIntelligence;
use crate::security::signatures::SignatureSet;
use crate::store::{get_json, set_json, KeySpace, SharedStore, StoreError};

/// Minimum spacing between baseline updates.
const BASELINE_INTERVAL_MS: u64 = 60_000;

/// Weight of the newest sample in the baseline average.
const BASELINE_ALPHA: f64 = 0.2;

/// Requests within one second that count as a burst regardless of baseline.
const BURST_PER_SECOND: usize = 20;

/// Requests needed in the error window before the error ratio is trusted.
const MIN_ERROR_SAMPLE: u64 = 10;

const SCANNER_AGENTS: &[&str] = &[
    "sqlmap", "nikto", "nmap", "masscan", "zgrab", "nuclei", "dirbuster", "gobuster",
    "wpscan", "acunetix", "nessus", "openvas", "w3af", "feroxbuster", "ffuf",
];

const SCRIPTED_AGENTS: &[&str] = &[
    "curl/", "wget/", "python-requests", "python-urllib", "go-http-client", "libwww-perl",
    "httpie", "scrapy", "java/", "aiohttp",
];

/// The parts of a request the detector looks at.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub method: String,
    pub path: String,
    pub query: Option<String>,
    pub user_agent: Option<String>,
    pub has_accept: bool,
    pub timestamp_ms: u64,
}

impl RequestContext {
    fn target(&self) -> String {
        match &self.query {
            Some(q) => format!("{}?{}", self.path, q),
            None => self.path.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileEntry {
    pub timestamp: u64,
    pub path: String,
    pub method: String,
}

/// Rolling per-client behavior profile.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnomalyProfile {
    pub entries: VecDeque<ProfileEntry>,
    /// Exponentially weighted requests per minute.
    pub baseline_rpm: Option<f64>,
    pub baseline_updated_at: u64,
    pub last_fingerprint: Option<String>,
    /// Fingerprint changes seen while the profile was alive.
    pub fingerprint_changes: u32,
}

impl AnomalyProfile {
    /// Append a request and refresh derived state. Pure; persistence is the
    /// detector's job.
    pub fn observe(&mut self, ctx: &RequestContext, fingerprint: Option<&str>, max_entries: usize) {
        let now = ctx.timestamp_ms;
        self.entries.push_back(ProfileEntry {
            timestamp: now,
            path: ctx.path.clone(),
            method: ctx.method.clone(),
        });
        while self.entries.len() > max_entries.max(1) {
            self.entries.pop_front();
        }

        if let Some(fp) = fingerprint {
            if self.last_fingerprint.as_deref().is_some_and(|last| last != fp) {
                self.fingerprint_changes = self.fingerprint_changes.saturating_add(1);
            }
            self.last_fingerprint = Some(fp.to_string());
        }

        if now.saturating_sub(self.baseline_updated_at) >= BASELINE_INTERVAL_MS {
            let sample = self.requests_since(now.saturating_sub(60_000)) as f64;
            self.baseline_rpm = Some(match self.baseline_rpm {
                Some(b) => b * (1.0 - BASELINE_ALPHA) + sample * BASELINE_ALPHA,
                None => sample,
            });
            self.baseline_updated_at = now;
        }
    }

    /// Entries newer than `since_ms`.
    pub fn requests_since(&self, since_ms: u64) -> usize {
        self.entries
            .iter()
            .rev()
            .take_while(|e| e.timestamp > since_ms)
            .count()
    }
}

/// Score and the signals behind it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnomalyScore {
    pub score: u8,
    pub severity: Option<Severity>,
    pub reasons: Vec<String>,
}

/// Outcome of analysis.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnomalyVerdict {
    pub blocked: bool,
    pub score: u8,
    pub severity: Option<Severity>,
    pub reasons: Vec<String>,
    /// Unix milliseconds; set when this request triggered a block.
    pub blocked_until: Option<u64>,
    pub violation_count: Option<u64>,
}

/// Progressive block record, one per identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockState {
    pub active: bool,
    pub blocked_at: u64,
    /// Unix milliseconds.
    pub blocked_until: u64,
    pub violation_count: u64,
    pub reason: String,
}

impl BlockState {
    /// Denied while `now < blocked_until`.
    pub fn is_blocking(&self, now_ms: u64) -> bool {
        self.active && now_ms < self.blocked_until
    }

    /// Whole seconds until the block lifts, at least 1.
    pub fn retry_after(&self, now_ms: u64) -> u64 {
        self.blocked_until.saturating_sub(now_ms).div_ceil(1000).max(1)
    }
}

/// Violations within the sliding lookback.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViolationHistory {
    pub count: u64,
    /// Unix milliseconds.
    pub last_violation_at: u64,
}

impl ViolationHistory {
    /// Count for a violation at `now_ms`. The run restarts at 1 once the
    /// previous violation is older than the lookback.
    pub fn next_count(&self, now_ms: u64, lookback_ms: u64) -> u64 {
        if self.count > 0 && now_ms.saturating_sub(self.last_violation_at) <= lookback_ms {
            self.count + 1
        } else {
            1
        }
    }
}

/// Store-backed detector.
#[derive(Clone)]
pub struct AnomalyDetector {
    store: SharedStore,
    keys: KeySpace,
    config: AnomalyConfig,
    signatures: Arc<SignatureSet>,
}

impl AnomalyDetector {
    pub fn new(store: SharedStore, keys: KeySpace, config: AnomalyConfig, signatures: Arc<SignatureSet>) -> Self {
        Self {
            store,
            keys,
            config,
            signatures,
        }
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn config(&self) -> &AnomalyConfig {
        &self.config
    }

    /// Append the request to the client's profile and persist it.
    #[tracing::instrument(level = "debug", skip_all, fields(client = %identity.key()))]
    pub async fn record_request(
        &self,
        identity: &ClientIdentity,
        ctx: &RequestContext,
    ) -> Result<AnomalyProfile, StoreError> {
        let key = self.keys.key("profile", identity.key());
        let mut profile = get_json::<AnomalyProfile>(self.store.as_ref(), &key)
            .await?
            .unwrap_or_default();

        profile.observe(ctx, identity.fingerprint.as_deref(), self.config.profile_size);

        set_json(
            self.store.as_ref(),
            &key,
            &profile,
            Duration::from_secs(self.config.profile_ttl_secs),
        )
        .await?;
        Ok(profile)
    }

    /// Score a request without side effects.
    pub fn score(
        &self,
        ctx: &RequestContext,
        profile: &AnomalyProfile,
        intel: Option<&IpIntelligence>,
        recent_errors: u64,
    ) -> AnomalyScore {
        let now = ctx.timestamp_ms;
        let mut score: u32 = 0;
        let mut reasons = Vec::new();

        // Rate against the client's own baseline, never below the absolute floor
        let current_rpm = profile.requests_since(now.saturating_sub(60_000)) as f64;
        let threshold = profile
            .baseline_rpm
            .map(|b| b * self.config.rate_deviation_factor)
            .unwrap_or(0.0)
            .max(self.config.min_rate_per_minute);
        if current_rpm > threshold {
            let excess = ((current_rpm / threshold) - 1.0) * 20.0;
            score += 30 + excess.min(20.0) as u32;
            reasons.push(format!("request_rate {current_rpm:.0}/min exceeds {threshold:.0}/min"));
        }
        if profile.requests_since(now.saturating_sub(1_000)) >= BURST_PER_SECOND {
            score += 20;
            reasons.push("burst".to_string());
        }

        // Header heuristics
        match ctx.user_agent.as_deref().map(str::to_ascii_lowercase) {
            None => {
                score += 20;
                reasons.push("missing_user_agent".to_string());
            }
            Some(ua) if ua.trim().is_empty() => {
                score += 20;
                reasons.push("missing_user_agent".to_string());
            }
            Some(ua) => {
                if let Some(tool) = SCANNER_AGENTS.iter().find(|s| ua.contains(**s)) {
                    score += 40;
                    reasons.push(format!("scanner_user_agent {tool}"));
                } else if SCRIPTED_AGENTS.iter().any(|s| ua.contains(*s)) {
                    score += 15;
                    reasons.push("scripted_client".to_string());
                }
            }
        }
        if !ctx.has_accept {
            score += 5;
            reasons.push("missing_accept".to_string());
        }
        if profile.fingerprint_changes >= 3 {
            score += 15;
            reasons.push(format!("fingerprint_churn {}", profile.fingerprint_changes));
        }

        // Reputation
        if let Some(intel) = intel {
            let record = &intel.record;
            let rep = u32::from(record.reputation_score) * 3 / 10;
            if rep > 0 {
                score += rep;
                reasons.push(format!("ip_reputation {}", record.reputation_score));
            }
            if record.is_proxy {
                score += 10;
                reasons.push("proxy".to_string());
            }
            if record.is_vpn {
                score += 5;
                reasons.push("vpn".to_string());
            }
        }

        // Attack signatures
        for kind in self.signatures.scan(&ctx.target()) {
            score += kind.weight();
            reasons.push(format!("signature {}", kind.as_str()));
        }

        // Error ratio over the error window
        let window_requests = profile
            .requests_since(now.saturating_sub(self.config.error_window_secs * 1000))
            as u64;
        if window_requests >= MIN_ERROR_SAMPLE {
            let ratio = recent_errors as f64 / window_requests as f64;
            if ratio >= 0.5 {
                score += 20;
                reasons.push(format!("error_ratio {ratio:.2}"));
            } else if ratio >= 0.3 {
                score += 10;
                reasons.push(format!("error_ratio {ratio:.2}"));
            }
        }

        let score = score.min(100) as u8;
        AnomalyScore {
            score,
            severity: Severity::from_score(score),
            reasons,
        }
    }

    /// Score the request and block the client if it crosses the threshold.
    #[tracing::instrument(level = "debug", skip_all, fields(client = %identity.key()))]
    pub async fn analyze_and_block(
        &self,
        identity: &ClientIdentity,
        ctx: &RequestContext,
        profile: &AnomalyProfile,
        intel: Option<&IpIntelligence>,
    ) -> Result<AnomalyVerdict, StoreError> {
        let recent_errors = self.recent_errors(identity).await?;
        let scored = self.score(ctx, profile, intel, recent_errors);

        if scored.score < self.config.block_threshold {
            return Ok(AnomalyVerdict {
                blocked: false,
                score: scored.score,
                severity: scored.severity,
                reasons: scored.reasons,
                blocked_until: None,
                violation_count: None,
            });
        }

        let reason = scored.reasons.join(", ");
        let state = self.block(identity, &reason, ctx.timestamp_ms).await?;
        Ok(AnomalyVerdict {
            blocked: true,
            score: scored.score,
            severity: scored.severity,
            reasons: scored.reasons,
            blocked_until: Some(state.blocked_until),
            violation_count: Some(state.violation_count),
        })
    }

    /// Record a violation and write the escalated block.
    ///
    /// While a block is in force the existing state is returned unchanged, so
    /// a burst of concurrent offending requests counts as one violation.
    pub async fn block(&self, identity: &ClientIdentity, reason: &str, now_ms: u64) -> Result<BlockState, StoreError> {
        let block_key = self.keys.key("block", identity.key());
        if let Some(existing) = self.active_block(&block_key, now_ms).await? {
            return Ok(existing);
        }

        let history_key = self.keys.key("violations", identity.key());
        let history = get_json::<ViolationHistory>(self.store.as_ref(), &history_key)
            .await?
            .unwrap_or_default();
        let count = history.next_count(now_ms, self.config.lookback_secs * 1000);

        let duration = self.block_duration(count);
        let state = BlockState {
            active: true,
            blocked_at: now_ms,
            blocked_until: now_ms + duration.as_millis() as u64,
            violation_count: count,
            reason: reason.to_string(),
        };
        let raw = serde_json::to_string(&state).map_err(|e| StoreError::Serialization(e.to_string()))?;

        // The block key is the claim: only its writer advances the history.
        if !self.store.set_nx(&block_key, &raw, duration).await? {
            match self.active_block(&block_key, now_ms).await? {
                Some(existing) => return Ok(existing),
                // Lapsed record still held by the store
                None => self.store.set(&block_key, &raw, duration).await?,
            }
        }

        set_json(
            self.store.as_ref(),
            &history_key,
            &ViolationHistory {
                count,
                last_violation_at: now_ms,
            },
            Duration::from_secs(self.config.lookback_secs),
        )
        .await?;

        tracing::warn!(
            client = %identity.key(),
            violations = count,
            duration_secs = duration.as_secs(),
            reason = %reason,
            "Client auto-blocked"
        );
        Ok(state)
    }

    async fn active_block(&self, block_key: &str, now_ms: u64) -> Result<Option<BlockState>, StoreError> {
        Ok(get_json::<BlockState>(self.store.as_ref(), block_key)
            .await?
            .filter(|state| state.is_blocking(now_ms)))
    }

    /// `base * 2^(n-1)`, capped at the configured maximum.
    pub fn block_duration(&self, violation_count: u64) -> Duration {
        let exponent = violation_count.saturating_sub(1).min(32) as u32;
        let secs = self
            .config
            .base_block_secs
            .saturating_mul(2u64.saturating_pow(exponent))
            .min(self.config.max_block_secs);
        Duration::from_secs(secs)
    }

    /// The block in force for `identity` at `now_ms`, if any.
    pub async fn check_block(&self, identity: &ClientIdentity, now_ms: u64) -> Result<Option<BlockState>, StoreError> {
        self.active_block(&self.keys.key("block", identity.key()), now_ms)
            .await
    }

    /// Stored block record for an identity key, active or not.
    pub async fn block_state(&self, identity_key: &str) -> Result<Option<BlockState>, StoreError> {
        get_json(self.store.as_ref(), &self.keys.key("block", identity_key)).await
    }

    /// Lift a block. Violation history is kept so a relapse still escalates.
    pub async fn unblock(&self, identity_key: &str) -> Result<bool, StoreError> {
        let key = self.keys.key("block", identity_key);
        let existed = self.store.get(&key).await?.is_some();
        self.store.delete(&key).await?;
        Ok(existed)
    }

    /// Count client-error responses for the error-ratio signal.
    pub async fn record_outcome(&self, identity: &ClientIdentity, status: u16) -> Result<(), StoreError> {
        if (400..500).contains(&status) {
            self.store
                .incr_window(
                    &self.keys.key("errors", identity.key()),
                    Duration::from_secs(self.config.error_window_secs),
                )
                .await?;
        }
        Ok(())
    }

    async fn recent_errors(&self, identity: &ClientIdentity) -> Result<u64, StoreError> {
        let raw = self.store.get(&self.keys.key("errors", identity.key())).await?;
        Ok(raw.and_then(|v| v.parse().ok()).unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::ip_intel::IpIntelligenceRecord;
    use crate::store::MemoryStore;

    const NOW: u64 = 1_700_000_000_000;

    fn detector() -> AnomalyDetector {
        let signatures = Arc::new(SignatureSet::builtin().unwrap());
        AnomalyDetector::new(
            Arc::new(MemoryStore::new()),
            KeySpace::new("test"),
            AnomalyConfig::default(),
            signatures,
        )
    }

    fn client() -> ClientIdentity {
        ClientIdentity::new("203.0.113.9".parse().unwrap(), Some("abcd".into()))
    }

    fn browser(path: &str, at: u64) -> RequestContext {
        RequestContext {
            method: "GET".into(),
            path: path.into(),
            query: None,
            user_agent: Some("Mozilla/5.0 (X11; Linux x86_64)".into()),
            has_accept: true,
            timestamp_ms: at,
        }
    }

    #[test]
    fn test_normal_browsing_scores_zero() {
        let detector = detector();
        let mut profile = AnomalyProfile::default();
        profile.observe(&browser("/store/acme", NOW), Some("abcd"), 50);
        let scored = detector.score(&browser("/store/acme", NOW), &profile, None, 0);
        assert_eq!(scored.score, 0);
        assert_eq!(scored.severity, None);
    }

    #[test]
    fn test_signals_accumulate() {
        let detector = detector();
        let mut ctx = browser("/.env", NOW);
        ctx.user_agent = Some("sqlmap/1.7".into());
        let mut profile = AnomalyProfile::default();
        profile.observe(&ctx, None, 50);

        let scored = detector.score(&ctx, &profile, None, 0);
        assert_eq!(scored.score, 80);
        assert_eq!(scored.severity, Some(Severity::High));
        assert!(scored.reasons.iter().any(|r| r.contains("sqlmap")));
        assert!(scored.reasons.iter().any(|r| r.contains("sensitive_file")));
    }

    #[test]
    fn test_reputation_and_proxy() {
        let detector = detector();
        let ctx = browser("/", NOW);
        let intel = IpIntelligence {
            record: IpIntelligenceRecord {
                ip: "203.0.113.9".into(),
                country: None,
                asn: None,
                reputation_score: 90,
                is_proxy: true,
                is_vpn: false,
                cached_at: NOW,
            },
            cache_hit: true,
        };
        let scored = detector.score(&ctx, &AnomalyProfile::default(), Some(&intel), 0);
        assert_eq!(scored.score, 27 + 10);
        assert_eq!(scored.severity, Some(Severity::Low));
    }

    #[test]
    fn test_rate_deviation_uses_floor() {
        let detector = detector();
        let mut profile = AnomalyProfile::default();
        // 90 requests within the last minute, spread so no one-second burst
        for i in 0..90u64 {
            profile.observe(&browser("/api/articles", NOW - 59_000 + i * 600), None, 200);
        }
        let scored = detector.score(&browser("/api/articles", NOW), &profile, None, 0);
        assert!(scored.score >= 30, "score {}", scored.score);
        assert!(scored.reasons[0].starts_with("request_rate"));
    }

    #[test]
    fn test_fingerprint_churn() {
        let mut profile = AnomalyProfile::default();
        for (i, fp) in ["a", "b", "c", "d"].iter().enumerate() {
            profile.observe(&browser("/", NOW + i as u64), Some(fp), 50);
        }
        assert_eq!(profile.fingerprint_changes, 3);
        assert_eq!(profile.last_fingerprint.as_deref(), Some("d"));
    }

    #[test]
    fn test_profile_is_bounded() {
        let mut profile = AnomalyProfile::default();
        for i in 0..20u64 {
            profile.observe(&browser("/", NOW + i), None, 5);
        }
        assert_eq!(profile.entries.len(), 5);
        assert_eq!(profile.entries.front().unwrap().timestamp, NOW + 15);
    }

    #[test]
    fn test_block_duration_escalates_and_caps() {
        let detector = detector();
        assert_eq!(detector.block_duration(1), Duration::from_secs(300));
        assert_eq!(detector.block_duration(2), Duration::from_secs(600));
        assert_eq!(detector.block_duration(3), Duration::from_secs(1200));
        assert_eq!(detector.block_duration(40), Duration::from_secs(7 * 24 * 3600));
    }

    #[tokio::test]
    async fn test_block_boundary() {
        let detector = detector();
        let identity = client();
        let state = detector.block(&identity, "test", NOW).await.unwrap();
        assert_eq!(state.blocked_until, NOW + 300_000);

        let until = state.blocked_until;
        assert!(detector.check_block(&identity, until - 1).await.unwrap().is_some());
        assert!(detector.check_block(&identity, until).await.unwrap().is_none());
        assert!(detector.check_block(&identity, until + 1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_repeated_violations_strictly_increase() {
        let detector = detector();
        let identity = client();

        let mut at = NOW;
        let mut previous = 0;
        for _ in 0..4 {
            let state = detector.block(&identity, "test", at).await.unwrap();
            let duration = state.blocked_until - at;
            assert!(duration > previous);
            previous = duration;

            // A clean request in between does not reset the history
            let mut profile = AnomalyProfile::default();
            profile.observe(&browser("/", at), Some("abcd"), 50);
            let verdict = detector
                .analyze_and_block(&identity, &browser("/", at), &profile, None)
                .await
                .unwrap();
            assert!(!verdict.blocked);

            at = state.blocked_until;
        }
    }

    #[tokio::test]
    async fn test_violation_during_block_does_not_escalate() {
        let detector = detector();
        let identity = client();
        let first = detector.block(&identity, "scanner", NOW).await.unwrap();
        let again = detector.block(&identity, "scanner", NOW + 10_000).await.unwrap();
        assert_eq!(again, first);

        let next = detector.block(&identity, "scanner", first.blocked_until).await.unwrap();
        assert_eq!(next.violation_count, 2);
        assert_eq!(next.blocked_until - first.blocked_until, 600_000);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_burst_is_one_violation() {
        let detector = detector();
        let identity = client();
        let mut ctx = browser("/../../etc/passwd", NOW);
        ctx.user_agent = Some("nikto".into());
        let profile = detector.record_request(&identity, &ctx).await.unwrap();

        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..10 {
            let (detector, identity, ctx, profile) =
                (detector.clone(), identity.clone(), ctx.clone(), profile.clone());
            tasks.spawn(async move {
                detector
                    .analyze_and_block(&identity, &ctx, &profile, None)
                    .await
                    .unwrap()
            });
        }

        while let Some(verdict) = tasks.join_next().await {
            let verdict = verdict.unwrap();
            assert!(verdict.blocked);
            assert_eq!(verdict.violation_count, Some(1));
            assert_eq!(verdict.blocked_until, Some(NOW + 300_000));
        }
        let state = detector.check_block(&identity, NOW + 1).await.unwrap().unwrap();
        assert_eq!(state.violation_count, 1);
    }

    #[tokio::test]
    async fn test_lookback_slides_with_each_violation() {
        let config = AnomalyConfig {
            lookback_secs: 1,
            ..AnomalyConfig::default()
        };
        let detector = AnomalyDetector::new(
            Arc::new(MemoryStore::new()),
            KeySpace::new("test"),
            config,
            Arc::new(SignatureSet::builtin().unwrap()),
        );
        let identity = client();

        // Each violation lands within a second of the previous one, though
        // the third is past a second from the first.
        let mut counts = Vec::new();
        for at in [NOW, NOW + 700, NOW + 1_200] {
            counts.push(detector.block(&identity, "test", at).await.unwrap().violation_count);
            detector.unblock(identity.key()).await.unwrap();
        }
        assert_eq!(counts, vec![1, 2, 3]);

        // A quiet lookback starts over
        let state = detector.block(&identity, "test", NOW + 2_201).await.unwrap();
        assert_eq!(state.violation_count, 1);
    }

    #[test]
    fn test_history_next_count() {
        let history = ViolationHistory {
            count: 2,
            last_violation_at: NOW,
        };
        assert_eq!(history.next_count(NOW + 1_000, 1_000), 3);
        assert_eq!(history.next_count(NOW + 1_001, 1_000), 1);
        assert_eq!(ViolationHistory::default().next_count(NOW, 1_000), 1);
    }

    #[tokio::test]
    async fn test_analyze_and_block_over_threshold() {
        let detector = detector();
        let identity = client();
        let mut ctx = browser("/../../etc/passwd", NOW);
        ctx.user_agent = Some("nikto".into());
        let profile = detector.record_request(&identity, &ctx).await.unwrap();

        let verdict = detector.analyze_and_block(&identity, &ctx, &profile, None).await.unwrap();
        assert!(verdict.blocked);
        assert_eq!(verdict.violation_count, Some(1));
        assert!(detector.check_block(&identity, NOW + 1).await.unwrap().is_some());

        assert!(detector.unblock(identity.key()).await.unwrap());
        assert!(detector.check_block(&identity, NOW + 1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_error_ratio_signal() {
        let detector = detector();
        let identity = client();
        let mut profile = AnomalyProfile::default();
        for i in 0..10u64 {
            profile.observe(&browser("/api/x", NOW - 10_000 + i * 1000), None, 50);
            detector.record_outcome(&identity, 404).await.unwrap();
        }
        detector.record_outcome(&identity, 200).await.unwrap();

        let verdict = detector
            .analyze_and_block(&identity, &browser("/api/x", NOW), &profile, None)
            .await
            .unwrap();
        assert!(verdict.reasons.iter().any(|r| r.starts_with("error_ratio")));
        assert_eq!(verdict.score, 20);
    }

    #[tokio::test]
    async fn test_record_request_persists_profile() {
        let detector = detector();
        let identity = client();
        detector.record_request(&identity, &browser("/a", NOW)).await.unwrap();
        let profile = detector.record_request(&identity, &browser("/b", NOW + 5)).await.unwrap();
        assert_eq!(profile.entries.len(), 2);
        assert_eq!(profile.entries.back().unwrap().path, "/b");
    }
}
