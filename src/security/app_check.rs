//! App attestation header gate.
//!
//! Only presence is checked here; verifying the token is the upstream's job.

use axum::http::HeaderMap;

use crate::config::{AppCheckConfig, AppCheckMode};
use crate::security::endpoint::prefix_matches;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppCheckOutcome {
    /// Header present, path unprotected, or gate off.
    Pass,
    /// Header missing in lenient mode: let through, record it.
    MissingAllowed,
    /// Header missing in strict mode.
    Denied,
}

#[derive(Debug, Clone)]
pub struct AppCheckGate {
    config: AppCheckConfig,
}

impl AppCheckGate {
    pub fn new(config: AppCheckConfig) -> Self {
        Self { config }
    }

    pub fn check(&self, path: &str, headers: &HeaderMap) -> AppCheckOutcome {
        if self.config.mode == AppCheckMode::Off
            || !self
                .config
                .protected_paths
                .iter()
                .any(|p| prefix_matches(path, p))
        {
            return AppCheckOutcome::Pass;
        }

        let present = headers
            .get(self.config.header_name.as_str())
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| !v.trim().is_empty());
        match (present, self.config.mode) {
            (true, _) => AppCheckOutcome::Pass,
            (false, AppCheckMode::Strict) => AppCheckOutcome::Denied,
            (false, _) => AppCheckOutcome::MissingAllowed,
        }
    }
}
