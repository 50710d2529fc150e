//! Security subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming request:
//!     → pipeline.rs (static bypass, nonce)
//!     → identity.rs (client address, fingerprint)
//!     → anomaly.rs block lookup ┐ concurrently; an active block wins
//!     → rate_limit.rs           ┘ (endpoint.rs picks the class)
//!     → app_check.rs (attestation header presence)
//!     → csrf.rs (unsafe methods; cookie issue/rotation)
//!     → ip_intel.rs          ┐ concurrently, then
//!     → anomaly.rs profile   ┘ score and maybe block
//!     → upstream
//!     → headers.rs (CSP with nonce, hardening headers on every response)
//! ```
//!
//! # Design Decisions
//! - Cross-request state lives in the shared store, never in this process
//! - Every deny writes a security event before the response is returned
//! - Store failures follow an explicit fail-open / fail-closed policy

pub mod anomaly;
pub mod app_check;
pub mod csrf;
pub mod endpoint;
pub mod error;
pub mod headers;
pub mod identity;
pub mod ip_intel;
pub mod pipeline;
pub mod rate_limit;
pub mod signatures;

pub use error::SecurityError;
pub use pipeline::{guard_middleware, Guard, GuardHandle};

/// Current wall-clock time in unix milliseconds.
pub fn unix_millis() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or(0)
}
